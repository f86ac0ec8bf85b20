//! # ferrocomm
//!
//! Communicator lifecycle and hierarchy management for a message-passing
//! runtime, plus the optional background progress thread.
//!
//! This crate owns how communicators are born, decomposed, shared and
//! reclaimed:
//! - Explicit reference counting with a single, deterministic deletion
//! - Node-aware decomposition into node-local and node-roots sub-communicators
//! - Mapping descriptors consumed by the transport when a communicator is set up
//! - `split`, `split_type` (shared memory, hardware, neighborhood) and
//!   group-based creation, duplication and intercommunicators
//! - A registry of per-communicator tuning hints with cross-rank agreement
//! - An async progress thread with topology-aware CPU affinity
//!
//! The transport and the placement information are collaborators behind the
//! [`Device`] and [`Topology`] traits. [`loopback`] implements both for a job
//! simulated inside one process.
//!
//! ## Quick Start
//!
//! ```
//! use ferrocomm::loopback::LoopbackFabric;
//! use ferrocomm::{Runtime, RuntimeConfig, ThreadLevel};
//!
//! fn main() -> Result<(), ferrocomm::Error> {
//!     let fabric = LoopbackFabric::single_node(1);
//!     let rt = Runtime::init_thread(
//!         ThreadLevel::Single,
//!         RuntimeConfig::default(),
//!         fabric.device(0),
//!         fabric.topology(0),
//!     )?;
//!
//!     let world = rt.world();
//!     println!("Hello from rank {} of {}", world.rank(), world.size());
//!
//!     let half = world.split((world.rank() % 2) as i32, 0)?;
//!     if let Some(half) = half {
//!         assert_eq!(half.rank(), 0);
//!         half.release()?;
//!     }
//!
//!     rt.finalize()
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `FERROCOMM_ASYNC_PROGRESS` | Start the background progress thread |
//! | `FERROCOMM_PROGRESS_THREAD_AFFINITY` | Processor list for progress threads |
//! | `FERROCOMM_PROGRESS_CPUS_PER_PROCESS` | Processors per progress thread |
//! | `FERROCOMM_NUM_CLIQUES` | Virtual nodes per physical node |
//! | `FERROCOMM_ODD_EVEN_CLIQUES` | Two virtual nodes per node by rank parity |
//!
//! See [`RuntimeConfig`] for details.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow certain pedantic lints for existing code
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]

mod comm;
mod config;
mod context_id;
mod create;
mod device;
mod error;
mod group;
mod handle;
mod hierarchy;
mod hint;
mod info;
pub mod loopback;
mod map;
mod progress;
mod registry;
mod split;
mod topology;

pub use comm::{Comm, CommBuilder, CommKind, MAX_OBJECT_NAME};
pub use config::{
    parse_bool, RuntimeConfig, ENV_ASYNC_PROGRESS, ENV_NUM_CLIQUES, ENV_ODD_EVEN_CLIQUES,
    ENV_PROGRESS_CPUS_PER_PROCESS, ENV_PROGRESS_THREAD_AFFINITY,
};
pub use context_id::{ContextId, ContextIdPool, ContextLease, SubcommKind, MAX_CONTEXT_PREFIXES};
pub use device::{Device, Scope};
pub use error::{status_code, Error, ErrorClass, Result};
pub use group::{Group, Lpid};
pub use handle::{CommHandle, N_BUILTIN};
pub use hierarchy::{Hierarchy, HierarchyKind, NodeLayout, NodeTables};
pub use hint::{
    predefined, HintAttr, HintDescriptor, HintId, HintRegistry, HintType, HintValidator,
    HINT_MAX,
};
pub use info::{Info, INFO_KEY_MAX_LEN, INFO_VALUE_MAX_LEN};
pub use map::{resolve as resolve_mapping, CommMap, MapDir, MapKind, Mapping};
pub use progress::{
    compute_affinity, default_affinity, parse_affinity, AffinityPlan, AsyncProgress,
    ProgressLayout, ProgressState,
};
pub use split::{
    split_order, ByNode, CommonDirectory, HwResource, NetworkDomain, SelfColor, SplitStrategy,
    SplitType, HW_RESOURCE_SHARED_MEMORY, INFO_HW_RESOURCE_TYPE, INFO_NBHD_COMMON_DIRNAME,
    INFO_NBHD_NETWORK, INFO_SHMEM_TOPO, UNDEFINED,
};
pub use topology::{NodeId, NodeMap, Topology};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use context_id::{ICOMM_WORLD_PREFIX, SELF_PREFIX, WORLD_PREFIX};
use handle::HandleAllocator;
use registry::CommRegistry;

/// Thread support levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ThreadLevel {
    /// Only single-threaded execution
    Single = 0,
    /// Multi-threaded, but runtime calls only from main thread
    Funneled = 1,
    /// Multi-threaded, but runtime calls serialized by user
    Serialized = 2,
    /// Full multi-threaded support
    Multiple = 3,
}

/// State shared by a runtime and every communicator it created.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) thread_level: ThreadLevel,
    pub(crate) device: Arc<dyn Device>,
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) node_map: NodeMap,
    pub(crate) my_lpid: Lpid,
    pub(crate) registry: CommRegistry,
    pub(crate) context_ids: Arc<ContextIdPool>,
    pub(crate) hints: HintRegistry,
    pub(crate) handles: HandleAllocator,
    pub(crate) global_cs: Arc<Mutex<()>>,
    seq: AtomicU32,
}

impl Shared {
    pub(crate) fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// Process-wide runtime state.
///
/// Created by [`init_thread`](Self::init_thread), which builds the builtin
/// communicators (world, self and a private duplicate of world) and starts
/// the async progress thread if configured. Finalized by
/// [`finalize`](Self::finalize) or on drop.
///
/// Each simulated process of a [`loopback`] job has its own `Runtime`.
pub struct Runtime {
    shared: Arc<Shared>,
    world: Arc<Comm>,
    self_comm: Arc<Comm>,
    icomm_world: Arc<Comm>,
    progress: Mutex<AsyncProgress>,
    finalized: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("rank", &self.world.rank())
            .field("size", &self.world.size())
            .field("thread_level", &self.shared.thread_level)
            .field("live_comms", &self.shared.registry.len())
            .finish()
    }
}

impl Runtime {
    /// Initialize the runtime with the specified thread support level.
    ///
    /// # Arguments
    ///
    /// * `required` - The thread support level required (always provided)
    /// * `config` - Runtime settings, usually [`RuntimeConfig::from_env`]
    /// * `device` - The transport collaborator of this process
    /// * `topology` - Placement information for this process
    ///
    /// # Errors
    ///
    /// Fails if the topology is inconsistent, if building a builtin
    /// communicator fails, or if the progress thread cannot be set up as
    /// configured (e.g. a malformed affinity list).
    pub fn init_thread(
        required: ThreadLevel,
        config: RuntimeConfig,
        device: Arc<dyn Device>,
        topology: Arc<dyn Topology>,
    ) -> Result<Self> {
        let size = topology.world_size();
        let rank = topology.world_rank();
        if rank >= size {
            return Err(Error::Config(format!(
                "world rank {rank} outside a world of {size}"
            )));
        }

        let node_map =
            NodeMap::from_topology(topology.as_ref(), config.num_cliques, config.odd_even_cliques);
        let shared = Arc::new(Shared {
            thread_level: required,
            device,
            topology,
            node_map,
            my_lpid: rank as Lpid,
            registry: CommRegistry::new(),
            context_ids: ContextIdPool::new(),
            hints: HintRegistry::with_predefined(),
            handles: HandleAllocator::new(),
            global_cs: Arc::new(Mutex::new(())),
            seq: AtomicU32::new(0),
            config,
        });

        let world_lpids: Vec<Lpid> = (0..size as Lpid).collect();
        let world = CommBuilder::builtin(&shared, CommHandle::WORLD)
            .borrowed_context(ContextId::from_prefix(WORLD_PREFIX))
            .members(world_lpids.clone(), None)
            .name("COMM_WORLD")
            .commit()?;
        let self_comm = CommBuilder::builtin(&shared, CommHandle::SELF)
            .borrowed_context(ContextId::from_prefix(SELF_PREFIX))
            .members(vec![rank as Lpid], None)
            .name("COMM_SELF")
            .commit()?;
        let icomm_world = CommBuilder::builtin(&shared, CommHandle::ICOMM_WORLD)
            .borrowed_context(ContextId::from_prefix(ICOMM_WORLD_PREFIX))
            .members(world_lpids, None)
            .name("ICOMM_WORLD")
            .commit()?;

        let mut progress = AsyncProgress::new();
        progress.initialize(
            &shared.config,
            required,
            &ProgressLayout::from_world(&world),
            Arc::clone(&shared.device),
            Arc::clone(&shared.global_cs),
        )?;

        tracing::debug!(
            rank,
            size,
            thread_level = ?required,
            node_count = world.node_count(),
            "runtime initialized"
        );
        Ok(Runtime {
            shared,
            world,
            self_comm,
            icomm_world,
            progress: Mutex::new(progress),
            finalized: AtomicBool::new(false),
        })
    }

    /// Get the thread support level that was provided.
    pub fn thread_level(&self) -> ThreadLevel {
        self.shared.thread_level
    }

    /// Settings the runtime was initialized with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// The world communicator.
    pub fn world(&self) -> &Arc<Comm> {
        &self.world
    }

    /// The communicator holding only this process.
    pub fn self_comm(&self) -> &Arc<Comm> {
        &self.self_comm
    }

    /// Node of every world process, after clique partitioning.
    pub fn node_map(&self) -> &NodeMap {
        &self.shared.node_map
    }

    /// Resolve a handle to a live communicator.
    ///
    /// [`CommHandle::PREINIT_WORLD`] resolves to world.
    pub fn comm(&self, handle: CommHandle) -> Result<Arc<Comm>> {
        if handle == CommHandle::PREINIT_WORLD {
            return Ok(Arc::clone(&self.world));
        }
        self.shared
            .registry
            .get(handle)
            .ok_or(Error::InvalidCommunicator)
    }

    /// Start building a communicator by hand.
    ///
    /// The builder needs a context id ([`allocate_context`](Self::allocate_context)),
    /// members (mapper entries or explicit) and a [`commit`](CommBuilder::commit).
    pub fn create_comm(&self) -> Result<CommBuilder> {
        CommBuilder::new(&self.shared)
    }

    /// Agree on a fresh context id with every member of `comm`. Collective.
    pub fn allocate_context(&self, comm: &Comm) -> Result<ContextLease> {
        let scope = match comm.kind() {
            CommKind::Intra => comm.scope(),
            CommKind::Inter => {
                return Err(Error::NotSupported(
                    "context agreement over an intercommunicator".into(),
                ))
            }
        };
        self.shared
            .context_ids
            .allocate(self.shared.device.as_ref(), &scope)
    }

    /// Install a hint; see [`HintRegistry::register`].
    pub fn register_hint(
        &self,
        id: Option<HintId>,
        name: &str,
        validator: Option<HintValidator>,
        ty: HintType,
        attr: HintAttr,
        default: i32,
    ) -> Result<HintId> {
        let _cs = self.shared.global_cs.lock();
        self.shared
            .hints
            .register(id, name, validator, ty, attr, default)
    }

    /// The hint table.
    pub fn hints(&self) -> &HintRegistry {
        &self.shared.hints
    }

    /// Enter the global critical section shared with the progress thread.
    pub fn critical_section(&self) -> MutexGuard<'_, ()> {
        self.shared.global_cs.lock()
    }

    /// Number of live communicators, builtins and sub-communicators included.
    pub fn live_comms(&self) -> usize {
        self.shared.registry.len()
    }

    /// Handles of every live communicator.
    pub fn live_handles(&self) -> Vec<CommHandle> {
        self.shared.registry.handles()
    }

    /// Lifecycle state of the async progress thread.
    pub fn progress_state(&self) -> ProgressState {
        self.progress.lock().state()
    }

    /// Affinity of the async progress thread, if one was started.
    pub fn progress_affinity(&self) -> Option<AffinityPlan> {
        self.progress.lock().plan().cloned()
    }

    /// Shut the runtime down.
    ///
    /// Stops the progress thread, releases the builtin communicators and
    /// reports communicators the application never released.
    pub fn finalize(self) -> Result<()> {
        self.finalize_inner()
    }

    fn finalize_inner(&self) -> Result<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_err: Option<Error> = None;

        if let Err(e) = self.progress.lock().finalize() {
            first_err.get_or_insert(e);
        }
        for comm in [&self.icomm_world, &self.self_comm, &self.world] {
            if let Err(e) = comm.release_always() {
                first_err.get_or_insert(e);
            }
        }

        let leaked = self.shared.registry.handles();
        if !leaked.is_empty() {
            tracing::warn!(
                count = leaked.len(),
                handles = ?leaked,
                "communicators still live at finalize"
            );
        }
        self.shared.registry.clear();
        tracing::debug!(rank = self.world.rank(), "runtime finalized");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.finalize_inner() {
            tracing::error!(error = %e, "error while finalizing runtime");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackFabric;

    fn init(config: RuntimeConfig, level: ThreadLevel) -> Result<Runtime> {
        let fabric = LoopbackFabric::single_node(1);
        Runtime::init_thread(level, config, fabric.device(0), fabric.topology(0))
    }

    #[test]
    fn builtins_exist_after_init() {
        let rt = init(RuntimeConfig::default(), ThreadLevel::Funneled).unwrap();
        assert_eq!(rt.thread_level(), ThreadLevel::Funneled);
        assert_eq!(rt.world().handle(), CommHandle::WORLD);
        assert_eq!(rt.self_comm().size(), 1);
        assert_eq!(rt.world().name(), "COMM_WORLD");
        assert_eq!(rt.live_comms(), N_BUILTIN);
        assert_eq!(rt.world().hierarchy_kind(), HierarchyKind::Flat);
        assert_eq!(rt.progress_state(), ProgressState::Uninitialized);
        rt.finalize().unwrap();
    }

    #[test]
    fn inconsistent_topology_is_rejected() {
        struct Broken;
        impl Topology for Broken {
            fn world_size(&self) -> usize {
                2
            }
            fn world_rank(&self) -> usize {
                5
            }
            fn node_id(&self, _: Lpid) -> Option<NodeId> {
                Some(0)
            }
        }
        let fabric = LoopbackFabric::single_node(2);
        let err = Runtime::init_thread(
            ThreadLevel::Single,
            RuntimeConfig::default(),
            fabric.device(0),
            Arc::new(Broken),
        )
        .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Config);
    }

    #[test]
    fn async_progress_lifecycle() {
        let config = RuntimeConfig {
            async_progress: true,
            ..RuntimeConfig::default()
        };
        let rt = init(config.clone(), ThreadLevel::Multiple).unwrap();
        assert_eq!(rt.progress_state(), ProgressState::Running);
        assert!(rt.progress_affinity().is_some());
        {
            let _cs = rt.critical_section();
        }
        rt.finalize().unwrap();

        // without full thread support the request is ignored
        let rt = init(config, ThreadLevel::Serialized).unwrap();
        assert_eq!(rt.progress_state(), ProgressState::Uninitialized);
    }

    #[test]
    fn malformed_affinity_fails_init() {
        let config = RuntimeConfig {
            async_progress: true,
            progress_thread_affinity: Some("zero".into()),
            ..RuntimeConfig::default()
        };
        let err = init(config, ThreadLevel::Multiple).unwrap_err();
        assert!(matches!(err, Error::InvalidAffinity(_)));
    }

    #[test]
    fn finalize_reports_but_survives_leaks() {
        let rt = init(RuntimeConfig::default(), ThreadLevel::Single).unwrap();
        let leaked = rt.world().dup(None).unwrap();
        rt.finalize().unwrap();
        assert!(leaked.is_valid());
    }
}
