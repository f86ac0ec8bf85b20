//! In-process fabric simulating a multi-rank job.
//!
//! A [`LoopbackFabric`] connects `n` simulated ranks living in one process
//! (typically one thread each). Each rank gets its own [`LoopbackDevice`] and
//! [`LoopbackTopology`] and runs its own [`Runtime`](crate::Runtime).
//!
//! Collectives rendezvous on a shared table keyed by the communicator (its
//! context id and leader) and a per-communicator operation counter; point to
//! point messages go through a mailbox keyed by `(scope, source, destination,
//! tag)`.
//!
//! ```
//! use ferrocomm::loopback::LoopbackFabric;
//! use ferrocomm::{Runtime, RuntimeConfig, ThreadLevel};
//!
//! let fabric = LoopbackFabric::uniform(2, 2);
//! let handles: Vec<_> = (0..4)
//!     .map(|rank| {
//!         let fabric = fabric.clone();
//!         std::thread::spawn(move || {
//!             let rt = Runtime::init_thread(
//!                 ThreadLevel::Single,
//!                 RuntimeConfig::default(),
//!                 fabric.device(rank),
//!                 fabric.topology(rank),
//!             )
//!             .unwrap();
//!             let size = rt.world().node_comm().map(|c| c.size());
//!             rt.finalize().unwrap();
//!             size
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     assert_eq!(h.join().unwrap(), Some(2));
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::comm::{Comm, CommBuilder};
use crate::context_id::ContextId;
use crate::device::{Device, Scope};
use crate::error::{Error, Result};
use crate::group::Lpid;
use crate::handle::CommHandle;
use crate::map;
use crate::topology::{NodeId, Topology};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity of a group taking part in a collective.
type Side = (ContextId, Lpid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScopeKey {
    Intra(Side),
    Inter(Side, Side),
}

/// Rendezvous key and the caller's side (0 or 1).
fn scope_key(scope: &Scope) -> (ScopeKey, usize) {
    match *scope {
        Scope::Intra {
            context_id, leader, ..
        } => (ScopeKey::Intra((context_id, leader)), 0),
        Scope::Inter {
            context_id,
            recv_context_id,
            local_leader,
            remote_leader,
            ..
        } => {
            let mine = (recv_context_id, local_leader);
            let theirs = (context_id, remote_leader);
            if mine <= theirs {
                (ScopeKey::Inter(mine, theirs), 0)
            } else {
                (ScopeKey::Inter(theirs, mine), 1)
            }
        }
    }
}

#[derive(Debug)]
struct Exchange {
    sides: [Vec<Option<Vec<i64>>>; 2],
    readers_left: usize,
}

impl Exchange {
    fn complete(&self, side: usize) -> bool {
        self.sides[side].iter().all(Option::is_some)
    }

    fn collect(&self, side: usize) -> Vec<i64> {
        self.sides[side].iter().flatten().flatten().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MailKey {
    scope: ScopeKey,
    src: usize,
    dst: usize,
    tag: i32,
}

#[derive(Debug, Default)]
struct TopologyData {
    hw: HashMap<(usize, String), u32>,
    hw_levels: Vec<String>,
    directories: HashMap<(usize, String), u32>,
    networks: HashMap<(usize, String), u32>,
}

#[derive(Debug)]
struct Fabric {
    node_ids: Vec<Option<NodeId>>,
    topology: RwLock<TopologyData>,
    exchanges: Mutex<HashMap<(ScopeKey, u64), Exchange>>,
    arrived: Condvar,
    mailbox: DashMap<MailKey, VecDeque<Vec<i64>>>,
    timeout: Duration,
}

/// A simulated job: node placement plus the shared rendezvous tables.
#[derive(Debug, Clone)]
pub struct LoopbackFabric {
    inner: Arc<Fabric>,
}

impl LoopbackFabric {
    /// A job with one process per entry of `node_ids` (`None` = unknown node).
    pub fn new(node_ids: Vec<Option<NodeId>>) -> Self {
        LoopbackFabric {
            inner: Arc::new(Fabric {
                node_ids,
                topology: RwLock::new(TopologyData::default()),
                exchanges: Mutex::new(HashMap::new()),
                arrived: Condvar::new(),
                mailbox: DashMap::new(),
                timeout: DEFAULT_TIMEOUT,
            }),
        }
    }

    /// `size` processes on one node.
    pub fn single_node(size: usize) -> Self {
        Self::new(vec![Some(0); size])
    }

    /// `nodes` nodes of `per_node` consecutive ranks each.
    pub fn uniform(nodes: usize, per_node: usize) -> Self {
        Self::new(
            (0..nodes * per_node)
                .map(|r| Some((r / per_node) as NodeId))
                .collect(),
        )
    }

    /// Number of simulated processes.
    pub fn size(&self) -> usize {
        self.inner.node_ids.len()
    }

    /// Bind `rank` to index `index` of hardware resource `resource_type`.
    pub fn with_hw_resource(self, rank: usize, resource_type: &str, index: u32) -> Self {
        self.inner
            .topology
            .write()
            .hw
            .insert((rank, resource_type.to_string()), index);
        self
    }

    /// Hardware levels below the node, coarsest first.
    pub fn with_hw_levels(self, levels: &[&str]) -> Self {
        self.inner.topology.write().hw_levels = levels.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Filesystem id behind `dirname` as seen by `rank`.
    pub fn with_directory(self, rank: usize, dirname: &str, id: u32) -> Self {
        self.inner
            .topology
            .write()
            .directories
            .insert((rank, dirname.to_string()), id);
        self
    }

    /// Network domain of `rank` at `level`.
    pub fn with_network(self, rank: usize, level: &str, id: u32) -> Self {
        self.inner
            .topology
            .write()
            .networks
            .insert((rank, level.to_string()), id);
        self
    }

    /// Device endpoint of `rank`.
    pub fn device(&self, rank: usize) -> Arc<LoopbackDevice> {
        Arc::new(LoopbackDevice {
            rank,
            fabric: Arc::clone(&self.inner),
            op_counters: Mutex::new(HashMap::new()),
            progress_calls: AtomicU64::new(0),
            create_hooks: AtomicUsize::new(0),
            free_hooks: AtomicUsize::new(0),
            addresses: DashMap::new(),
        })
    }

    /// Topology view of `rank`.
    pub fn topology(&self, rank: usize) -> Arc<LoopbackTopology> {
        Arc::new(LoopbackTopology {
            rank,
            fabric: Arc::clone(&self.inner),
        })
    }
}

/// One rank's device endpoint.
#[derive(Debug)]
pub struct LoopbackDevice {
    rank: usize,
    fabric: Arc<Fabric>,
    op_counters: Mutex<HashMap<ScopeKey, u64>>,
    progress_calls: AtomicU64,
    create_hooks: AtomicUsize,
    free_hooks: AtomicUsize,
    addresses: DashMap<CommHandle, Vec<Lpid>>,
}

impl LoopbackDevice {
    /// World rank of this endpoint.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of progress rounds made so far.
    pub fn progress_calls(&self) -> u64 {
        self.progress_calls.load(Ordering::Relaxed)
    }

    /// Number of communicators set up by the create hook.
    pub fn create_hooks(&self) -> usize {
        self.create_hooks.load(Ordering::Relaxed)
    }

    /// Number of communicators torn down by the free hook.
    pub fn free_hooks(&self) -> usize {
        self.free_hooks.load(Ordering::Relaxed)
    }

    /// Members resolved from the mapper of communicator `handle`, while it lives.
    pub fn resolved_members(&self, handle: CommHandle) -> Option<Vec<Lpid>> {
        self.addresses.get(&handle).map(|e| e.value().clone())
    }

    fn next_op(&self, key: ScopeKey) -> u64 {
        let mut counters = self.op_counters.lock();
        let seq = counters.entry(key).or_insert(0);
        *seq += 1;
        *seq
    }

    fn timed_out(&self, what: &str) -> Error {
        Error::device(-1, format!("rank {}: {what} timed out", self.rank))
    }

    /// Deposit `send` and wait for the contributions of the other `side`.
    fn rendezvous(&self, scope: &Scope, send: &[i64]) -> Result<Vec<i64>> {
        let (key, side) = scope_key(scope);
        let op = self.next_op(key);
        let (mine, theirs, read_side) = match *scope {
            Scope::Intra { size, .. } => (size, 0, side),
            Scope::Inter {
                local_size,
                remote_size,
                ..
            } => (local_size, remote_size, 1 - side),
        };
        let rank = scope.rank();
        let deadline = Instant::now() + self.fabric.timeout;

        let mut table = self.fabric.exchanges.lock();
        let entry = table.entry((key, op)).or_insert_with(|| {
            let mut sides = [Vec::new(), Vec::new()];
            sides[side] = vec![None; mine];
            sides[1 - side] = vec![None; theirs];
            Exchange {
                sides,
                readers_left: mine + theirs,
            }
        });
        let slot = entry.sides[side]
            .get_mut(rank)
            .ok_or(Error::InvalidRank(rank as i32))?;
        if slot.is_some() {
            return Err(Error::Internal(format!(
                "rank {rank} contributed twice to one collective"
            )));
        }
        *slot = Some(send.to_vec());
        self.fabric.arrived.notify_all();

        loop {
            let Some(entry) = table.get_mut(&(key, op)) else {
                return Err(Error::Internal("collective vanished".into()));
            };
            if entry.complete(read_side) {
                let result = entry.collect(read_side);
                entry.readers_left -= 1;
                if entry.readers_left == 0 {
                    table.remove(&(key, op));
                }
                return Ok(result);
            }
            if self
                .fabric
                .arrived
                .wait_until(&mut table, deadline)
                .timed_out()
            {
                return Err(self.timed_out("collective"));
            }
        }
    }
}

impl Device for LoopbackDevice {
    fn comm_create_hook(&self, comm: &CommBuilder) -> Result<()> {
        self.create_hooks.fetch_add(1, Ordering::Relaxed);
        if !comm.mapper().is_empty() {
            let (local, _) = map::resolve(comm.mapper())?;
            self.addresses.insert(comm.handle(), local);
        }
        Ok(())
    }

    fn comm_free_hook(&self, comm: &Comm) -> Result<()> {
        self.free_hooks.fetch_add(1, Ordering::Relaxed);
        self.addresses.remove(&comm.handle());
        // the next communicator with this identity starts counting afresh
        let (key, _) = scope_key(&comm.scope());
        self.op_counters.lock().remove(&key);
        Ok(())
    }

    fn allgather(&self, scope: &Scope, send: &[i64]) -> Result<Vec<i64>> {
        self.rendezvous(scope, send)
    }

    fn bcast(&self, scope: &Scope, root: usize, buf: &mut Vec<i64>) -> Result<()> {
        if !matches!(scope, Scope::Intra { .. }) {
            return Err(Error::NotSupported("broadcast over an intercommunicator".into()));
        }
        let send = if scope.rank() == root {
            buf.clone()
        } else {
            Vec::new()
        };
        *buf = self.rendezvous(scope, &send)?;
        Ok(())
    }

    fn sendrecv(&self, scope: &Scope, peer: usize, tag: i32, send: &[i64]) -> Result<Vec<i64>> {
        let (key, _) = scope_key(scope);
        let me = scope.rank();
        self.fabric
            .mailbox
            .entry(MailKey {
                scope: key,
                src: me,
                dst: peer,
                tag,
            })
            .or_default()
            .push_back(send.to_vec());

        let from_peer = MailKey {
            scope: key,
            src: peer,
            dst: me,
            tag,
        };
        let deadline = Instant::now() + self.fabric.timeout;
        loop {
            if let Some(msg) = self
                .fabric
                .mailbox
                .get_mut(&from_peer)
                .and_then(|mut q| q.pop_front())
            {
                return Ok(msg);
            }
            if Instant::now() >= deadline {
                return Err(self.timed_out("sendrecv"));
            }
            thread::yield_now();
        }
    }

    fn progress_test(&self) -> Result<()> {
        self.progress_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One rank's view of the simulated placement.
#[derive(Debug)]
pub struct LoopbackTopology {
    rank: usize,
    fabric: Arc<Fabric>,
}

impl Topology for LoopbackTopology {
    fn world_size(&self) -> usize {
        self.fabric.node_ids.len()
    }

    fn world_rank(&self) -> usize {
        self.rank
    }

    fn node_id(&self, lpid: Lpid) -> Option<NodeId> {
        self.fabric.node_ids.get(lpid as usize).copied().flatten()
    }

    fn hw_resource(&self, resource_type: &str) -> Option<u32> {
        self.fabric
            .topology
            .read()
            .hw
            .get(&(self.rank, resource_type.to_string()))
            .copied()
    }

    fn hw_levels(&self) -> Vec<String> {
        self.fabric.topology.read().hw_levels.clone()
    }

    fn common_directory(&self, dirname: &str) -> Option<u32> {
        self.fabric
            .topology
            .read()
            .directories
            .get(&(self.rank, dirname.to_string()))
            .copied()
    }

    fn network_domain(&self, level: &str) -> Option<u32> {
        self.fabric
            .topology
            .read()
            .networks
            .get(&(self.rank, level.to_string()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<T: Send + 'static>(
        fabric: &LoopbackFabric,
        f: impl Fn(Arc<LoopbackDevice>) -> T + Send + Sync + 'static,
    ) -> Vec<T> {
        let f = Arc::new(f);
        let handles: Vec<_> = (0..fabric.size())
            .map(|rank| {
                let device = fabric.device(rank);
                let f = Arc::clone(&f);
                thread::spawn(move || f(device))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn world_scope(rank: usize, size: usize) -> Scope {
        Scope::intra(ContextId::from_prefix(0), rank, size, 0)
    }

    #[test]
    fn allgather_orders_by_rank() {
        let fabric = LoopbackFabric::single_node(4);
        let results = run(&fabric, |dev| {
            let scope = world_scope(dev.rank(), 4);
            let first = dev.allgather(&scope, &[dev.rank() as i64]).unwrap();
            let second = dev.allgather(&scope, &[10 * dev.rank() as i64]).unwrap();
            (first, second)
        });
        for (first, second) in results {
            assert_eq!(first, vec![0, 1, 2, 3]);
            assert_eq!(second, vec![0, 10, 20, 30]);
        }
    }

    #[test]
    fn bcast_delivers_root_buffer() {
        let fabric = LoopbackFabric::single_node(3);
        let results = run(&fabric, |dev| {
            let scope = world_scope(dev.rank(), 3);
            let mut buf = if dev.rank() == 1 { vec![7, 8] } else { Vec::new() };
            dev.bcast(&scope, 1, &mut buf).unwrap();
            buf
        });
        assert!(results.iter().all(|b| *b == vec![7, 8]));
    }

    #[test]
    fn inter_allgather_returns_remote_side() {
        let fabric = LoopbackFabric::single_node(3);
        let results = run(&fabric, |dev| {
            // ranks 0,1 form group A (recv ctx 8); rank 2 forms group B (recv ctx 16)
            let in_a = dev.rank() < 2;
            let scope = Scope::Inter {
                context_id: ContextId::from_raw(if in_a { 16 } else { 8 }),
                recv_context_id: ContextId::from_raw(if in_a { 8 } else { 16 }),
                rank: if in_a { dev.rank() } else { 0 },
                local_size: if in_a { 2 } else { 1 },
                remote_size: if in_a { 1 } else { 2 },
                local_leader: if in_a { 0 } else { 2 },
                remote_leader: if in_a { 2 } else { 0 },
            };
            dev.allgather(&scope, &[dev.rank() as i64]).unwrap()
        });
        assert_eq!(results[0], vec![2]);
        assert_eq!(results[1], vec![2]);
        assert_eq!(results[2], vec![0, 1]);
    }

    #[test]
    fn sendrecv_pairs_peers() {
        let fabric = LoopbackFabric::single_node(2);
        let results = run(&fabric, |dev| {
            let scope = world_scope(dev.rank(), 2);
            let peer = 1 - dev.rank();
            dev.sendrecv(&scope, peer, 5, &[dev.rank() as i64 + 100]).unwrap()
        });
        assert_eq!(results, vec![vec![101], vec![100]]);
    }

    #[test]
    fn topology_lookups() {
        let fabric = LoopbackFabric::uniform(2, 2)
            .with_hw_resource(1, "socket", 3)
            .with_hw_levels(&["socket", "l3cache"])
            .with_directory(0, "/scratch", 9)
            .with_network(1, "switch", 4);
        let t0 = fabric.topology(0);
        let t1 = fabric.topology(1);
        assert_eq!(t1.node_id(3), Some(1));
        assert_eq!(t1.hw_resource("socket"), Some(3));
        assert_eq!(t0.hw_resource("socket"), None);
        assert_eq!(t0.hw_levels(), vec!["socket", "l3cache"]);
        assert_eq!(t0.common_directory("/scratch"), Some(9));
        assert_eq!(t1.network_domain("switch"), Some(4));
        assert_eq!(t0.world_size(), 4);
    }
}
