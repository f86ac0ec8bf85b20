//! Communicator objects and their lifecycle.
//!
//! A communicator is born as a [`CommBuilder`], decorated with mapping
//! descriptors, and turned into a shared [`Comm`] by
//! [`commit`](CommBuilder::commit). From then on its logical lifetime is
//! governed by an explicit reference count: [`Comm::add_ref`] and
//! [`Comm::release`]. The release that brings the count to zero deletes the
//! communicator exactly once: sub-communicators are released, the device is
//! told, the object leaves the registry and its context id returns to the pool.
//!
//! # Example
//!
//! ```
//! use ferrocomm::{loopback::LoopbackFabric, Runtime, RuntimeConfig, ThreadLevel};
//!
//! let fabric = LoopbackFabric::single_node(1);
//! let rt = Runtime::init_thread(
//!     ThreadLevel::Single,
//!     RuntimeConfig::default(),
//!     fabric.device(0),
//!     fabric.topology(0),
//! )
//! .unwrap();
//!
//! let dup = rt.world().dup(None).unwrap();
//! assert_eq!(dup.size(), 1);
//! dup.add_ref();
//! dup.release().unwrap();
//! assert!(dup.is_valid());
//! dup.release().unwrap();
//! assert!(!dup.is_valid());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::context_id::{ContextId, ContextLease, SubcommKind};
use crate::device::Scope;
use crate::error::{Error, Result};
use crate::group::{Group, Lpid};
use crate::handle::CommHandle;
use crate::hierarchy::{self, Hierarchy, HierarchyKind};
use crate::hint::{HintId, HintValues, HINT_MAX};
use crate::info::Info;
use crate::map::{self, CommMap};
use crate::Shared;

/// Maximum length of a communicator name.
pub const MAX_OBJECT_NAME: usize = 128;

/// The two kinds of communicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommKind {
    /// Single group
    Intra,
    /// Two disjoint groups, local and remote
    Inter,
}

/// Mutable bookkeeping guarded by the per-communicator mutex.
#[derive(Default)]
struct CommState {
    name: String,
    errhandler: Option<i32>,
    attributes: BTreeMap<i32, i64>,
    local_comm: Option<Arc<Comm>>,
    lease: Option<ContextLease>,
}

/// A committed communicator.
pub struct Comm {
    handle: CommHandle,
    ref_count: AtomicI32,
    deleted: AtomicBool,
    revoked: AtomicBool,
    kind: CommKind,
    context_id: ContextId,
    recv_context_id: ContextId,
    seq: u32,
    tainted: bool,
    rank: usize,
    is_low_group: bool,
    local_lpids: Arc<[Lpid]>,
    remote_lpids: Arc<[Lpid]>,
    local_group: OnceLock<Group>,
    remote_group: OnceLock<Group>,
    hierarchy: OnceLock<Hierarchy>,
    hints: HintValues,
    state: Mutex<CommState>,
    runtime: Weak<Shared>,
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comm")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("context_id", &self.context_id)
            .field("recv_context_id", &self.recv_context_id)
            .field("rank", &self.rank)
            .field("local_size", &self.local_lpids.len())
            .field("remote_size", &self.remote_lpids.len())
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Comm {
    /// External handle.
    pub fn handle(&self) -> CommHandle {
        self.handle
    }

    /// Intra- or intercommunicator.
    pub fn kind(&self) -> CommKind {
        self.kind
    }

    /// Whether this is an intercommunicator.
    pub fn is_intercomm(&self) -> bool {
        self.kind == CommKind::Inter
    }

    /// Rank of the calling process in the local group.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Size of the local group.
    pub fn size(&self) -> usize {
        self.local_lpids.len()
    }

    /// Size of the remote group (equal to [`size`](Self::size) for intracomms).
    pub fn remote_size(&self) -> usize {
        self.remote_lpids.len()
    }

    /// Context id used for sending.
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Context id used for receiving.
    pub fn recv_context_id(&self) -> ContextId {
        self.recv_context_id
    }

    /// Sequence number used for auxiliary hashing (`0` when tainted).
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Whether this communicator and its descendants are pinned to `seq == 0`.
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Intercomm partition flag: set on exactly one of the two groups.
    pub fn is_low_group(&self) -> bool {
        self.is_low_group
    }

    /// Identity of local rank `rank`.
    pub fn lpid(&self, rank: usize) -> Option<Lpid> {
        self.local_lpids.get(rank).copied()
    }

    /// Identity of remote rank `rank`.
    pub fn remote_lpid(&self, rank: usize) -> Option<Lpid> {
        self.remote_lpids.get(rank).copied()
    }

    /// Local group, materialized on first use.
    pub fn local_group(&self) -> &Group {
        self.local_group
            .get_or_init(|| Group::from_shared(Arc::clone(&self.local_lpids)))
    }

    /// Remote group, materialized on first use. Same members as the local
    /// group for intracomms.
    pub fn remote_group(&self) -> &Group {
        if self.kind == CommKind::Intra {
            return self.local_group();
        }
        self.remote_group
            .get_or_init(|| Group::from_shared(Arc::clone(&self.remote_lpids)))
    }

    pub(crate) fn local_lpids(&self) -> &Arc<[Lpid]> {
        &self.local_lpids
    }

    pub(crate) fn remote_lpids(&self) -> &Arc<[Lpid]> {
        &self.remote_lpids
    }

    /// The communicator's decomposition into node and node-roots parts.
    #[inline]
    pub fn hierarchy(&self) -> &Hierarchy {
        self.hierarchy.get().unwrap_or(&hierarchy::FLAT)
    }

    /// Hierarchy kind tag.
    #[inline]
    pub fn hierarchy_kind(&self) -> HierarchyKind {
        self.hierarchy().kind()
    }

    /// Node-local sub-communicator, if decomposed.
    pub fn node_comm(&self) -> Option<&Arc<Comm>> {
        self.hierarchy().node_comm()
    }

    /// Node-roots sub-communicator; present only on node roots of a decomposed
    /// communicator.
    pub fn node_roots_comm(&self) -> Option<&Arc<Comm>> {
        self.hierarchy().node_roots_comm()
    }

    /// Number of nodes the communicator spans (`0` when unknown).
    pub fn node_count(&self) -> usize {
        self.hierarchy().node_count()
    }

    /// Current value of hint `id` (unsynchronized fast-path read).
    #[inline]
    pub fn hint(&self, id: HintId) -> i32 {
        self.hints.get(id)
    }

    /// Write the fast-path slot of hint `id` without validation.
    ///
    /// Meant for hint validators, which own the slot of the hint they validate.
    pub fn store_hint(&self, id: HintId, value: i32) {
        self.hints.set(id, value);
    }

    pub(crate) fn hint_snapshot(&self) -> [i32; HINT_MAX] {
        self.hints.snapshot()
    }

    /// Current reference count.
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Whether the communicator has not been deleted.
    pub fn is_valid(&self) -> bool {
        !self.deleted.load(Ordering::Acquire)
    }

    /// Mark the communicator revoked.
    pub fn revoke(&self) {
        let _state = self.state.lock();
        if !self.revoked.swap(true, Ordering::AcqRel) {
            tracing::debug!(handle = %self.handle, "communicator revoked");
        }
    }

    /// Whether the communicator has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Communicator name.
    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Set the communicator name, truncated to [`MAX_OBJECT_NAME`] bytes.
    pub fn set_name(&self, name: &str) {
        let mut end = name.len().min(MAX_OBJECT_NAME);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.state.lock().name = name[..end].to_string();
    }

    /// Attached error handler id.
    pub fn errhandler(&self) -> Option<i32> {
        self.state.lock().errhandler
    }

    /// Attach an error handler (owned by the error-handler subsystem).
    pub fn set_errhandler(&self, errhandler: Option<i32>) {
        self.state.lock().errhandler = errhandler;
    }

    /// Cache an attribute value under `keyval`.
    pub fn set_attr(&self, keyval: i32, value: i64) {
        self.state.lock().attributes.insert(keyval, value);
    }

    /// Cached attribute value for `keyval`.
    pub fn attr(&self, keyval: i32) -> Option<i64> {
        self.state.lock().attributes.get(&keyval).copied()
    }

    /// Remove the attribute cached under `keyval`.
    pub fn delete_attr(&self, keyval: i32) -> Option<i64> {
        self.state.lock().attributes.remove(&keyval)
    }

    /// Collective scope covering this communicator, for the device.
    pub fn scope(&self) -> Scope {
        match self.kind {
            CommKind::Intra => Scope::Intra {
                context_id: self.context_id,
                rank: self.rank,
                size: self.size(),
                leader: self.local_lpids[0],
            },
            CommKind::Inter => Scope::Inter {
                context_id: self.context_id,
                recv_context_id: self.recv_context_id,
                rank: self.rank,
                local_size: self.size(),
                remote_size: self.remote_size(),
                local_leader: self.local_lpids[0],
                remote_leader: self.remote_lpids[0],
            },
        }
    }

    pub(crate) fn shared(&self) -> Result<Arc<Shared>> {
        self.runtime.upgrade().ok_or(Error::NotInitialized)
    }

    /// Fail unless the communicator can be used to derive new objects.
    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::InvalidCommunicator);
        }
        if self.is_revoked() {
            return Err(Error::Revoked);
        }
        Ok(())
    }

    pub(crate) fn set_local_comm(&self, local: Arc<Comm>) -> Arc<Comm> {
        let mut state = self.state.lock();
        Arc::clone(state.local_comm.get_or_insert(local))
    }

    pub(crate) fn cached_local_comm(&self) -> Option<Arc<Comm>> {
        self.state.lock().local_comm.clone()
    }

    /// Run `f` while holding the communicator's own mutex.
    pub(crate) fn with_state_locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _state = self.state.lock();
        f()
    }

    // ========================================================================
    // Reference counting
    // ========================================================================

    /// Take an additional reference. No-op on builtin communicators.
    #[inline]
    pub fn add_ref(&self) {
        if self.handle.is_builtin() {
            return;
        }
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a reference; the release that reaches zero deletes the communicator.
    ///
    /// Builtin communicators are never deleted by this path, see
    /// [`release_always`](Self::release_always).
    #[inline]
    pub fn release(&self) -> Result<()> {
        if self.handle.is_builtin() {
            return Ok(());
        }
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            return self.delete_internal();
        }
        if prev <= 0 {
            self.ref_count.fetch_add(1, Ordering::AcqRel);
            return Err(Error::InvalidCommunicator);
        }
        Ok(())
    }

    /// Like [`release`](Self::release), but also applies to builtin
    /// communicators and never lets the count go below zero.
    pub fn release_always(&self) -> Result<()> {
        let prev = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c > 0).then(|| c - 1)
            })
            .map_err(|_| Error::InvalidCommunicator)?;
        if prev == 1 {
            self.delete_internal()?;
        }
        Ok(())
    }

    /// Tear the communicator down. Runs at most once per communicator.
    ///
    /// Only [`release`](Self::release), [`release_always`](Self::release_always)
    /// and failed commits call this. Every step runs even if an earlier one
    /// fails; the first error is returned.
    pub(crate) fn delete_internal(&self) -> Result<()> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let shared = self.runtime.upgrade();
        let mut first_err: Option<Error> = None;
        let mut record = |r: Result<()>| {
            if let Err(e) = r {
                tracing::warn!(error = %e, "error while deleting communicator");
                first_err.get_or_insert(e);
            }
        };

        if let Some(shared) = &shared {
            record(shared.device.comm_free_hook(self));
        }

        if let Some(h) = self.hierarchy.get() {
            for sub in [h.node_comm(), h.node_roots_comm()].into_iter().flatten() {
                record(sub.release());
            }
        }

        let (local_comm, lease) = {
            let mut state = self.state.lock();
            state.attributes.clear();
            (state.local_comm.take(), state.lease.take())
        };
        if let Some(local) = local_comm {
            record(local.release());
        }

        if let Some(shared) = &shared {
            shared.registry.remove(self);
            shared.handles.release(self.handle);
        }
        drop(lease);

        tracing::debug!(
            handle = %self.handle,
            context_id = %self.recv_context_id,
            "communicator deleted"
        );
        first_err.map_or(Ok(()), Err)
    }
}

// ============================================================================
// Construction
// ============================================================================

/// A communicator under construction.
///
/// Obtained from [`Runtime::create_comm`](crate::Runtime::create_comm) or
/// internally by the creation routines. Dropping a builder without committing
/// it returns its context id to the pool.
pub struct CommBuilder {
    pub(crate) shared: Arc<Shared>,
    handle: CommHandle,
    owns_handle: bool,
    kind: CommKind,
    context_id: Option<ContextId>,
    recv_context_id: Option<ContextId>,
    lease: Option<ContextLease>,
    rank: Option<usize>,
    local_lpids: Option<Vec<Lpid>>,
    remote_lpids: Option<Vec<Lpid>>,
    is_low_group: bool,
    hierarchy_kind: HierarchyKind,
    seq: Option<u32>,
    tainted: bool,
    hints: [i32; HINT_MAX],
    info: Option<Info>,
    check_hints: bool,
    name: String,
    pub(crate) mapper: Vec<CommMap>,
}

impl fmt::Debug for CommBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommBuilder")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("context_id", &self.context_id)
            .field("recv_context_id", &self.recv_context_id)
            .field("mapper", &self.mapper.len())
            .finish()
    }
}

impl CommBuilder {
    pub(crate) fn new(shared: &Arc<Shared>) -> Result<Self> {
        let handle = shared.handles.allocate()?;
        Ok(CommBuilder::with_handle(shared, handle, true))
    }

    /// Builder for one of the preallocated communicators.
    pub(crate) fn builtin(shared: &Arc<Shared>, handle: CommHandle) -> Self {
        CommBuilder::with_handle(shared, handle, false)
    }

    fn with_handle(shared: &Arc<Shared>, handle: CommHandle, owns_handle: bool) -> Self {
        CommBuilder {
            handle,
            owns_handle,
            shared: Arc::clone(shared),
            kind: CommKind::Intra,
            context_id: None,
            recv_context_id: None,
            lease: None,
            rank: None,
            local_lpids: None,
            remote_lpids: None,
            is_low_group: false,
            hierarchy_kind: HierarchyKind::Flat,
            seq: None,
            tainted: false,
            hints: shared.hints.defaults(),
            info: None,
            check_hints: true,
            name: String::new(),
            mapper: Vec::new(),
        }
    }

    /// Handle the communicator will be registered under.
    pub fn handle(&self) -> CommHandle {
        self.handle
    }

    /// Set the communicator kind.
    pub fn kind(mut self, kind: CommKind) -> Self {
        self.kind = kind;
        self
    }

    /// Kind of the communicator being built.
    pub fn comm_kind(&self) -> CommKind {
        self.kind
    }

    /// Use a leased context id for both sending and receiving.
    pub fn context(mut self, lease: ContextLease) -> Self {
        let id = lease.id();
        self.context_id = Some(id);
        self.recv_context_id = Some(id);
        self.lease = Some(lease);
        self
    }

    /// Use a leased receive context id and the peer's context id for sending.
    pub fn inter_context(mut self, send: ContextId, recv: ContextLease) -> Self {
        self.context_id = Some(send);
        self.recv_context_id = Some(recv.id());
        self.lease = Some(recv);
        self
    }

    /// Use a context id that is not owned by this communicator (builtins,
    /// derived sub-communicators).
    pub(crate) fn borrowed_context(mut self, id: ContextId) -> Self {
        self.context_id = Some(id);
        self.recv_context_id = Some(id);
        self
    }

    /// Receive context id, once set.
    pub fn recv_context_id(&self) -> Option<ContextId> {
        self.recv_context_id
    }

    /// Set the members explicitly instead of deriving them from the mapper.
    pub fn members(mut self, local: Vec<Lpid>, remote: Option<Vec<Lpid>>) -> Self {
        self.local_lpids = Some(local);
        self.remote_lpids = remote;
        self
    }

    /// Set the caller's rank explicitly.
    pub fn rank(mut self, rank: usize) -> Self {
        self.rank = Some(rank);
        self
    }

    /// Set the intercomm partition flag.
    pub fn low_group(mut self, is_low_group: bool) -> Self {
        self.is_low_group = is_low_group;
        self
    }

    pub(crate) fn hierarchy_kind(mut self, kind: HierarchyKind) -> Self {
        self.hierarchy_kind = kind;
        self
    }

    /// Inherit sequence number and taint from `parent`.
    pub fn inherit_from(mut self, parent: &Comm) -> Self {
        self.seq = Some(parent.seq());
        self.tainted = parent.is_tainted();
        self
    }

    /// Mark the communicator tainted (forces `seq == 0` for it and its offspring).
    pub fn tainted(mut self) -> Self {
        self.tainted = true;
        self.seq = Some(0);
        self
    }

    /// Start from `parent`'s hint values instead of the registry defaults.
    pub fn copy_hints(mut self, parent: &Comm) -> Self {
        self.hints = parent.hint_snapshot();
        self
    }

    /// Hints to apply (through the hint registry) at commit.
    pub fn info(mut self, info: Option<&Info>) -> Self {
        self.info = info.filter(|i| !i.is_null()).cloned();
        self
    }

    pub(crate) fn skip_hint_check(mut self) -> Self {
        self.check_hints = false;
        self
    }

    /// Set the initial name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// The transient mapping descriptors.
    pub fn mapper(&self) -> &[CommMap] {
        &self.mapper
    }

    /// Number of local members, once known.
    pub fn local_size(&self) -> Option<usize> {
        self.local_lpids.as_ref().map(Vec::len)
    }

    fn resolve_members(&self) -> Result<(Vec<Lpid>, Vec<Lpid>)> {
        let (mapped_local, mapped_remote) = map::resolve(&self.mapper)?;
        let local = match &self.local_lpids {
            Some(l) => l.clone(),
            None => mapped_local,
        };
        let remote = match (&self.remote_lpids, self.kind) {
            (Some(r), CommKind::Inter) => r.clone(),
            (None, CommKind::Inter) => mapped_remote,
            (_, CommKind::Intra) => local.clone(),
        };
        Ok((local, remote))
    }

    /// Finalize the communicator.
    ///
    /// Resolves membership from the mapper, lets the device set up addresses,
    /// frees the mapper, decomposes intracommunicators by node, applies and
    /// checks hints, and registers the result. On failure everything built so
    /// far is released.
    pub fn commit(mut self) -> Result<Arc<Comm>> {
        let shared = Arc::clone(&self.shared);

        let context_id = self
            .context_id
            .ok_or_else(|| Error::Internal("commit without a context id".into()))?;
        let recv_context_id = self.recv_context_id.unwrap_or(context_id);

        let (local, remote) = self.resolve_members()?;
        if local.is_empty() || remote.is_empty() {
            return Err(Error::InvalidGroup("communicator with an empty group".into()));
        }
        Group::new(local.clone())?;
        let rank = match self.rank {
            Some(r) => r,
            None => local.iter().position(|&p| p == shared.my_lpid).ok_or_else(|| {
                Error::InvalidGroup("calling process is not a member".into())
            })?,
        };
        if rank >= local.len() || local[rank] != shared.my_lpid {
            return Err(Error::InvalidRank(rank as i32));
        }
        if self.kind == CommKind::Inter && local.iter().any(|p| remote.contains(p)) {
            return Err(Error::InvalidGroup(
                "intercommunicator groups must be disjoint".into(),
            ));
        }

        shared.device.comm_create_hook(&self)?;
        self.map_free();

        let seq = match self.seq {
            _ if self.tainted => 0,
            Some(seq) => seq,
            None => shared.next_seq(),
        };
        let local: Arc<[Lpid]> = local.into();
        let remote: Arc<[Lpid]> = if self.kind == CommKind::Intra {
            Arc::clone(&local)
        } else {
            remote.into()
        };

        let comm = Arc::new(Comm {
            handle: self.handle,
            ref_count: AtomicI32::new(1),
            deleted: AtomicBool::new(false),
            revoked: AtomicBool::new(false),
            kind: self.kind,
            context_id,
            recv_context_id,
            seq,
            tainted: self.tainted,
            rank,
            is_low_group: self.is_low_group,
            local_lpids: local,
            remote_lpids: remote,
            local_group: OnceLock::new(),
            remote_group: OnceLock::new(),
            hierarchy: OnceLock::new(),
            hints: HintValues::from_array(self.hints),
            state: Mutex::new(CommState {
                name: std::mem::take(&mut self.name),
                lease: self.lease.take(),
                ..CommState::default()
            }),
            runtime: Arc::downgrade(&shared),
        });
        // the handle now belongs to the communicator and is returned on delete
        self.owns_handle = false;

        if let Err(e) = self.finish_commit(&shared, &comm) {
            // Partially built: release whatever exists, report the original error.
            let _ = comm.delete_internal();
            return Err(e);
        }

        tracing::debug!(
            handle = %comm.handle,
            context_id = %comm.recv_context_id,
            rank = comm.rank,
            size = comm.size(),
            hierarchy = ?comm.hierarchy_kind(),
            "communicator committed"
        );
        Ok(comm)
    }

    fn finish_commit(&mut self, shared: &Arc<Shared>, comm: &Arc<Comm>) -> Result<()> {
        let decompose = comm.kind == CommKind::Intra
            && self.hierarchy_kind == HierarchyKind::Flat
            && comm.recv_context_id.subcomm() == SubcommKind::Parent
            && !comm.recv_context_id.is_localcomm();
        let built = if decompose {
            hierarchy::build(comm, shared)?
        } else {
            Hierarchy::leaf(self.hierarchy_kind, comm)
        };
        if comm.hierarchy.set(built).is_err() {
            return Err(Error::Internal("hierarchy set twice".into()));
        }

        if let Some(info) = self.info.take() {
            let _cs = shared.global_cs.lock();
            shared.hints.apply_info(comm, &info)?;
        }
        if self.check_hints {
            shared.hints.check(comm, shared.device.as_ref())?;
        }

        let _cs = shared.global_cs.lock();
        shared.registry.insert(comm)
    }
}

impl Drop for CommBuilder {
    fn drop(&mut self) {
        if !self.mapper.is_empty() {
            self.map_free();
        }
        if self.owns_handle {
            self.shared.handles.release(self.handle);
        }
    }
}
