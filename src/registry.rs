//! Registry of live communicators.
//!
//! Every committed communicator is registered under its handle until it is
//! deleted. The registry also enforces that no two live communicators of a
//! process receive on the same context id.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::comm::Comm;
use crate::context_id::ContextId;
use crate::error::{Error, Result};
use crate::handle::CommHandle;

/// Live communicators of one runtime, keyed by handle.
#[derive(Debug, Default)]
pub(crate) struct CommRegistry {
    comms: DashMap<CommHandle, Arc<Comm>>,
    contexts: DashMap<ContextId, CommHandle>,
}

impl CommRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a committed communicator.
    pub(crate) fn insert(&self, comm: &Arc<Comm>) -> Result<()> {
        match self.contexts.entry(comm.recv_context_id()) {
            Entry::Occupied(e) => {
                return Err(Error::Internal(format!(
                    "context id {} already used by {}",
                    comm.recv_context_id(),
                    e.get()
                )));
            }
            Entry::Vacant(e) => {
                e.insert(comm.handle());
            }
        }
        if self.comms.insert(comm.handle(), Arc::clone(comm)).is_some() {
            tracing::warn!(handle = %comm.handle(), "handle registered twice");
        }
        tracing::trace!(handle = %comm.handle(), live = self.comms.len(), "communicator registered");
        Ok(())
    }

    /// Unregister `comm`. Does nothing if it was never registered.
    pub(crate) fn remove(&self, comm: &Comm) {
        let handle = comm.handle();
        self.contexts
            .remove_if(&comm.recv_context_id(), |_, owner| *owner == handle);
        self.comms.remove(&handle);
    }

    /// Live communicator registered under `handle`.
    pub(crate) fn get(&self, handle: CommHandle) -> Option<Arc<Comm>> {
        self.comms.get(&handle).map(|c| Arc::clone(c.value()))
    }

    /// Number of live communicators.
    pub(crate) fn len(&self) -> usize {
        self.comms.len()
    }

    /// Handles of every live communicator, sorted.
    pub(crate) fn handles(&self) -> Vec<CommHandle> {
        let mut handles: Vec<_> = self.comms.iter().map(|e| *e.key()).collect();
        handles.sort_unstable_by_key(|h| h.raw());
        handles
    }

    /// Drop every remaining entry.
    pub(crate) fn clear(&self) {
        self.comms.clear();
        self.contexts.clear();
    }
}

#[cfg(test)]
mod tests {
    use crate::loopback::LoopbackFabric;
    use crate::{CommHandle, Runtime, RuntimeConfig, ThreadLevel};

    #[test]
    fn builtins_are_registered_and_preinit_resolves_to_world() {
        let fabric = LoopbackFabric::single_node(1);
        let rt = Runtime::init_thread(
            ThreadLevel::Single,
            RuntimeConfig::default(),
            fabric.device(0),
            fabric.topology(0),
        )
        .unwrap();
        let handles = rt.live_handles();
        assert!(handles.contains(&CommHandle::WORLD));
        assert!(handles.contains(&CommHandle::SELF));
        assert!(handles.contains(&CommHandle::ICOMM_WORLD));
        let world = rt.comm(CommHandle::PREINIT_WORLD).unwrap();
        assert_eq!(world.handle(), CommHandle::WORLD);

        let dup = rt.world().dup(None).unwrap();
        assert!(rt.live_handles().contains(&dup.handle()));
        assert_eq!(rt.comm(dup.handle()).unwrap().context_id(), dup.context_id());
        dup.release().unwrap();
        assert!(!rt.live_handles().contains(&dup.handle()));
    }
}
