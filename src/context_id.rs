//! Context identifiers and the agreed allocation pool.
//!
//! A context id is `prefix << 3 | localcomm << 2 | subcomm`. Only the prefix is
//! a scarce resource; node and node-roots sub-communicators and the local view
//! of an intercommunicator derive their ids from their parent's prefix.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::device::{Device, Scope};
use crate::error::{Error, Result};

const PREFIX_SHIFT: u32 = 3;
const LOCALCOMM_BIT: u32 = 1 << 2;
const SUBCOMM_MASK: u32 = 0b11;

/// Number of distinct context prefixes.
pub const MAX_CONTEXT_PREFIXES: usize = 2048;
const MASK_WORDS: usize = MAX_CONTEXT_PREFIXES / 64;

/// Prefixes reserved for the builtin communicators.
pub(crate) const WORLD_PREFIX: u32 = 0;
pub(crate) const SELF_PREFIX: u32 = 1;
pub(crate) const ICOMM_WORLD_PREFIX: u32 = 2;
const RESERVED_PREFIXES: u32 = 3;

/// Which derived communicator a context id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SubcommKind {
    /// User-visible (or builtin) communicator
    Parent = 0,
    /// Node-local sub-communicator
    IntraNode = 1,
    /// Node-roots sub-communicator
    InterNode = 2,
}

/// A context identifier namespace token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u32);

impl ContextId {
    /// Context id of a parent communicator with the given prefix.
    pub fn from_prefix(prefix: u32) -> Self {
        ContextId(prefix << PREFIX_SHIFT)
    }

    /// Wrap a raw value.
    pub fn from_raw(raw: u32) -> Self {
        ContextId(raw)
    }

    /// Raw value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Prefix shared by a communicator and everything derived from it.
    pub fn prefix(self) -> u32 {
        self.0 >> PREFIX_SHIFT
    }

    /// Sub-communicator kind encoded in this id.
    pub fn subcomm(self) -> SubcommKind {
        match self.0 & SUBCOMM_MASK {
            1 => SubcommKind::IntraNode,
            2 => SubcommKind::InterNode,
            _ => SubcommKind::Parent,
        }
    }

    /// Whether this is the id of an intercomm's local intracomm view.
    pub fn is_localcomm(self) -> bool {
        self.0 & LOCALCOMM_BIT != 0
    }

    /// Id of a sub-communicator derived from this one.
    pub fn with_subcomm(self, kind: SubcommKind) -> Self {
        ContextId((self.0 & !SUBCOMM_MASK) | kind as u32)
    }

    /// Id of the local intracomm view of an intercomm with this receive id.
    pub fn localcomm(self) -> Self {
        ContextId(self.0 | LOCALCOMM_BIT)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Pool of context prefixes, one bit per prefix (set = free).
#[derive(Debug)]
pub struct ContextIdPool {
    mask: Mutex<[u64; MASK_WORDS]>,
}

impl ContextIdPool {
    pub(crate) fn new() -> Arc<Self> {
        let mut mask = [u64::MAX; MASK_WORDS];
        for prefix in 0..RESERVED_PREFIXES {
            mask[prefix as usize / 64] &= !(1u64 << (prefix % 64));
        }
        Arc::new(Self {
            mask: Mutex::new(mask),
        })
    }

    /// Number of prefixes currently free in this process.
    pub fn available(&self) -> usize {
        self.mask.lock().iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Agree on a prefix that is free on every member of `scope`.
    ///
    /// Collective over `scope`: every member must call this in the same order.
    /// The free masks are exchanged without holding the pool lock, so other
    /// threads of this process may allocate concurrently on other scopes. A
    /// second exchange confirms that every member could claim the agreed
    /// prefix; if another local thread got there first, the claim is undone
    /// everywhere and the agreement is retried.
    pub(crate) fn allocate(
        self: &Arc<Self>,
        device: &dyn Device,
        scope: &Scope,
    ) -> Result<ContextLease> {
        let salt = scope.context_id().prefix() as usize;
        let mut attempt = 0usize;
        loop {
            let words: Vec<i64> = self.mask.lock().iter().map(|w| *w as i64).collect();
            let gathered = device.allgather(scope, &words)?;
            if gathered.len() % MASK_WORDS != 0 || gathered.is_empty() {
                return Err(Error::Internal(format!(
                    "context mask exchange returned {} words",
                    gathered.len()
                )));
            }

            let mut common = [u64::MAX; MASK_WORDS];
            for chunk in gathered.chunks(MASK_WORDS) {
                for (c, w) in common.iter_mut().zip(chunk) {
                    *c &= *w as u64;
                }
            }
            // retries start from a point that depends on the parent, so two
            // agreements racing in one process stop picking the same prefix
            let start = if attempt == 0 {
                0
            } else {
                (salt * 131 + attempt * 37) % MAX_CONTEXT_PREFIXES
            };
            let prefix = first_free(&common, start).ok_or_else(|| {
                Error::OutOfResources("no context id free on every rank".into())
            })?;

            let claimed = self.try_claim(prefix);
            let verdicts = match device.allgather(scope, &[i64::from(claimed)]) {
                Ok(v) => v,
                Err(e) => {
                    if claimed {
                        self.release(prefix);
                    }
                    return Err(e);
                }
            };
            if claimed && verdicts.iter().all(|v| *v == 1) {
                tracing::debug!(prefix, attempt, "agreed on context prefix");
                return Ok(ContextLease {
                    id: ContextId::from_prefix(prefix),
                    pool: Arc::downgrade(self),
                });
            }
            if claimed {
                self.release(prefix);
            }
            tracing::debug!(prefix, attempt, "context prefix taken concurrently, retrying");
            attempt += 1;
            std::thread::yield_now();
        }
    }

    fn try_claim(&self, prefix: u32) -> bool {
        let mut mask = self.mask.lock();
        let word = prefix as usize / 64;
        let bit = 1u64 << (prefix % 64);
        if mask[word] & bit == 0 {
            return false;
        }
        mask[word] &= !bit;
        true
    }

    fn release(&self, prefix: u32) {
        if prefix < RESERVED_PREFIXES || prefix as usize >= MAX_CONTEXT_PREFIXES {
            return;
        }
        let mut mask = self.mask.lock();
        let word = prefix as usize / 64;
        let bit = 1u64 << (prefix % 64);
        if mask[word] & bit != 0 {
            tracing::warn!(prefix, "context prefix released twice");
        }
        mask[word] |= bit;
    }
}

/// Ownership of an allocated context prefix; returns it to the pool on drop.
#[derive(Debug)]
pub struct ContextLease {
    id: ContextId,
    pool: Weak<ContextIdPool>,
}

impl ContextLease {
    /// The leased context id.
    pub fn id(&self) -> ContextId {
        self.id
    }
}

/// Lowest set bit of `mask` at or after `start`, wrapping around.
fn first_free(mask: &[u64; MASK_WORDS], start: usize) -> Option<u32> {
    (0..MAX_CONTEXT_PREFIXES)
        .map(|i| (start + i) % MAX_CONTEXT_PREFIXES)
        .find(|&p| mask[p / 64] & (1u64 << (p % 64)) != 0)
        .map(|p| p as u32)
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.id.prefix());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackFabric;

    #[test]
    fn derived_ids_share_prefix() {
        let id = ContextId::from_prefix(7);
        let node = id.with_subcomm(SubcommKind::IntraNode);
        let roots = id.with_subcomm(SubcommKind::InterNode);
        assert_eq!(node.prefix(), 7);
        assert_eq!(roots.prefix(), 7);
        assert_eq!(node.subcomm(), SubcommKind::IntraNode);
        assert_eq!(roots.subcomm(), SubcommKind::InterNode);
        assert_ne!(node, roots);
        assert!(id.localcomm().is_localcomm());
        assert_eq!(id.localcomm().prefix(), 7);
        assert!(!id.is_localcomm());
    }

    #[test]
    fn lease_returns_prefix_on_drop() {
        let fabric = LoopbackFabric::single_node(1);
        let device = fabric.device(0);
        let pool = ContextIdPool::new();
        let before = pool.available();
        let scope = Scope::intra(ContextId::from_prefix(WORLD_PREFIX), 0, 1, 0);

        let lease = pool.allocate(device.as_ref(), &scope).unwrap();
        assert_eq!(lease.id().prefix(), RESERVED_PREFIXES);
        assert_eq!(pool.available(), before - 1);

        let second = pool.allocate(device.as_ref(), &scope).unwrap();
        assert_eq!(second.id().prefix(), RESERVED_PREFIXES + 1);

        drop(lease);
        assert_eq!(pool.available(), before - 1);
        let third = pool.allocate(device.as_ref(), &scope).unwrap();
        assert_eq!(third.id().prefix(), RESERVED_PREFIXES);
    }

    #[test]
    fn exhaustion_is_a_resource_error() {
        let fabric = LoopbackFabric::single_node(1);
        let device = fabric.device(0);
        let pool = ContextIdPool::new();
        let scope = Scope::intra(ContextId::from_prefix(WORLD_PREFIX), 0, 1, 0);
        let mut leases = Vec::new();
        for _ in RESERVED_PREFIXES as usize..MAX_CONTEXT_PREFIXES {
            leases.push(pool.allocate(device.as_ref(), &scope).unwrap());
        }
        let err = pool.allocate(device.as_ref(), &scope).unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Resource);
    }
}
