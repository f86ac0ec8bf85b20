//! Opaque integer handles for communicators.
//!
//! | Handle | Communicator |
//! |--------|--------------|
//! | `0x4400_0000` | world |
//! | `0x4400_0001` | self |
//! | `0x4400_0002` | internal duplicate of world (teardown use) |
//! | `0x4400_00FF` | pre-initialization world placeholder |
//! | `0x8400_0000 \| n` | dynamically created communicators |

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

const BUILTIN_BASE: i32 = 0x4400_0000;
const DYNAMIC_BASE: u32 = 0x8400_0000;
const DYNAMIC_MASK: i32 = 0x03FF_FFFF;

/// Number of preallocated communicators (world, self, internal world).
pub const N_BUILTIN: usize = 3;

/// Opaque handle addressing a communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommHandle(i32);

impl CommHandle {
    /// The world communicator.
    pub const WORLD: CommHandle = CommHandle(BUILTIN_BASE);
    /// The communicator containing only the calling process.
    pub const SELF: CommHandle = CommHandle(BUILTIN_BASE + 1);
    /// Private duplicate of world, used during finalize.
    pub const ICOMM_WORLD: CommHandle = CommHandle(BUILTIN_BASE + 2);
    /// Placeholder for world before the real world communicator exists.
    pub const PREINIT_WORLD: CommHandle = CommHandle(BUILTIN_BASE + 0xFF);

    /// Wrap a raw handle value.
    pub fn from_raw(raw: i32) -> Self {
        CommHandle(raw)
    }

    /// Get the raw handle value.
    pub fn raw(self) -> i32 {
        self.0
    }

    /// Whether this handle lies in the reserved builtin range.
    pub fn is_builtin(self) -> bool {
        self.0 & !0xFF == BUILTIN_BASE
    }

    /// Index into the builtin table, if this is one of the preallocated communicators.
    pub fn builtin_index(self) -> Option<usize> {
        if self.is_builtin() && ((self.0 & 0xFF) as usize) < N_BUILTIN {
            Some((self.0 & 0xFF) as usize)
        } else {
            None
        }
    }
}

impl fmt::Display for CommHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

/// Hands out dynamic handles, reusing released ones first.
#[derive(Debug, Default)]
pub(crate) struct HandleAllocator {
    next: AtomicI32,
    free: Mutex<Vec<i32>>,
}

impl HandleAllocator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate(&self) -> Result<CommHandle> {
        if let Some(n) = self.free.lock().pop() {
            return Ok(CommHandle((DYNAMIC_BASE as i32) | n));
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        if !(0..=DYNAMIC_MASK).contains(&n) {
            return Err(Error::OutOfResources(
                "communicator handle space exhausted".into(),
            ));
        }
        Ok(CommHandle((DYNAMIC_BASE as i32) | n))
    }

    /// Return a dynamic handle for reuse. Builtin handles are ignored.
    pub(crate) fn release(&self, handle: CommHandle) {
        if handle.is_builtin() || handle.0 as u32 & !(DYNAMIC_MASK as u32) != DYNAMIC_BASE {
            return;
        }
        self.free.lock().push(handle.0 & DYNAMIC_MASK);
    }

    /// Number of dynamic handles ever minted.
    #[cfg(test)]
    pub(crate) fn minted(&self) -> i32 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_handles() {
        assert_eq!(CommHandle::WORLD.builtin_index(), Some(0));
        assert_eq!(CommHandle::SELF.builtin_index(), Some(1));
        assert_eq!(CommHandle::ICOMM_WORLD.builtin_index(), Some(2));
        assert!(CommHandle::PREINIT_WORLD.is_builtin());
        assert_eq!(CommHandle::PREINIT_WORLD.builtin_index(), None);
        assert_eq!(CommHandle::ICOMM_WORLD.raw(), 0x4400_0002);
    }

    #[test]
    fn dynamic_handles_are_distinct_and_not_builtin() {
        let alloc = HandleAllocator::new();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_ne!(a, b);
        assert!(!a.is_builtin());
        assert_eq!(a.raw() as u32 & 0xFC00_0000, 0x8400_0000);
        assert_eq!(format!("{a}"), "0x84000000");
    }

    #[test]
    fn released_handles_are_reused() {
        let alloc = HandleAllocator::new();
        let a = alloc.allocate().unwrap();
        let _b = alloc.allocate().unwrap();
        alloc.release(a);
        alloc.release(CommHandle::WORLD);
        assert_eq!(alloc.allocate().unwrap(), a);
        assert_eq!(alloc.minted(), 2);
        let c = alloc.allocate().unwrap();
        assert_eq!(c.raw() & DYNAMIC_MASK, 2);
    }
}
