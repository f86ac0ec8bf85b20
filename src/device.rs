//! The device/transport collaborator.
//!
//! The device resolves network addresses for new communicators (by reading
//! their mapper list once), performs the small collectives communicator
//! management needs (context-id agreement, split colors, hint agreement,
//! intercommunicator bootstrap), and supplies the progress-test primitive the
//! background progress thread drives.

use crate::comm::{Comm, CommBuilder};
use crate::context_id::ContextId;
use crate::error::Result;
use crate::group::Lpid;

/// The set of processes a collective runs over, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// All members of an intracommunicator.
    Intra {
        /// Context id of the communicator
        context_id: ContextId,
        /// Caller's rank
        rank: usize,
        /// Number of members
        size: usize,
        /// Identity of rank 0; tells apart communicators that share a
        /// context id but have disjoint members (e.g. split results)
        leader: Lpid,
    },
    /// Both groups of an intercommunicator.
    Inter {
        /// Context id used to send to the remote group
        context_id: ContextId,
        /// Context id the local group receives on
        recv_context_id: ContextId,
        /// Caller's rank in the local group
        rank: usize,
        /// Size of the local group
        local_size: usize,
        /// Size of the remote group
        remote_size: usize,
        /// Identity of local rank 0
        local_leader: Lpid,
        /// Identity of remote rank 0
        remote_leader: Lpid,
    },
}

impl Scope {
    /// Scope of an intracommunicator.
    pub fn intra(context_id: ContextId, rank: usize, size: usize, leader: Lpid) -> Self {
        Scope::Intra {
            context_id,
            rank,
            size,
            leader,
        }
    }

    /// Context id the collective runs on (the receive id for an intercomm).
    pub fn context_id(&self) -> ContextId {
        match *self {
            Scope::Intra { context_id, .. } => context_id,
            Scope::Inter {
                recv_context_id, ..
            } => recv_context_id,
        }
    }

    /// Caller's rank in its (local) group.
    pub fn rank(&self) -> usize {
        match *self {
            Scope::Intra { rank, .. } | Scope::Inter { rank, .. } => rank,
        }
    }

    /// Size of the caller's (local) group.
    pub fn local_size(&self) -> usize {
        match *self {
            Scope::Intra { size, .. } => size,
            Scope::Inter { local_size, .. } => local_size,
        }
    }

    /// Number of contributions an allgather returns.
    pub fn gather_size(&self) -> usize {
        match *self {
            Scope::Intra { size, .. } => size,
            Scope::Inter { remote_size, .. } => remote_size,
        }
    }
}

/// Transport layer consumed by the communicator core.
///
/// All collective methods must be called by every member of the scope in the
/// same order.
pub trait Device: Send + Sync {
    /// Resolve addresses for a communicator about to be committed.
    ///
    /// This is the only reader of the builder's mapper list.
    fn comm_create_hook(&self, comm: &CommBuilder) -> Result<()> {
        let _ = comm;
        Ok(())
    }

    /// Release device state of a communicator being deleted.
    fn comm_free_hook(&self, comm: &Comm) -> Result<()> {
        let _ = comm;
        Ok(())
    }

    /// Gather contributions.
    ///
    /// For [`Scope::Intra`] the result concatenates every member's contribution
    /// in rank order; for [`Scope::Inter`] it concatenates the remote group's.
    /// Members of one group contribute equal lengths unless stated otherwise.
    fn allgather(&self, scope: &Scope, send: &[i64]) -> Result<Vec<i64>>;

    /// Broadcast `buf` from `root` over an intracommunicator scope.
    fn bcast(&self, scope: &Scope, root: usize, buf: &mut Vec<i64>) -> Result<()>;

    /// Exchange a message with `peer` (a rank of the scope) on `tag`.
    fn sendrecv(&self, scope: &Scope, peer: usize, tag: i32, send: &[i64]) -> Result<Vec<i64>>;

    /// Make one round of communication progress.
    fn progress_test(&self) -> Result<()>;

    /// Final progress round run by the progress thread before it exits.
    fn progress_drain(&self) -> Result<()> {
        self.progress_test()
    }
}
