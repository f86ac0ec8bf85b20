//! Ordered sets of process identities.

use std::sync::Arc;

use crate::error::{Error, Result};

/// Local process identifier: the process's rank in the world communicator.
pub type Lpid = u64;

/// An ordered set of process identities. Rank `i` of the group is `lpids()[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    lpids: Arc<[Lpid]>,
}

impl Group {
    /// Build a group from an ordered list of identities.
    pub fn new(lpids: Vec<Lpid>) -> Result<Self> {
        let mut sorted = lpids.clone();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::InvalidGroup("duplicate process in group".into()));
        }
        Ok(Group {
            lpids: lpids.into(),
        })
    }

    pub(crate) fn from_shared(lpids: Arc<[Lpid]>) -> Self {
        Group { lpids }
    }

    /// The empty group.
    pub fn empty() -> Self {
        Group {
            lpids: Arc::from(Vec::new()),
        }
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.lpids.len()
    }

    /// Member identities in rank order.
    pub fn lpids(&self) -> &[Lpid] {
        &self.lpids
    }

    /// Rank of `lpid` in this group, if it is a member.
    pub fn rank_of(&self, lpid: Lpid) -> Option<usize> {
        self.lpids.iter().position(|&p| p == lpid)
    }

    /// Subgroup made of the given ranks, in the given order.
    pub fn incl(&self, ranks: &[usize]) -> Result<Self> {
        let lpids = ranks
            .iter()
            .map(|&r| {
                self.lpids
                    .get(r)
                    .copied()
                    .ok_or(Error::InvalidRank(r as i32))
            })
            .collect::<Result<Vec<_>>>()?;
        Group::new(lpids)
    }

    /// Translate each member of `self` to its rank in `other` (`None` if absent).
    pub fn translate_ranks(&self, other: &Group) -> Vec<Option<usize>> {
        self.lpids.iter().map(|&p| other.rank_of(p)).collect()
    }
}
