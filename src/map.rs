//! Mapping Builder: how the ranks of a communicator under construction
//! correspond to ranks of existing communicators.
//!
//! Descriptors are appended to a [`CommBuilder`]'s mapper list during
//! construction, read once by the device's create hook, and freed at commit.

use std::sync::Arc;

use crate::comm::{Comm, CommBuilder};
use crate::error::{Error, Result};
use crate::group::Lpid;

/// Descriptor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// Ranks correspond 1:1, in order, to the source's ranks.
    Dup,
    /// Ranks correspond through an explicit table.
    Irregular,
}

/// Which side of the source is mapped onto which side of the new communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDir {
    /// Source local group to new local group
    L2L,
    /// Source local group to new remote group
    L2R,
    /// Source remote group to new local group
    R2L,
    /// Source remote group to new remote group
    R2R,
}

impl MapDir {
    fn from_remote(self) -> bool {
        matches!(self, MapDir::R2L | MapDir::R2R)
    }

    fn to_remote(self) -> bool {
        matches!(self, MapDir::L2R | MapDir::R2R)
    }
}

/// Rank table of an irregular descriptor: owned by it, or borrowed from the
/// caller.
#[derive(Debug, Clone)]
pub enum Mapping {
    /// Freed together with the descriptor.
    Owned(Vec<usize>),
    /// Shared with the caller, who keeps its own reference.
    Borrowed(Arc<[usize]>),
}

impl Mapping {
    /// The rank table.
    pub fn as_slice(&self) -> &[usize] {
        match self {
            Mapping::Owned(v) => v,
            Mapping::Borrowed(a) => a,
        }
    }

    /// Whether the descriptor owns the table.
    pub fn is_owned(&self) -> bool {
        matches!(self, Mapping::Owned(_))
    }
}

/// One mapping descriptor.
#[derive(Debug)]
pub struct CommMap {
    kind: MapKind,
    dir: MapDir,
    src: Arc<Comm>,
    src_mapping: Option<Mapping>,
    size: usize,
}

impl CommMap {
    /// Descriptor type.
    pub fn kind(&self) -> MapKind {
        self.kind
    }

    /// Mapping direction.
    pub fn dir(&self) -> MapDir {
        self.dir
    }

    /// Source communicator.
    pub fn src(&self) -> &Arc<Comm> {
        &self.src
    }

    /// Number of ranks this descriptor contributes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Explicit rank table of an irregular descriptor. `None` on an irregular
    /// descriptor means the identity over its first `size` ranks.
    pub fn src_mapping(&self) -> Option<&Mapping> {
        self.src_mapping.as_ref()
    }

    /// Attach (or replace) the rank table of an irregular descriptor.
    pub fn set_mapping(&mut self, mapping: Mapping) {
        self.size = mapping.as_slice().len();
        self.src_mapping = Some(mapping);
    }

    fn source_lpids(&self) -> &[Lpid] {
        if self.dir.from_remote() {
            self.src.remote_lpids()
        } else {
            self.src.local_lpids()
        }
    }

    /// Process identities this descriptor contributes, in new-rank order.
    pub fn lpids(&self) -> Result<Vec<Lpid>> {
        let source = self.source_lpids();
        match (self.kind, &self.src_mapping) {
            (MapKind::Dup, _) => Ok(source.to_vec()),
            (MapKind::Irregular, None) => source
                .get(..self.size)
                .map(<[Lpid]>::to_vec)
                .ok_or(Error::InvalidRank(self.size as i32)),
            (MapKind::Irregular, Some(mapping)) => mapping
                .as_slice()
                .iter()
                .map(|&r| source.get(r).copied().ok_or(Error::InvalidRank(r as i32)))
                .collect(),
        }
    }
}

impl CommBuilder {
    /// Append a descriptor mapping all ranks of `src` 1:1 in direction `dir`.
    pub fn map_dup(&mut self, src: &Arc<Comm>, dir: MapDir) {
        let size = if dir.from_remote() {
            src.remote_size()
        } else {
            src.size()
        };
        self.mapper.push(CommMap {
            kind: MapKind::Dup,
            dir,
            src: Arc::clone(src),
            src_mapping: None,
            size,
        });
    }

    /// Append a descriptor mapping new rank `i` to rank `mapping[i]` of `src`.
    ///
    /// Returns the descriptor so callers can fill in a table later; without a
    /// table the first `size` ranks of the source are taken in order.
    pub fn map_irregular(
        &mut self,
        src: &Arc<Comm>,
        mapping: Option<Mapping>,
        size: usize,
        dir: MapDir,
    ) -> &mut CommMap {
        let size = mapping.as_ref().map_or(size, |m| m.as_slice().len());
        let idx = self.mapper.len();
        self.mapper.push(CommMap {
            kind: MapKind::Irregular,
            dir,
            src: Arc::clone(src),
            src_mapping: mapping,
            size,
        });
        &mut self.mapper[idx]
    }

    /// Release every descriptor. Calling it on an empty list does nothing.
    pub fn map_free(&mut self) {
        if !self.mapper.is_empty() {
            tracing::trace!(descriptors = self.mapper.len(), "freeing mapper list");
        }
        self.mapper.clear();
    }
}

/// Resolve a mapper list into the local and remote member identities of the
/// new communicator. Descriptors targeting the same side are concatenated in
/// list order.
pub fn resolve(mapper: &[CommMap]) -> Result<(Vec<Lpid>, Vec<Lpid>)> {
    let mut local = Vec::new();
    let mut remote = Vec::new();
    for m in mapper {
        let lpids = m.lpids()?;
        if m.dir.to_remote() {
            remote.extend(lpids);
        } else {
            local.extend(lpids);
        }
    }
    Ok((local, remote))
}
