//! Splitting communicators by color, and type-based splits.
//!
//! Every split shares one engine: the members exchange `(color, key)`, agree
//! on a context id, and each color class becomes a communicator ordered by key
//! with the original rank breaking ties. Type-based splits differ only in how
//! each process picks its color, which is the job of a [`SplitStrategy`].

use std::sync::Arc;

use crate::comm::{Comm, CommBuilder};
use crate::error::{Error, Result};
use crate::info::Info;
use crate::map::{MapDir, Mapping};
use crate::topology::{NodeMap, Topology};

/// Color that excludes the caller from every resulting communicator.
pub const UNDEFINED: i32 = -32766;

/// Info key selecting the hardware resource of a guided split.
pub const INFO_HW_RESOURCE_TYPE: &str = "mpi_hw_resource_type";
/// Resource type meaning "the whole node".
pub const HW_RESOURCE_SHARED_MEMORY: &str = "mpi_shared_memory";
/// Info key refining a shared-memory split by a hardware resource.
pub const INFO_SHMEM_TOPO: &str = "shmem_topo";
/// Info key selecting a directory for a neighborhood split.
pub const INFO_NBHD_COMMON_DIRNAME: &str = "nbhd_common_dirname";
/// Info key selecting a network level for a neighborhood split.
pub const INFO_NBHD_NETWORK: &str = "nbhd_network";

/// Split type of [`Comm::split_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitType {
    /// Caller is excluded
    Undefined,
    /// Processes that can share memory (same node)
    Shared,
    /// Every process alone
    SelfSplit,
    /// Processes sharing the hardware resource named by `mpi_hw_resource_type`
    HwGuided,
    /// The coarsest hardware level that actually divides the communicator
    HwUnguided,
    /// Processes sharing a directory (`nbhd_common_dirname`) or a network
    /// domain (`nbhd_network`)
    Neighborhood,
}

/// Picks the color of the calling process.
pub trait SplitStrategy {
    /// Color of the caller within `comm`; [`UNDEFINED`] excludes it.
    fn color(&self, comm: &Comm, topology: &dyn Topology, nodes: &NodeMap) -> Result<i32>;
}

/// Same physical (or virtual, with cliques) node.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByNode;

/// Every process its own color.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfColor;

/// Same hardware resource of the given type, e.g. `"socket"`.
#[derive(Debug, Clone)]
pub struct HwResource(pub String);

/// Same filesystem behind the given directory.
#[derive(Debug, Clone)]
pub struct CommonDirectory(pub String);

/// Same network domain at the given level.
#[derive(Debug, Clone)]
pub struct NetworkDomain(pub String);

fn color_of(id: Option<u32>) -> i32 {
    id.map_or(UNDEFINED, |v| (v & 0x7FFF_FFFF) as i32)
}

impl SplitStrategy for ByNode {
    fn color(&self, comm: &Comm, _: &dyn Topology, nodes: &NodeMap) -> Result<i32> {
        let me = comm.lpid(comm.rank()).ok_or(Error::InvalidRank(comm.rank() as i32))?;
        Ok(nodes.node_of(me).unwrap_or(UNDEFINED))
    }
}

impl SplitStrategy for SelfColor {
    fn color(&self, comm: &Comm, _: &dyn Topology, _: &NodeMap) -> Result<i32> {
        Ok(comm.rank() as i32)
    }
}

impl SplitStrategy for HwResource {
    fn color(&self, _: &Comm, topology: &dyn Topology, _: &NodeMap) -> Result<i32> {
        Ok(color_of(topology.hw_resource(&self.0)))
    }
}

impl SplitStrategy for CommonDirectory {
    fn color(&self, _: &Comm, topology: &dyn Topology, _: &NodeMap) -> Result<i32> {
        Ok(color_of(topology.common_directory(&self.0)))
    }
}

impl SplitStrategy for NetworkDomain {
    fn color(&self, _: &Comm, topology: &dyn Topology, _: &NodeMap) -> Result<i32> {
        Ok(color_of(topology.network_domain(&self.0)))
    }
}

/// Ranks of color `color`, ordered by key then by rank.
///
/// `entries[r]` is the `(color, key)` pair of rank `r`.
pub fn split_order(entries: &[(i32, i32)], color: i32) -> Vec<usize> {
    let mut members: Vec<(i32, usize)> = entries
        .iter()
        .enumerate()
        .filter(|(_, (c, _))| *c == color)
        .map(|(rank, (_, key))| (*key, rank))
        .collect();
    members.sort_unstable();
    members.into_iter().map(|(_, rank)| rank).collect()
}

impl Comm {
    /// Partition the communicator by `color`, ordering each part by `key`.
    ///
    /// Callers passing [`UNDEFINED`] get `None`. Collective.
    pub fn split(self: &Arc<Self>, color: i32, key: i32) -> Result<Option<Arc<Comm>>> {
        self.ensure_usable()?;
        if self.is_intercomm() {
            return Err(Error::NotSupported("split of an intercommunicator".into()));
        }
        let shared = self.shared()?;

        let gathered = shared
            .device
            .allgather(&self.scope(), &[i64::from(color), i64::from(key)])?;
        if gathered.len() != 2 * self.size() {
            return Err(Error::Internal(format!(
                "split exchange returned {} values",
                gathered.len()
            )));
        }
        let entries: Vec<(i32, i32)> = gathered
            .chunks_exact(2)
            .map(|c| (c[0] as i32, c[1] as i32))
            .collect();

        let lease = shared.context_ids.allocate(shared.device.as_ref(), &self.scope())?;
        if color == UNDEFINED {
            return Ok(None);
        }

        let members = split_order(&entries, color);
        let size = members.len();
        let mut builder = CommBuilder::new(&shared)?
            .context(lease)
            .inherit_from(self)
            .copy_hints(self);
        builder.map_irregular(self, Some(Mapping::Owned(members)), size, MapDir::L2L);
        builder.commit().map(Some)
    }

    /// Split with a color chosen by `strategy`. Collective.
    pub fn split_with(
        self: &Arc<Self>,
        strategy: &dyn SplitStrategy,
        key: i32,
    ) -> Result<Option<Arc<Comm>>> {
        self.ensure_usable()?;
        let shared = self.shared()?;
        let color = strategy.color(self, shared.topology.as_ref(), &shared.node_map)?;
        self.split(color, key)
    }

    /// Split by locality type. Collective; every process must pass the same
    /// `info` keys relevant to `split_type`.
    pub fn split_type(
        self: &Arc<Self>,
        split_type: SplitType,
        key: i32,
        info: &Info,
    ) -> Result<Option<Arc<Comm>>> {
        match split_type {
            SplitType::Undefined => self.split(UNDEFINED, key),
            SplitType::SelfSplit => self.split_with(&SelfColor, key),
            SplitType::Shared => {
                let node = self.split_with(&ByNode, key)?;
                match info.get(INFO_SHMEM_TOPO) {
                    Some(resource) => then_split(node, &HwResource(resource.to_string()), key),
                    None => Ok(node),
                }
            }
            SplitType::HwGuided => match info.get(INFO_HW_RESOURCE_TYPE) {
                Some(HW_RESOURCE_SHARED_MEMORY) => self.split_with(&ByNode, key),
                Some(resource) => {
                    let node = self.split_with(&ByNode, key)?;
                    then_split(node, &HwResource(resource.to_string()), key)
                }
                None => self.split(UNDEFINED, key),
            },
            SplitType::HwUnguided => self.split_unguided(key),
            SplitType::Neighborhood => {
                if let Some(dir) = info.get(INFO_NBHD_COMMON_DIRNAME) {
                    self.split_with(&CommonDirectory(dir.to_string()), key)
                } else if let Some(level) = info.get(INFO_NBHD_NETWORK) {
                    self.split_with(&NetworkDomain(level.to_string()), key)
                } else {
                    self.split(UNDEFINED, key)
                }
            }
        }
    }

    /// Node first, then each hardware level of the topology, coarsest first;
    /// the first level at which every resulting part is smaller than this
    /// communicator wins.
    fn split_unguided(self: &Arc<Self>, key: i32) -> Result<Option<Arc<Comm>>> {
        let node = self.split_with(&ByNode, key)?;
        let found = match self.all_smaller(node.as_ref()) {
            Ok(true) => return Ok(node),
            Ok(false) => self.split_below_node(node.as_ref(), key),
            Err(e) => Err(e),
        };
        let Some(node) = node else {
            return found;
        };
        match (found, node.release()) {
            (Ok(found), Ok(())) => Ok(found),
            (Ok(found), Err(e)) => {
                release_logged(found);
                Err(e)
            }
            (Err(e), released) => {
                if let Err(cleanup) = released {
                    tracing::warn!(error = %cleanup, "failed to release node communicator");
                }
                Err(e)
            }
        }
    }

    fn split_below_node(&self, node: Option<&Arc<Comm>>, key: i32) -> Result<Option<Arc<Comm>>> {
        let shared = self.shared()?;
        for level in shared.topology.hw_levels() {
            let candidate = match node {
                Some(n) => n.split_with(&HwResource(level.clone()), key)?,
                None => None,
            };
            match self.all_smaller(candidate.as_ref()) {
                Ok(true) => {
                    tracing::debug!(level = %level, "unguided split settled");
                    return Ok(candidate);
                }
                Ok(false) => {
                    if let Some(c) = candidate {
                        c.release()?;
                    }
                }
                Err(e) => {
                    release_logged(candidate);
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Whether every member's part is strictly smaller than this communicator.
    fn all_smaller(&self, part: Option<&Arc<Comm>>) -> Result<bool> {
        let shared = self.shared()?;
        let size = part.map_or(0, |c| c.size()) as i64;
        let sizes = shared.device.allgather(&self.scope(), &[size])?;
        Ok(sizes.iter().all(|&s| (s as usize) < self.size()))
    }
}

/// Split `parent` further with `strategy`, then drop the intermediate.
fn then_split(
    parent: Option<Arc<Comm>>,
    strategy: &dyn SplitStrategy,
    key: i32,
) -> Result<Option<Arc<Comm>>> {
    let Some(parent) = parent else {
        return Ok(None);
    };
    let result = parent.split_with(strategy, key);
    parent.release()?;
    result
}

fn release_logged(comm: Option<Arc<Comm>>) {
    if let Some(comm) = comm {
        if let Err(e) = comm.release() {
            tracing::warn!(error = %e, "failed to release communicator");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_by_key_then_rank() {
        let entries = [(0, 5), (1, 0), (0, 1), (0, 5), (1, -3), (UNDEFINED, 0)];
        assert_eq!(split_order(&entries, 0), vec![2, 0, 3]);
        assert_eq!(split_order(&entries, 1), vec![4, 1]);
        assert!(split_order(&entries, 7).is_empty());
    }

    #[test]
    fn unknown_resources_map_to_undefined() {
        assert_eq!(color_of(None), UNDEFINED);
        assert_eq!(color_of(Some(3)), 3);
        assert!(color_of(Some(u32::MAX)) >= 0);
    }
}
