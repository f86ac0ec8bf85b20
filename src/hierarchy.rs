//! Hierarchy Builder: decomposition of a communicator by node.
//!
//! A decomposed ([`HierarchyKind::Parent`]) communicator owns a node-local
//! sub-communicator (every rank) and a node-roots sub-communicator (only the
//! lowest rank of every node), plus lookup tables from its ranks to ranks in
//! those sub-communicators. Nodes are numbered in order of first appearance,
//! so node `k`'s root is rank `k` of the node-roots communicator.
//!
//! Communicators of size 1, communicators whose ranks all sit on distinct
//! nodes and communicators containing a process of unknown node stay
//! [`HierarchyKind::Flat`].

use std::sync::Arc;

use crate::comm::{Comm, CommKind};
use crate::context_id::SubcommKind;
use crate::error::Result;
use crate::map::{MapDir, Mapping};
use crate::topology::NodeId;
use crate::Shared;

/// Role of a communicator in a node decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HierarchyKind {
    /// Not decomposed
    Flat,
    /// Owns node and node-roots sub-communicators
    Parent,
    /// Is a node-roots sub-communicator
    NodeRoots,
    /// Is a node-local sub-communicator
    Node,
}

/// Per-rank lookup tables of a decomposed communicator.
///
/// Both variants answer every query identically; the consecutive form is used
/// when each node's ranks form a contiguous range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTables {
    /// Node `k` holds ranks `starts[k]..starts[k + 1]`.
    Consecutive {
        /// Range starts, with the total size appended
        starts: Vec<usize>,
        /// Node index of the calling process
        my_node: usize,
    },
    /// Explicit per-rank tables.
    Explicit {
        /// Rank in the caller's node communicator, if on the caller's node
        intranode: Vec<Option<usize>>,
        /// Node index, which is also the node root's rank in node-roots
        internode: Vec<usize>,
    },
}

impl NodeTables {
    /// Rank of `rank` within the caller's node communicator, or `None` if
    /// `rank` is on another node.
    pub fn intranode(&self, rank: usize) -> Option<usize> {
        match self {
            NodeTables::Consecutive { starts, my_node } => {
                let (lo, hi) = (starts[*my_node], starts[*my_node + 1]);
                (lo..hi).contains(&rank).then(|| rank - lo)
            }
            NodeTables::Explicit { intranode, .. } => intranode.get(rank).copied().flatten(),
        }
    }

    /// Rank of `rank`'s node root within the node-roots communicator.
    pub fn internode(&self, rank: usize) -> Option<usize> {
        match self {
            NodeTables::Consecutive { starts, .. } => {
                if rank >= *starts.last()? {
                    return None;
                }
                Some(starts.partition_point(|&s| s <= rank) - 1)
            }
            NodeTables::Explicit { internode, .. } => internode.get(rank).copied(),
        }
    }

    /// Number of ranks described.
    pub fn len(&self) -> usize {
        match self {
            NodeTables::Consecutive { starts, .. } => starts.last().copied().unwrap_or(0),
            NodeTables::Explicit { internode, .. } => internode.len(),
        }
    }

    /// Whether no ranks are described.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A communicator's node decomposition.
#[derive(Debug)]
pub struct Hierarchy {
    kind: HierarchyKind,
    node_comm: Option<Arc<Comm>>,
    node_roots_comm: Option<Arc<Comm>>,
    tables: Option<NodeTables>,
    node_count: usize,
}

/// Hierarchy of a communicator that is not (yet) decomposed.
pub(crate) static FLAT: Hierarchy = Hierarchy {
    kind: HierarchyKind::Flat,
    node_comm: None,
    node_roots_comm: None,
    tables: None,
    node_count: 0,
};

impl Hierarchy {
    /// Hierarchy of a communicator that is never decomposed itself.
    pub(crate) fn leaf(kind: HierarchyKind, comm: &Comm) -> Self {
        let node_count = match kind {
            HierarchyKind::Node => 1,
            HierarchyKind::NodeRoots => comm.size(),
            HierarchyKind::Flat | HierarchyKind::Parent => 0,
        };
        Hierarchy {
            kind,
            node_comm: None,
            node_roots_comm: None,
            tables: None,
            node_count,
        }
    }

    /// Role tag.
    pub fn kind(&self) -> HierarchyKind {
        self.kind
    }

    /// Node-local sub-communicator.
    pub fn node_comm(&self) -> Option<&Arc<Comm>> {
        self.node_comm.as_ref()
    }

    /// Node-roots sub-communicator (node roots only).
    pub fn node_roots_comm(&self) -> Option<&Arc<Comm>> {
        self.node_roots_comm.as_ref()
    }

    /// Lookup tables, on decomposed communicators.
    pub fn tables(&self) -> Option<&NodeTables> {
        self.tables.as_ref()
    }

    /// Number of distinct nodes (`0` when unknown).
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// See [`NodeTables::intranode`].
    pub fn intranode_rank(&self, rank: usize) -> Option<usize> {
        self.tables.as_ref()?.intranode(rank)
    }

    /// See [`NodeTables::internode`].
    pub fn internode_rank(&self, rank: usize) -> Option<usize> {
        self.tables.as_ref()?.internode(rank)
    }
}

/// Node placement of a communicator's ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLayout {
    /// Node index (order of first appearance) of every rank
    pub node_of_rank: Vec<usize>,
    /// Lowest rank of every node
    pub roots: Vec<usize>,
    /// Whether every node's ranks are contiguous
    pub consecutive: bool,
}

impl NodeLayout {
    /// Compute the layout from one node id per rank.
    pub fn from_node_ids(ids: &[NodeId]) -> Self {
        let mut seen: Vec<NodeId> = Vec::new();
        let mut roots = Vec::new();
        let mut node_of_rank = Vec::with_capacity(ids.len());
        for (rank, id) in ids.iter().enumerate() {
            let idx = match seen.iter().position(|s| s == id) {
                Some(i) => i,
                None => {
                    seen.push(*id);
                    roots.push(rank);
                    seen.len() - 1
                }
            };
            node_of_rank.push(idx);
        }
        let consecutive = node_of_rank.windows(2).all(|w| w[1] == w[0] || w[1] == w[0] + 1);
        NodeLayout {
            node_of_rank,
            roots,
            consecutive,
        }
    }

    /// Number of distinct nodes.
    pub fn node_count(&self) -> usize {
        self.roots.len()
    }

    /// Ranks on node `node`, ascending.
    pub fn members(&self, node: usize) -> Vec<usize> {
        self.node_of_rank
            .iter()
            .enumerate()
            .filter_map(|(r, &n)| (n == node).then_some(r))
            .collect()
    }

    /// Lookup tables as seen from `my_rank`.
    pub fn tables(&self, my_rank: usize) -> NodeTables {
        let my_node = self.node_of_rank[my_rank];
        if self.consecutive {
            let mut starts = self.roots.clone();
            starts.push(self.node_of_rank.len());
            return NodeTables::Consecutive { starts, my_node };
        }
        let mut next = 0;
        let intranode = self
            .node_of_rank
            .iter()
            .map(|&n| {
                (n == my_node).then(|| {
                    next += 1;
                    next - 1
                })
            })
            .collect();
        NodeTables::Explicit {
            intranode,
            internode: self.node_of_rank.clone(),
        }
    }
}

/// Decompose the intracommunicator `comm` by node.
///
/// Sub-communicators reuse `comm`'s context prefix, inherit its sequence
/// number, taint and hints, and are committed without further decomposition.
pub(crate) fn build(comm: &Arc<Comm>, shared: &Arc<Shared>) -> Result<Hierarchy> {
    let size = comm.size();
    let ids: Option<Vec<NodeId>> = comm
        .local_lpids()
        .iter()
        .map(|&p| shared.node_map.node_of(p))
        .collect();
    let Some(ids) = ids else {
        tracing::debug!(handle = %comm.handle(), "node of some rank unknown, not decomposing");
        return Ok(Hierarchy::leaf(HierarchyKind::Flat, comm));
    };

    let layout = NodeLayout::from_node_ids(&ids);
    let node_count = layout.node_count();
    if node_count == size {
        return Ok(Hierarchy {
            node_count,
            ..Hierarchy::leaf(HierarchyKind::Flat, comm)
        });
    }

    let my_node = layout.node_of_rank[comm.rank()];
    let node_comm = build_subcomm(
        comm,
        shared,
        layout.members(my_node),
        SubcommKind::IntraNode,
        HierarchyKind::Node,
    )?;

    let node_roots_comm = if layout.roots.contains(&comm.rank()) {
        match build_subcomm(
            comm,
            shared,
            layout.roots.clone(),
            SubcommKind::InterNode,
            HierarchyKind::NodeRoots,
        ) {
            Ok(c) => Some(c),
            Err(e) => {
                if let Err(cleanup) = node_comm.release() {
                    tracing::warn!(error = %cleanup, "failed to release node communicator");
                }
                return Err(e);
            }
        }
    } else {
        None
    };

    tracing::debug!(
        handle = %comm.handle(),
        node_count,
        node_size = node_comm.size(),
        consecutive = layout.consecutive,
        "communicator decomposed by node"
    );
    Ok(Hierarchy {
        kind: HierarchyKind::Parent,
        node_comm: Some(node_comm),
        node_roots_comm,
        tables: Some(layout.tables(comm.rank())),
        node_count,
    })
}

fn build_subcomm(
    parent: &Arc<Comm>,
    shared: &Arc<Shared>,
    members: Vec<usize>,
    subcomm: SubcommKind,
    kind: HierarchyKind,
) -> Result<Arc<Comm>> {
    let size = members.len();
    let mut builder = crate::comm::CommBuilder::new(shared)?
        .kind(CommKind::Intra)
        .borrowed_context(parent.context_id().with_subcomm(subcomm))
        .hierarchy_kind(kind)
        .inherit_from(parent)
        .copy_hints(parent)
        .skip_hint_check();
    builder.map_irregular(parent, Some(Mapping::Owned(members)), size, MapDir::L2L);
    builder.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_layout_tables() {
        let layout = NodeLayout::from_node_ids(&[7, 7, 7, 7, 3, 3, 3, 3]);
        assert!(layout.consecutive);
        assert_eq!(layout.node_count(), 2);
        assert_eq!(layout.roots, vec![0, 4]);

        let tables = layout.tables(5);
        assert_eq!(tables.intranode(4), Some(0));
        assert_eq!(tables.intranode(7), Some(3));
        assert_eq!(tables.intranode(0), None);
        assert_eq!(tables.internode(3), Some(0));
        assert_eq!(tables.internode(6), Some(1));
        assert_eq!(tables.internode(8), None);
        assert_eq!(tables.len(), 8);
    }

    #[test]
    fn round_robin_layout_is_explicit() {
        let layout = NodeLayout::from_node_ids(&[0, 1, 0, 1, 0, 1]);
        assert!(!layout.consecutive);
        assert_eq!(layout.members(1), vec![1, 3, 5]);
        let tables = layout.tables(2);
        assert!(matches!(tables, NodeTables::Explicit { .. }));
        assert_eq!(tables.intranode(4), Some(2));
        assert_eq!(tables.intranode(3), None);
        assert_eq!(tables.internode(5), Some(1));
    }

    #[test]
    fn both_table_forms_agree() {
        let ids = [4, 4, 9, 9, 9, 2];
        let layout = NodeLayout::from_node_ids(&ids);
        assert!(layout.consecutive);
        let explicit = NodeLayout {
            consecutive: false,
            ..layout.clone()
        };
        for me in 0..ids.len() {
            let fast = layout.tables(me);
            let slow = explicit.tables(me);
            for r in 0..ids.len() {
                assert_eq!(fast.intranode(r), slow.intranode(r), "me={me} r={r}");
                assert_eq!(fast.internode(r), slow.internode(r), "me={me} r={r}");
            }
        }
    }

    #[test]
    fn partition_sums_to_size() {
        let ids = [1, 2, 1, 3, 2, 1, 3];
        let layout = NodeLayout::from_node_ids(&ids);
        let total: usize = (0..layout.node_count()).map(|n| layout.members(n).len()).sum();
        assert_eq!(total, ids.len());
        assert_eq!(layout.node_count(), 3);
    }
}
