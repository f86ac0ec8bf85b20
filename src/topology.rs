//! The topology collaborator and the per-process node map.

use crate::group::Lpid;

/// Identifier of a (possibly virtual) node.
pub type NodeId = i32;

/// Source of placement information for the processes of the job.
///
/// Node ids are known for every process; hardware and neighborhood queries
/// only describe the calling process.
pub trait Topology: Send + Sync {
    /// Number of processes in the world communicator.
    fn world_size(&self) -> usize;

    /// The calling process's rank in the world communicator.
    fn world_rank(&self) -> usize;

    /// Physical node of process `lpid`, if known.
    fn node_id(&self, lpid: Lpid) -> Option<NodeId>;

    /// Index of the hardware resource of type `resource_type` (e.g. `"socket"`,
    /// `"numanode"`, `"l3cache"`) the calling process is bound to.
    fn hw_resource(&self, resource_type: &str) -> Option<u32> {
        let _ = resource_type;
        None
    }

    /// Hardware resource types below the node, coarsest first.
    fn hw_levels(&self) -> Vec<String> {
        Vec::new()
    }

    /// Identifier of the filesystem that backs `dirname` as seen by the caller.
    ///
    /// Processes sharing an identifier see the same directory contents.
    fn common_directory(&self, dirname: &str) -> Option<u32> {
        let _ = dirname;
        None
    }

    /// Network fabric domain (e.g. switch or group) of the caller at `level`.
    fn network_domain(&self, level: &str) -> Option<u32> {
        let _ = level;
        None
    }
}

/// Node id of every world process, after clique partitioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMap {
    ids: Vec<Option<NodeId>>,
}

impl NodeMap {
    /// Build the node map from the topology collaborator.
    ///
    /// With `cliques > 1`, the processes of every physical node are split into
    /// `cliques` virtual nodes of consecutive local ranks; with `odd_even`
    /// (and `cliques <= 1`) they are split by world-rank parity. Virtual node ids
    /// are renumbered densely in order of first appearance.
    pub fn from_topology(topology: &dyn Topology, cliques: usize, odd_even: bool) -> Self {
        let raw: Vec<Option<NodeId>> = (0..topology.world_size() as Lpid)
            .map(|lpid| topology.node_id(lpid))
            .collect();
        NodeMap::with_cliques(raw, cliques, odd_even)
    }

    /// Build a node map from explicit per-process node ids.
    pub fn with_cliques(raw: Vec<Option<NodeId>>, cliques: usize, odd_even: bool) -> Self {
        if cliques <= 1 && !odd_even {
            return NodeMap { ids: raw };
        }

        let mut virtual_ids: Vec<Option<(NodeId, usize)>> = Vec::with_capacity(raw.len());
        if cliques > 1 {
            for (lpid, node) in raw.iter().enumerate() {
                let Some(node) = *node else {
                    virtual_ids.push(None);
                    continue;
                };
                let local_index = raw[..lpid].iter().filter(|n| **n == Some(node)).count();
                let local_count = raw.iter().filter(|n| **n == Some(node)).count();
                virtual_ids.push(Some((node, local_index * cliques / local_count)));
            }
        } else {
            for (lpid, node) in raw.iter().enumerate() {
                virtual_ids.push(node.map(|n| (n, lpid % 2)));
            }
        }

        let mut seen: Vec<(NodeId, usize)> = Vec::new();
        let ids = virtual_ids
            .into_iter()
            .map(|v| {
                v.map(|key| match seen.iter().position(|s| *s == key) {
                    Some(i) => i as NodeId,
                    None => {
                        seen.push(key);
                        (seen.len() - 1) as NodeId
                    }
                })
            })
            .collect();
        NodeMap { ids }
    }

    /// Node id of process `lpid`.
    pub fn node_of(&self, lpid: Lpid) -> Option<NodeId> {
        self.ids.get(lpid as usize).copied().flatten()
    }

    /// Number of processes described.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_nodes_of_four() -> Vec<Option<NodeId>> {
        vec![Some(0), Some(0), Some(0), Some(0), Some(1), Some(1), Some(1), Some(1)]
    }

    #[test]
    fn no_cliques_is_identity() {
        let map = NodeMap::with_cliques(two_nodes_of_four(), 1, false);
        assert_eq!(map.node_of(3), Some(0));
        assert_eq!(map.node_of(4), Some(1));
        assert_eq!(map.node_of(99), None);
    }

    #[test]
    fn block_cliques_split_each_node() {
        let map = NodeMap::with_cliques(two_nodes_of_four(), 2, false);
        let ids: Vec<_> = (0..8).map(|p| map.node_of(p).unwrap()).collect();
        assert_eq!(ids, vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn odd_even_cliques_split_by_parity() {
        let map = NodeMap::with_cliques(two_nodes_of_four(), 1, true);
        let ids: Vec<_> = (0..8).map(|p| map.node_of(p).unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 0, 1, 2, 3, 2, 3]);
    }

    #[test]
    fn unknown_nodes_stay_unknown() {
        let map = NodeMap::with_cliques(vec![Some(5), None, Some(5)], 2, false);
        assert_eq!(map.node_of(1), None);
        assert_eq!(map.node_of(0), Some(0));
        assert_eq!(map.node_of(2), Some(1));
    }
}
