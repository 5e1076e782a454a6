use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// A member of the cluster topology.
///
/// `internal_id` is the store-assigned sequence of the member's alive entry and
/// `order` is the topology version at which it joined. Both are zero until the
/// coordinator assigns them during join processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: NodeId,

    /// Topology version at which this node joined (1-based)
    pub order: u64,

    /// Store-assigned sequence of the node's alive entry
    pub internal_id: u64,

    /// Opaque consumer-supplied attributes payload
    pub attributes: Vec<u8>,

    /// True only on the node's own process
    #[serde(skip)]
    pub local: bool,
}

impl ClusterNode {
    pub fn new(id: NodeId, attributes: Vec<u8>) -> Self {
        Self {
            id,
            order: 0,
            internal_id: 0,
            attributes,
            local: false,
        }
    }

    /// A node is part of the topology once the coordinator assigned its order
    pub fn assigned(&self) -> bool {
        self.order > 0
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClusterNode [id={}, order={}, internalId={}, local={}]",
            self.id, self.order, self.internal_id, self.local
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_assignment() {
        let mut node = ClusterNode::new(NodeId::new(), Vec::new());
        assert!(!node.assigned());

        node.order = 3;
        node.internal_id = 2;
        assert!(node.assigned());
    }

    #[test]
    fn test_local_flag_not_serialized() {
        let mut node = ClusterNode::new(NodeId::new(), vec![1, 2, 3]);
        node.local = true;

        let bytes = bincode::serialize(&node).unwrap();
        let decoded: ClusterNode = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded.id, node.id);
        assert_eq!(decoded.attributes, node.attributes);
        assert!(!decoded.local);
    }
}
