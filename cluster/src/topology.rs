use conclave_common::{ClusterNode, NodeId};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// In-memory index of the current cluster membership.
///
/// All mutation happens on the discovery dispatch task; the concurrent maps
/// exist because node lookups are served to arbitrary caller tasks. Snapshot
/// iteration order is ascending join order.
pub struct TopologyIndex {
    by_id: DashMap<NodeId, Arc<ClusterNode>>,
    by_internal_id: DashMap<u64, Arc<ClusterNode>>,
    by_order: RwLock<BTreeMap<u64, Arc<ClusterNode>>>,
}

impl TopologyIndex {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_internal_id: DashMap::new(),
            by_order: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add_node(&self, node: Arc<ClusterNode>) {
        debug_assert!(node.assigned(), "node added without assigned order");

        self.by_id.insert(node.id, node.clone());
        self.by_internal_id.insert(node.internal_id, node.clone());
        self.by_order.write().insert(node.order, node);
    }

    pub fn remove_node(&self, internal_id: u64) -> Option<Arc<ClusterNode>> {
        let (_, node) = self.by_internal_id.remove(&internal_id)?;

        self.by_id.remove(&node.id);
        self.by_order.write().remove(&node.order);

        Some(node)
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<ClusterNode>> {
        self.by_id.get(id).map(|n| n.clone())
    }

    pub fn get_by_internal_id(&self, internal_id: u64) -> Option<Arc<ClusterNode>> {
        self.by_internal_id.get(&internal_id).map(|n| n.clone())
    }

    pub fn contains_internal_id(&self, internal_id: u64) -> bool {
        self.by_internal_id.contains_key(&internal_id)
    }

    /// Internal ids of all current members
    pub fn internal_ids(&self) -> Vec<u64> {
        self.by_internal_id.iter().map(|e| *e.key()).collect()
    }

    /// Current membership in ascending join order
    pub fn snapshot(&self) -> Vec<Arc<ClusterNode>> {
        self.by_order.read().values().cloned().collect()
    }

    /// Current membership keyed by join order
    pub fn order_map(&self) -> BTreeMap<u64, Arc<ClusterNode>> {
        self.by_order.read().clone()
    }

    pub fn remote_nodes(&self, local: &NodeId) -> Vec<Arc<ClusterNode>> {
        self.by_order
            .read()
            .values()
            .filter(|n| &n.id != local)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_order.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_order.read().is_empty()
    }
}

impl Default for TopologyIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(order: u64, internal_id: u64) -> Arc<ClusterNode> {
        let mut node = ClusterNode::new(NodeId::new(), Vec::new());
        node.order = order;
        node.internal_id = internal_id;

        Arc::new(node)
    }

    #[test]
    fn test_add_and_lookup() {
        let top = TopologyIndex::new();
        let a = node(1, 0);
        let b = node(2, 1);

        top.add_node(a.clone());
        top.add_node(b.clone());

        assert_eq!(top.len(), 2);
        assert_eq!(top.get(&a.id).unwrap().order, 1);
        assert_eq!(top.get_by_internal_id(1).unwrap().id, b.id);
        assert!(top.contains_internal_id(0));
        assert!(!top.contains_internal_id(7));
    }

    #[test]
    fn test_snapshot_is_in_join_order() {
        let top = TopologyIndex::new();

        // Inserted out of order on purpose.
        top.add_node(node(3, 5));
        top.add_node(node(1, 0));
        top.add_node(node(2, 1));

        let orders: Vec<u64> = top.snapshot().iter().map(|n| n.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_clears_all_indexes() {
        let top = TopologyIndex::new();
        let a = node(1, 0);

        top.add_node(a.clone());

        let removed = top.remove_node(0).unwrap();
        assert_eq!(removed.id, a.id);

        assert!(top.is_empty());
        assert!(top.get(&a.id).is_none());
        assert!(top.get_by_internal_id(0).is_none());
        assert!(top.remove_node(0).is_none());
    }
}
