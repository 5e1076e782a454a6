use conclave_common::{ClusterNode, NodeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Kind of a discovery notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEventKind {
    NodeJoined,
    NodeFailed,
    /// The local node lost its store session for longer than the session
    /// timeout and is no longer part of the cluster
    NodeSegmented,
    Custom,
}

/// A discovery notification delivered to the consumer.
///
/// `snapshot` is the topology immediately after applying the event, in
/// ascending join order. Every member observes the same sequence of events
/// with the same `top_ver` values.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub kind: DiscoveryEventKind,
    pub top_ver: u64,

    /// The node the event is about: the joined, failed or local node, or the
    /// sender of a custom message
    pub node: Arc<ClusterNode>,

    pub snapshot: Vec<Arc<ClusterNode>>,

    /// Reserved for topology history; currently always empty
    pub history: BTreeMap<u64, Vec<Arc<ClusterNode>>>,

    /// Custom message payload, present only for [`DiscoveryEventKind::Custom`]
    pub message: Option<Vec<u8>>,
}

/// Receives the ordered stream of discovery notifications.
///
/// Invoked on the discovery dispatch task; implementations must not block.
pub trait DiscoveryListener: Send + Sync {
    fn on_discovery(&self, event: DiscoveryEvent);
}

/// Carrier for application data moved between members during a join
#[derive(Debug, Clone, Default)]
pub struct ExchangeBag {
    pub node_id: NodeId,

    /// Data collected on (or about) a joining node
    pub joining_data: HashMap<u32, Vec<u8>>,

    /// Data collected on the cluster and delivered to a joining node
    pub common_data: HashMap<u32, Vec<u8>>,
}

impl ExchangeBag {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            joining_data: HashMap::new(),
            common_data: HashMap::new(),
        }
    }
}

/// Application-level data-exchange hook invoked around joins
pub trait DataExchange: Send + Sync {
    /// Fills the bag with the local node's contribution
    fn collect(&self, bag: &mut ExchangeBag);

    /// Absorbs data carried by a join: joining data on existing members,
    /// common data on the joining node itself
    fn on_exchange(&self, bag: &ExchangeBag);
}

/// Exchange hook for consumers that move no join data
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExchange;

impl DataExchange for NoopExchange {
    fn collect(&self, _bag: &mut ExchangeBag) {}

    fn on_exchange(&self, _bag: &ExchangeBag) {}
}
