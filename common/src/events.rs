use crate::node::{ClusterNode, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Payload a joining node publishes at its join-data entry: its own descriptor
/// plus the exchange-collected joining data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoiningNodeData {
    pub node: ClusterNode,
    pub discovery_data: HashMap<u32, Vec<u8>>,
}

/// Payload the coordinator persists for a joining node under
/// `events/{event_id}/joined`: the topology as it was before the join plus the
/// exchange-collected common data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinDataForJoined {
    pub topology: Vec<ClusterNode>,
    pub common_data: HashMap<u32, Vec<u8>>,
}

/// A single discovery event.
///
/// The serde-skipped fields are coordinator-local copies of the event payload,
/// kept to avoid a store round-trip when the coordinator notifies itself. The
/// persisted form carries identifiers only; other members fetch payloads from
/// the per-event side paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventRecord {
    NodeJoined {
        event_id: u64,
        top_ver: u64,
        node_id: NodeId,
        joined_internal_id: u64,
        #[serde(skip)]
        joining_data: Option<JoiningNodeData>,
    },
    NodeFailed {
        event_id: u64,
        top_ver: u64,
        failed_internal_id: u64,
    },
    Custom {
        event_id: u64,
        top_ver: u64,
        sender_node_id: NodeId,
        event_path: String,
        #[serde(skip)]
        message: Option<Vec<u8>>,
    },
}

impl EventRecord {
    pub fn event_id(&self) -> u64 {
        match self {
            EventRecord::NodeJoined { event_id, .. } => *event_id,
            EventRecord::NodeFailed { event_id, .. } => *event_id,
            EventRecord::Custom { event_id, .. } => *event_id,
        }
    }

    pub fn top_ver(&self) -> u64 {
        match self {
            EventRecord::NodeJoined { top_ver, .. } => *top_ver,
            EventRecord::NodeFailed { top_ver, .. } => *top_ver,
            EventRecord::Custom { top_ver, .. } => *top_ver,
        }
    }
}

/// Serialized, append-only record of discovery events, persisted as a single
/// payload at the events path. The coordinator is the only writer; every other
/// member replays it past its own high-water mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    /// Creation timestamp of the cluster lineage (ms since the epoch)
    pub cluster_start_time: u64,

    /// Monotone topology version, 1-based
    pub top_ver: u64,

    /// Monotone event id generator; equals the highest assigned event id
    pub evt_id_gen: u64,

    /// Highest custom-event store sequence already absorbed, -1 for none
    pub proc_cust_evt: i64,

    /// Events ordered by event id
    pub events: BTreeMap<u64, EventRecord>,
}

impl EventLog {
    pub fn new(cluster_start_time: u64) -> Self {
        Self {
            cluster_start_time,
            top_ver: 1,
            evt_id_gen: 0,
            proc_cust_evt: -1,
            events: BTreeMap::new(),
        }
    }

    pub fn add_event(&mut self, event: EventRecord) {
        debug_assert_eq!(event.event_id(), self.evt_id_gen);

        self.events.insert(event.event_id(), event);
    }

    /// Events strictly after the given id, in event-id order
    pub fn events_after(&self, event_id: i64) -> impl Iterator<Item = &EventRecord> {
        let from = if event_id < 0 { 0 } else { event_id as u64 + 1 };

        self.events.range(from..).map(|(_, evt)| evt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn joined_event(event_id: u64, top_ver: u64) -> EventRecord {
        EventRecord::NodeJoined {
            event_id,
            top_ver,
            node_id: NodeId::new(),
            joined_internal_id: event_id,
            joining_data: Some(JoiningNodeData {
                node: ClusterNode::new(NodeId::new(), Vec::new()),
                discovery_data: HashMap::new(),
            }),
        }
    }

    #[test]
    fn test_fresh_log() {
        let log = EventLog::new(123);

        assert_eq!(log.cluster_start_time, 123);
        assert_eq!(log.top_ver, 1);
        assert_eq!(log.evt_id_gen, 0);
        assert_eq!(log.proc_cust_evt, -1);
        assert!(log.events.is_empty());
    }

    #[test]
    fn test_events_after_high_water_mark() {
        let mut log = EventLog::new(0);

        for id in 1..=4u64 {
            log.top_ver += 1;
            log.evt_id_gen += 1;
            log.add_event(joined_event(id, log.top_ver));
        }

        let ids: Vec<u64> = log.events_after(2).map(|e| e.event_id()).collect();
        assert_eq!(ids, vec![3, 4]);

        // Sentinel -1 replays everything.
        assert_eq!(log.events_after(-1).count(), 4);

        // A mark at or past the end replays nothing.
        assert_eq!(log.events_after(4).count(), 0);
        assert_eq!(log.events_after(100).count(), 0);
    }

    #[test]
    fn test_in_memory_payload_not_persisted() {
        let mut log = EventLog::new(7);

        log.top_ver += 1;
        log.evt_id_gen += 1;
        log.add_event(joined_event(1, log.top_ver));

        log.evt_id_gen += 1;
        log.add_event(EventRecord::Custom {
            event_id: 2,
            top_ver: log.top_ver,
            sender_node_id: NodeId::new(),
            event_path: "sender|0000000000".to_string(),
            message: Some(vec![9, 9, 9]),
        });

        let bytes = codec::encode(&log).unwrap();
        let decoded: EventLog = codec::decode(&bytes).unwrap();

        assert_eq!(decoded.top_ver, log.top_ver);
        assert_eq!(decoded.evt_id_gen, log.evt_id_gen);
        assert_eq!(decoded.events.len(), 2);

        match &decoded.events[&1] {
            EventRecord::NodeJoined { joining_data, .. } => assert!(joining_data.is_none()),
            other => panic!("Unexpected event: {:?}", other),
        }

        match &decoded.events[&2] {
            EventRecord::Custom {
                message, event_path, ..
            } => {
                assert!(message.is_none());
                assert_eq!(event_path, "sender|0000000000");
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }
}
