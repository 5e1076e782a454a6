use async_trait::async_trait;
use conclave_cluster::{
    DiscoveryConfig, DiscoveryEvent, DiscoveryEventKind, DiscoveryListener, DiscoveryManager,
    NoopExchange,
};
use conclave_common::{codec, EventLog, EventRecord, NodeId};
use conclave_store::{MemoryStore, SessionResult, StoreConnector, StoreSession};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<DiscoveryEvent>>,
}

impl DiscoveryListener for RecordingListener {
    fn on_discovery(&self, event: DiscoveryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingListener {
    fn events(&self) -> Vec<DiscoveryEvent> {
        self.events.lock().unwrap().clone()
    }

    fn kinds(&self) -> Vec<DiscoveryEventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn new_node(
    store: &MemoryStore,
    instance: &str,
    session_timeout: Duration,
) -> (DiscoveryManager, Arc<RecordingListener>) {
    let listener = Arc::new(RecordingListener::default());

    let config = DiscoveryConfig {
        cluster_name: "itest".to_string(),
        instance_name: instance.to_string(),
        session_timeout,
        ..Default::default()
    };

    let manager = DiscoveryManager::new(
        config,
        listener.clone(),
        Arc::new(NoopExchange),
        Arc::new(store.clone()),
    )
    .unwrap();

    (manager, listener)
}

fn persisted_log(store: &MemoryStore) -> EventLog {
    codec::decode(&store.data("/conclave/itest/events").unwrap()).unwrap()
}

#[tokio::test]
async fn test_cold_start_single_node() {
    let store = MemoryStore::new();
    let (a, listener) = new_node(&store, "a", Duration::from_secs(5));

    a.join_topology().await.unwrap();

    let local = a.local_node();
    assert_eq!(local.order, 1);
    assert_eq!(local.internal_id, 0);
    assert!(local.local);
    assert!(a.cluster_start_time() > 0);

    // Path tree created, alive entry carries join seq 0 and store seq 0.
    let alive = store.children_of("/conclave/itest/alive");
    assert_eq!(alive, vec![format!("{}|0|0000000000", local.id)]);
    assert!(store.node_exists("/conclave/itest/joinData"));
    assert!(store.node_exists("/conclave/itest/customEvents"));

    // Fresh lineage: the events payload is empty until the first event.
    assert_eq!(store.data("/conclave/itest/events").unwrap(), Vec::<u8>::new());

    let events = listener.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, DiscoveryEventKind::NodeJoined);
    assert_eq!(events[0].top_ver, 1);
    assert_eq!(events[0].node.id, local.id);
    assert_eq!(events[0].snapshot.len(), 1);
    assert!(events[0].message.is_none());

    a.stop().await;
}

#[tokio::test]
async fn test_second_node_join() {
    let store = MemoryStore::new();
    let (a, la) = new_node(&store, "a", Duration::from_secs(5));
    let (b, lb) = new_node(&store, "b", Duration::from_secs(5));

    a.join_topology().await.unwrap();
    b.join_topology().await.unwrap();

    let b_local = b.local_node();
    assert_eq!(b_local.order, 2);
    assert_eq!(b_local.internal_id, 1);

    // B bootstrapped from the pre-join snapshot [A] plus itself.
    let b_events = lb.events();
    assert_eq!(b_events.len(), 1);
    assert_eq!(b_events[0].kind, DiscoveryEventKind::NodeJoined);
    assert_eq!(b_events[0].top_ver, 2);
    assert_eq!(b_events[0].node.id, b_local.id);
    assert_eq!(b_events[0].snapshot.len(), 2);
    assert_eq!(b_events[0].snapshot[0].id, a.local_node().id);
    assert_eq!(b_events[0].snapshot[1].id, b_local.id);

    // The coordinator notifies the same join.
    wait_until("coordinator to observe the join", || la.events().len() == 2).await;

    let a_events = la.events();
    assert_eq!(a_events[1].kind, DiscoveryEventKind::NodeJoined);
    assert_eq!(a_events[1].top_ver, 2);
    assert_eq!(a_events[1].node.id, b_local.id);

    // Both members now resolve each other.
    assert!(a.ping_node(&b_local.id));
    assert!(b.ping_node(&a.local_node().id));
    assert!(a.known_node(&b_local.id).await.unwrap());
    assert_eq!(b.cluster_start_time(), a.cluster_start_time());

    // Persisted log: one join event, identifiers only.
    let log = persisted_log(&store);
    assert_eq!(log.top_ver, 2);
    assert_eq!(log.evt_id_gen, 1);
    assert_eq!(log.events.len(), 1);

    match &log.events[&1] {
        EventRecord::NodeJoined {
            event_id,
            top_ver,
            node_id,
            joined_internal_id,
            joining_data,
        } => {
            assert_eq!(*event_id, 1);
            assert_eq!(*top_ver, 2);
            assert_eq!(*node_id, b_local.id);
            assert_eq!(*joined_internal_id, 1);
            assert!(joining_data.is_none());
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    // Join side paths persisted for the joiner.
    assert!(store.node_exists("/conclave/itest/events/1"));
    assert!(store.node_exists("/conclave/itest/events/1/joined"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_coordinator_crash_promotes_next_member() {
    let store = MemoryStore::new();
    let (a, _la) = new_node(&store, "a", Duration::from_secs(5));
    let (b, lb) = new_node(&store, "b", Duration::from_secs(5));
    let (c, lc) = new_node(&store, "c", Duration::from_secs(5));

    a.join_topology().await.unwrap();
    b.join_topology().await.unwrap();
    c.join_topology().await.unwrap();

    wait_until("all members to see three nodes", || {
        b.topology_snapshot().len() == 3 && c.topology_snapshot().len() == 3
    })
    .await;

    let a_id = a.local_node().id;

    // A's session was opened first.
    store.expire(store.session_ids()[0]);

    wait_until("fail event on both survivors", || {
        lb.kinds().contains(&DiscoveryEventKind::NodeFailed)
            && lc.kinds().contains(&DiscoveryEventKind::NodeFailed)
    })
    .await;

    for listener in [&lb, &lc] {
        let fail = listener
            .events()
            .into_iter()
            .find(|e| e.kind == DiscoveryEventKind::NodeFailed)
            .unwrap();

        assert_eq!(fail.node.id, a_id);
        assert_eq!(fail.top_ver, 4);
        assert_eq!(fail.snapshot.len(), 2);
    }

    // The new coordinator persisted the fail event.
    let log = persisted_log(&store);
    assert_eq!(log.top_ver, 4);

    // Every joined member observes the same notification sequence; C's
    // stream is B's stream minus the events before C joined.
    let b_tail: Vec<(DiscoveryEventKind, u64)> = lb
        .events()
        .iter()
        .skip_while(|e| e.top_ver < 3)
        .map(|e| (e.kind, e.top_ver))
        .collect();
    let c_stream: Vec<(DiscoveryEventKind, u64)> =
        lc.events().iter().map(|e| (e.kind, e.top_ver)).collect();
    assert_eq!(b_tail, c_stream);

    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn test_custom_message_round_trip_with_acks() {
    let store = MemoryStore::new();
    let (a, la) = new_node(&store, "a", Duration::from_secs(5));
    let (b, lb) = new_node(&store, "b", Duration::from_secs(5));

    a.join_topology().await.unwrap();
    b.join_topology().await.unwrap();

    wait_until("coordinator to observe the join", || la.events().len() == 2).await;

    b.send_custom_message(b"deploy wave 1").await.unwrap();

    wait_until("custom event on both members", || {
        la.kinds().contains(&DiscoveryEventKind::Custom)
            && lb.kinds().contains(&DiscoveryEventKind::Custom)
    })
    .await;

    for listener in [&la, &lb] {
        let custom = listener
            .events()
            .into_iter()
            .find(|e| e.kind == DiscoveryEventKind::Custom)
            .unwrap();

        assert_eq!(custom.node.id, b.local_node().id);
        assert_eq!(custom.message.as_deref(), Some(&b"deploy wave 1"[..]));

        // Custom events leave the topology version untouched.
        assert_eq!(custom.top_ver, 2);
        assert_eq!(custom.snapshot.len(), 2);
    }

    // Once B acknowledged, the coordinator garbage-collects the event node.
    wait_until("custom event node cleanup", || {
        store.children_of("/conclave/itest/customEvents").is_empty()
    })
    .await;

    let log = persisted_log(&store);
    assert_eq!(log.top_ver, 2);
    assert_eq!(log.evt_id_gen, 2);
    assert_eq!(log.proc_cust_evt, 0);

    match &log.events[&2] {
        EventRecord::Custom {
            sender_node_id,
            message,
            ..
        } => {
            assert_eq!(*sender_node_id, b.local_node().id);
            assert!(message.is_none());
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_transient_disconnect_is_externally_invisible() {
    let store = MemoryStore::new();
    let (a, la) = new_node(&store, "a", Duration::from_secs(5));
    let (b, lb) = new_node(&store, "b", Duration::from_secs(5));

    a.join_topology().await.unwrap();
    b.join_topology().await.unwrap();

    wait_until("coordinator to observe the join", || la.events().len() == 2).await;

    // B drops off the network for a moment, well inside its session timeout.
    let b_session = store.session_ids()[1];
    store.disconnect(b_session);
    tokio::time::sleep(Duration::from_millis(200)).await;
    store.reconnect(b_session);

    // B is still a member and fully operational.
    b.send_custom_message(b"still here").await.unwrap();

    wait_until("custom event after reconnect", || {
        lb.kinds().contains(&DiscoveryEventKind::Custom)
    })
    .await;

    assert_eq!(a.topology_snapshot().len(), 2);
    assert_eq!(b.topology_snapshot().len(), 2);

    for listener in [&la, &lb] {
        let kinds = listener.kinds();
        assert!(!kinds.contains(&DiscoveryEventKind::NodeFailed));
        assert!(!kinds.contains(&DiscoveryEventKind::NodeSegmented));
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_session_expiry_segments_member() {
    let store = MemoryStore::new();
    let (a, la) = new_node(&store, "a", Duration::from_secs(5));
    let (b, lb) = new_node(&store, "b", Duration::from_secs(5));

    a.join_topology().await.unwrap();
    b.join_topology().await.unwrap();

    wait_until("coordinator to observe the join", || la.events().len() == 2).await;

    store.expire(store.session_ids()[1]);

    wait_until("segmentation on B", || {
        lb.kinds().contains(&DiscoveryEventKind::NodeSegmented)
    })
    .await;

    let segmented = lb
        .events()
        .into_iter()
        .find(|e| e.kind == DiscoveryEventKind::NodeSegmented)
        .unwrap();

    assert_eq!(segmented.node.id, b.local_node().id);
    assert_eq!(segmented.top_ver, 2);
    assert!(segmented.snapshot.is_empty());

    // The coordinator turns the expiry into a fail event.
    wait_until("fail event on A", || {
        la.kinds().contains(&DiscoveryEventKind::NodeFailed)
    })
    .await;

    assert_eq!(a.topology_snapshot().len(), 1);

    a.stop().await;
    b.stop().await;
}

/// Connector whose sessions are born disconnected; the store never becomes
/// reachable within the session timeout.
struct UnreachableConnector {
    store: MemoryStore,
}

#[async_trait]
impl StoreConnector for UnreachableConnector {
    async fn connect(
        &self,
        _connect_string: &str,
        _session_timeout: Duration,
    ) -> SessionResult<Arc<dyn StoreSession>> {
        let session = self.store.connect();
        self.store.disconnect(session.id());

        Ok(session)
    }
}

#[tokio::test]
async fn test_join_fails_when_store_is_unreachable() {
    let store = MemoryStore::new();
    let listener = Arc::new(RecordingListener::default());

    let config = DiscoveryConfig {
        cluster_name: "itest".to_string(),
        session_timeout: Duration::from_millis(200),
        ..Default::default()
    };

    let manager = DiscoveryManager::new(
        config,
        listener.clone(),
        Arc::new(NoopExchange),
        Arc::new(UnreachableConnector { store }),
    )
    .unwrap();

    let err = manager.join_topology().await.unwrap_err();
    assert!(err.is_client_failed());

    // Never joined, so nothing was notified.
    assert!(listener.events().is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn test_stopped_member_generates_fail_event() {
    let store = MemoryStore::new();
    let (a, la) = new_node(&store, "a", Duration::from_secs(5));
    let (b, _lb) = new_node(&store, "b", Duration::from_secs(5));

    a.join_topology().await.unwrap();
    b.join_topology().await.unwrap();

    wait_until("coordinator to observe the join", || la.events().len() == 2).await;

    let b_id = b.local_node().id;

    // Graceful stop closes the session, releasing the ephemerals.
    b.stop().await;

    wait_until("fail event on A", || {
        la.kinds().contains(&DiscoveryEventKind::NodeFailed)
    })
    .await;

    let fail = la
        .events()
        .into_iter()
        .find(|e| e.kind == DiscoveryEventKind::NodeFailed)
        .unwrap();

    assert_eq!(fail.node.id, b_id);
    assert!(!a.ping_node(&b_id));
    assert!(!a.known_node(&b_id).await.unwrap());

    a.stop().await;
}

#[tokio::test]
async fn test_join_and_crash_interleaving_keeps_ids_unique() {
    let store = MemoryStore::new();
    let (a, la) = new_node(&store, "a", Duration::from_secs(5));
    let (b, _lb) = new_node(&store, "b", Duration::from_secs(5));

    a.join_topology().await.unwrap();
    b.join_topology().await.unwrap();

    wait_until("coordinator to observe the join", || la.events().len() == 2).await;

    // B crashes, then a new node joins: internal ids and orders keep
    // increasing, nothing is reused.
    store.expire(store.session_ids()[1]);

    wait_until("fail event on A", || {
        la.kinds().contains(&DiscoveryEventKind::NodeFailed)
    })
    .await;

    let (c, _lc) = new_node(&store, "c", Duration::from_secs(5));
    c.join_topology().await.unwrap();

    let c_local = c.local_node();
    assert_eq!(c_local.internal_id, 2);
    assert_eq!(c_local.order, 4);

    let log = persisted_log(&store);
    assert_eq!(log.top_ver, 4);

    let ids: Vec<NodeId> = a.topology_snapshot().iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![a.local_node().id, c_local.id]);

    a.stop().await;
    c.stop().await;
}
