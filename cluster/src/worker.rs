use crate::ack::AckTracker;
use crate::spi::{DataExchange, DiscoveryEvent, DiscoveryEventKind, DiscoveryListener, ExchangeBag};
use crate::topology::TopologyIndex;
use conclave_common::codec;
use conclave_common::paths::{self, AliveNodeName, ClusterPaths};
use conclave_common::{
    ClusterNode, ConclaveError, EventLog, EventRecord, JoinDataForJoined, JoiningNodeData, NodeId,
    Result,
};
use conclave_store::{ClientEvent, CreateMode, StoreClient, WatchEvent, WatchKind};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

/// Discovery state readable from arbitrary caller tasks
pub(crate) struct SharedState {
    pub topology: TopologyIndex,
    pub local: RwLock<Arc<ClusterNode>>,
    pub cluster_start_time: AtomicU64,
}

impl SharedState {
    pub fn new(local: ClusterNode) -> Self {
        Self {
            topology: TopologyIndex::new(),
            local: RwLock::new(Arc::new(local)),
            cluster_start_time: AtomicU64::new(0),
        }
    }
}

/// Armed predecessor watch of the coordinator election
struct ElectionWatch {
    crd_internal_id: u64,
    loc_internal_id: u64,
    prev_path: String,
}

/// The discovery dispatch task.
///
/// Owns every piece of mutable discovery state and consumes the client's
/// event stream serially, so all members replay the event log in the same
/// order. Everything here runs on one task; only `StoreClient` and the
/// concurrent topology index are touched from outside.
pub(crate) struct Worker {
    pub instance_name: String,
    pub paths: ClusterPaths,
    pub client: Arc<StoreClient>,
    pub listener: Arc<dyn DiscoveryListener>,
    pub exchange: Arc<dyn DataExchange>,
    pub shared: Arc<SharedState>,
    pub shutdown: Arc<Notify>,
    pub local_id: NodeId,
    pub local_attributes: Vec<u8>,

    pub joined: bool,
    pub crd: bool,
    pub last_proc_evt: i64,
    pub evts: Option<EventLog>,
    pub join_tx: Option<oneshot::Sender<Result<()>>>,
    pub ack_futs: HashMap<u64, AckTracker>,

    election: Option<ElectionWatch>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_name: String,
        paths: ClusterPaths,
        client: Arc<StoreClient>,
        listener: Arc<dyn DiscoveryListener>,
        exchange: Arc<dyn DataExchange>,
        shared: Arc<SharedState>,
        shutdown: Arc<Notify>,
        local_id: NodeId,
        local_attributes: Vec<u8>,
        join_tx: oneshot::Sender<Result<()>>,
    ) -> Self {
        Self {
            instance_name,
            paths,
            client,
            listener,
            exchange,
            shared,
            shutdown,
            local_id,
            local_attributes,
            joined: false,
            crd: false,
            last_proc_evt: -1,
            evts: None,
            join_tx: Some(join_tx),
            ack_futs: HashMap::new(),
            election: None,
        }
    }

    pub async fn run(mut self, join_data: Vec<u8>, mut events: UnboundedReceiver<ClientEvent>) {
        if let Err(e) = self.start_join(&join_data).await {
            self.on_fatal_error(e);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Discovery worker shutting down [instance={}]", self.instance_name);

                    break;
                }

                event = events.recv() => match event {
                    None => break,

                    Some(ClientEvent::ConnectionLost) => self.on_connection_lost(),

                    Some(ClientEvent::Watch(watch)) => {
                        if let Err(e) = self.on_watch(watch).await {
                            self.on_fatal_error(e);
                        }
                    }
                }
            }
        }

        self.fail_join(ConclaveError::Stopped);
    }

    /// Registers this member in the store and runs the initial election
    async fn start_join(&mut self, join_data: &[u8]) -> Result<()> {
        info!(
            "Joining cluster [nodeId={}, cluster={}, instance={}]",
            self.local_id, self.paths.cluster_dir, self.instance_name
        );

        self.init_store_tree().await?;

        // Arms the events watch before the member becomes visible, so no log
        // update can slip by unobserved.
        let initial_events = self.client.get_data_watch(&self.paths.evts_path).await?;

        let created = self
            .client
            .create(
                &self.paths.join_data_prefix(self.local_id),
                join_data,
                CreateMode::EphemeralSequential,
            )
            .await?;
        let join_seq = paths::sequence_of(&created)?;

        self.client
            .create(
                &self.paths.alive_node_prefix(self.local_id, join_seq),
                &[],
                CreateMode::EphemeralSequential,
            )
            .await?;

        let alive = self.client.get_children(&self.paths.alive_nodes_dir).await?;

        self.on_events_update_bytes(&initial_events).await?;
        self.check_is_coordinator(alive).await
    }

    /// Idempotently creates the cluster's directory tree. The alive directory
    /// is created last, so its existence implies the rest are present.
    async fn init_store_tree(&self) -> Result<()> {
        if self.client.exists(&self.paths.alive_nodes_dir).await? {
            return Ok(());
        }

        let mut acc = String::new();

        for segment in self.paths.base_path[1..].split('/') {
            acc.push('/');
            acc.push_str(segment);

            self.client
                .create(&acc, &[], CreateMode::Persistent)
                .await?;
        }

        for path in [
            &self.paths.cluster_dir,
            &self.paths.evts_path,
            &self.paths.join_data_dir,
            &self.paths.custom_evts_dir,
            &self.paths.alive_nodes_dir,
        ] {
            self.client.create(path, &[], CreateMode::Persistent).await?;
        }

        Ok(())
    }

    /// Election: the member with the smallest alive sequence coordinates;
    /// everyone else watches its direct predecessor.
    async fn check_is_coordinator(&mut self, mut alive: Vec<String>) -> Result<()> {
        loop {
            let mut alives: BTreeMap<u64, AliveNodeName> = BTreeMap::new();
            let mut loc_internal_id = None;

            for name in &alive {
                let parsed = AliveNodeName::parse(name)?;

                alives.insert(parsed.internal_id, parsed);

                if loc_internal_id.is_none() && parsed.node_id == self.local_id {
                    loc_internal_id = Some(parsed.internal_id);
                }
            }

            let loc_internal_id = loc_internal_id.ok_or_else(|| ConclaveError::Internal {
                message: "own alive entry not found in the store".to_string(),
            })?;

            let crd_internal_id = *alives.keys().next().expect("alive set contains self");

            if crd_internal_id == loc_internal_id {
                self.election = None;

                return self.on_become_coordinator(loc_internal_id).await;
            }

            let prev = alives
                .range(..loc_internal_id)
                .next_back()
                .map(|(_, parsed)| *parsed)
                .expect("a smaller alive entry exists");

            let prev_name = format!(
                "{}|{}|{:010}",
                prev.node_id, prev.join_seq, prev.internal_id
            );
            let prev_path = self.paths.alive_node_path(&prev_name);

            info!(
                "Discovery coordinator already exists, watching previous node [locId={}, prevPath={}]",
                self.local_id, prev_path
            );

            self.election = Some(ElectionWatch {
                crd_internal_id,
                loc_internal_id,
                prev_path: prev_path.clone(),
            });

            if self.client.exists_watch(&prev_path).await? {
                return Ok(());
            }

            // The predecessor is already gone.
            self.election = None;

            if loc_internal_id == crd_internal_id + 1 {
                info!(
                    "Previous discovery coordinator failed [locId={}]",
                    self.local_id
                );

                return self.on_become_coordinator(loc_internal_id).await;
            }

            info!(
                "Previous node failed, rechecking coordinator [locId={}]",
                self.local_id
            );

            alive = self.client.get_children(&self.paths.alive_nodes_dir).await?;
        }
    }

    async fn on_previous_node_fail(
        &mut self,
        crd_internal_id: u64,
        loc_internal_id: u64,
    ) -> Result<()> {
        if loc_internal_id == crd_internal_id + 1 {
            info!(
                "Previous discovery coordinator failed [locId={}]",
                self.local_id
            );

            return self.on_become_coordinator(loc_internal_id).await;
        }

        info!(
            "Previous node failed, rechecking coordinator [locId={}]",
            self.local_id
        );

        let alive = self.client.get_children(&self.paths.alive_nodes_dir).await?;

        self.check_is_coordinator(alive).await
    }

    async fn on_watch(&mut self, event: WatchEvent) -> Result<()> {
        match event.kind {
            WatchKind::DataChanged => {
                if event.path == self.paths.evts_path {
                    if !self.crd {
                        let data = self.client.get_data_watch(&event.path).await?;

                        self.on_events_update_bytes(&data).await?;
                    }
                } else {
                    warn!("Received data change for unexpected path: {}", event.path);
                }
            }

            WatchKind::ChildrenChanged => {
                if event.path == self.paths.alive_nodes_dir {
                    if self.crd {
                        let children = self.client.get_children_watch(&event.path).await?;

                        self.generate_topology_events(children).await?;
                    }
                } else if event.path == self.paths.custom_evts_dir {
                    if self.crd {
                        let children = self.client.get_children_watch(&event.path).await?;

                        self.generate_custom_events(children).await?;
                    }
                } else if self.crd && self.is_custom_event_path(&event.path) {
                    self.on_ack_children_changed(&event.path).await?;
                } else {
                    warn!(
                        "Received children change for unexpected path: {}",
                        event.path
                    );
                }
            }

            WatchKind::Deleted => {
                if let Some(watch) = self.election.take() {
                    if watch.prev_path == event.path {
                        return self
                            .on_previous_node_fail(watch.crd_internal_id, watch.loc_internal_id)
                            .await;
                    }

                    self.election = Some(watch);
                }

                // Deletions of completed custom-event nodes also land here.
                debug!("Ignoring deletion of {}", event.path);
            }

            WatchKind::Created => {}
        }

        Ok(())
    }

    fn is_custom_event_path(&self, path: &str) -> bool {
        path.strip_prefix(&self.paths.custom_evts_dir)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }

    pub(crate) async fn on_events_update_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let log: EventLog = codec::decode(data)?;

        self.replay(&log).await?;
        self.evts = Some(log);

        Ok(())
    }

    /// Replays events past the local high-water mark, in event-id order.
    /// Before the local join, everything except the local join event is
    /// skipped; the mark only advances once joined.
    pub(crate) async fn replay(&mut self, log: &EventLog) -> Result<()> {
        for event in log.events_after(self.last_proc_evt) {
            if !self.joined {
                if let EventRecord::NodeJoined {
                    event_id,
                    top_ver,
                    node_id,
                    joined_internal_id,
                    ..
                } = event
                {
                    if *node_id == self.local_id {
                        self.process_local_join(log, *event_id, *top_ver, *joined_internal_id)
                            .await?;
                    }
                }
            } else {
                debug!("Processing discovery event [eventId={}]", event.event_id());

                match event {
                    EventRecord::NodeJoined {
                        event_id,
                        top_ver,
                        node_id,
                        joined_internal_id,
                        joining_data,
                    } => {
                        self.process_node_joined(
                            *event_id,
                            *top_ver,
                            *node_id,
                            *joined_internal_id,
                            joining_data.as_ref(),
                        )
                        .await?;
                    }

                    EventRecord::NodeFailed {
                        top_ver,
                        failed_internal_id,
                        ..
                    } => {
                        self.process_node_failed(*top_ver, *failed_internal_id).await?;
                    }

                    EventRecord::Custom {
                        event_id,
                        top_ver,
                        sender_node_id,
                        event_path,
                        message,
                    } => {
                        self.process_custom(
                            *event_id,
                            *top_ver,
                            *sender_node_id,
                            event_path,
                            message.as_deref(),
                        )
                        .await?;
                    }
                }
            }

            if self.joined {
                self.last_proc_evt = event.event_id() as i64;
            }
        }

        Ok(())
    }

    /// Join bootstrap: adopt the coordinator-assigned identity and the
    /// topology snapshot persisted for this member.
    async fn process_local_join(
        &mut self,
        log: &EventLog,
        event_id: u64,
        top_ver: u64,
        internal_id: u64,
    ) -> Result<()> {
        info!(
            "Local join event received [nodeId={}, topVer={}]",
            self.local_id, top_ver
        );

        let path = self.paths.event_joined_data_path(event_id);
        let for_joined: JoinDataForJoined = codec::decode(&self.client.get_data(&path).await?)?;

        self.shared
            .cluster_start_time
            .store(log.cluster_start_time, Ordering::Relaxed);

        let mut local = ClusterNode::new(self.local_id, self.local_attributes.clone());
        local.local = true;
        local.internal_id = internal_id;
        local.order = top_ver;

        let local = Arc::new(local);
        *self.shared.local.write() = local.clone();

        let mut bag = ExchangeBag::new(self.local_id);
        bag.common_data = for_joined.common_data;
        self.exchange.on_exchange(&bag);

        for node in for_joined.topology {
            self.shared.topology.add_node(Arc::new(node));
        }

        self.shared.topology.add_node(local.clone());

        self.joined = true;

        self.notify_listener(DiscoveryEventKind::NodeJoined, top_ver, local, None);
        self.complete_join(Ok(()));

        Ok(())
    }

    async fn process_node_joined(
        &mut self,
        event_id: u64,
        top_ver: u64,
        node_id: NodeId,
        joined_internal_id: u64,
        joining_data: Option<&JoiningNodeData>,
    ) -> Result<()> {
        let joining = if self.crd {
            joining_data
                .cloned()
                .ok_or_else(|| ConclaveError::Internal {
                    message: format!("coordinator event {} carries no join data", event_id),
                })?
        } else {
            let path = self.paths.event_data_path(event_id);
            let joining: JoiningNodeData = codec::decode(&self.client.get_data(&path).await?)?;

            let mut bag = ExchangeBag::new(node_id);
            bag.joining_data = joining.discovery_data.clone();
            self.exchange.on_exchange(&bag);

            joining
        };

        let mut node = joining.node;
        node.order = top_ver;
        node.internal_id = joined_internal_id;
        node.local = false;

        let node = Arc::new(node);
        self.shared.topology.add_node(node.clone());

        info!(
            "Node joined topology [nodeId={}, topVer={}]",
            node.id, top_ver
        );

        self.notify_listener(DiscoveryEventKind::NodeJoined, top_ver, node, None);

        Ok(())
    }

    async fn process_node_failed(&mut self, top_ver: u64, failed_internal_id: u64) -> Result<()> {
        let failed = self
            .shared
            .topology
            .remove_node(failed_internal_id)
            .ok_or_else(|| ConclaveError::Internal {
                message: format!("failed node {} is not in the topology", failed_internal_id),
            })?;

        info!(
            "Node failed [nodeId={}, topVer={}]",
            failed.id, top_ver
        );

        self.notify_listener(DiscoveryEventKind::NodeFailed, top_ver, failed.clone(), None);

        if self.crd {
            let completed: Vec<u64> = self
                .ack_futs
                .values_mut()
                .filter_map(|tracker| {
                    tracker.on_node_fail(failed.internal_id);
                    tracker.completed().then_some(tracker.event_id)
                })
                .collect();

            for event_id in completed {
                let tracker = self.ack_futs.remove(&event_id).expect("tracker present");

                self.finish_ack(tracker).await?;
            }
        }

        Ok(())
    }

    async fn process_custom(
        &mut self,
        event_id: u64,
        top_ver: u64,
        sender_node_id: NodeId,
        event_path: &str,
        message: Option<&[u8]>,
    ) -> Result<()> {
        let sender = self
            .shared
            .topology
            .get(&sender_node_id)
            .ok_or_else(|| ConclaveError::Internal {
                message: format!("custom event from node {} not in the topology", sender_node_id),
            })?;

        let payload = if self.crd {
            message
                .map(|m| m.to_vec())
                .ok_or_else(|| ConclaveError::Internal {
                    message: format!("coordinator event {} carries no message", event_id),
                })?
        } else {
            self.client
                .get_data(&self.paths.custom_event_path(event_path))
                .await?
        };

        self.notify_listener(DiscoveryEventKind::Custom, top_ver, sender, Some(payload));

        if self.crd {
            self.start_ack_tracker(event_id, event_path).await?;
        } else {
            // Best-effort acknowledgement; the coordinator also completes the
            // tracker when this member leaves.
            let local_internal_id = self.shared.local.read().internal_id;
            let ack_path = self
                .paths
                .custom_event_ack_path(event_path, local_internal_id);
            let client = self.client.clone();

            tokio::spawn(async move {
                if let Err(e) = client.create(&ack_path, &[], CreateMode::Persistent).await {
                    debug!(
                        "Failed to acknowledge custom event [path={}, err={}]",
                        ack_path, e
                    );
                }
            });
        }

        Ok(())
    }

    pub(crate) fn notify_listener(
        &self,
        kind: DiscoveryEventKind,
        top_ver: u64,
        node: Arc<ClusterNode>,
        message: Option<Vec<u8>>,
    ) {
        let snapshot = if kind == DiscoveryEventKind::NodeSegmented {
            Vec::new()
        } else {
            self.shared.topology.snapshot()
        };

        self.listener.on_discovery(DiscoveryEvent {
            kind,
            top_ver,
            node,
            snapshot,
            history: BTreeMap::new(),
            message,
        });
    }

    fn on_connection_lost(&mut self) {
        warn!(
            "Store connection lost, local node is segmented [nodeId={}]",
            self.local_id
        );

        if self.joined {
            let top_ver = self.evts.as_ref().map(|e| e.top_ver).unwrap_or(0);
            let local = self.shared.local.read().clone();

            self.notify_listener(DiscoveryEventKind::NodeSegmented, top_ver, local, None);
        } else {
            self.fail_join(ConclaveError::ClientFailed {
                message: "local node segmented".to_string(),
            });
        }
    }

    fn on_fatal_error(&mut self, e: ConclaveError) {
        error!(
            "Failed to process discovery data, the node should be stopped [err={}]",
            e
        );

        self.fail_join(e);
    }

    pub(crate) fn complete_join(&mut self, result: Result<()>) {
        if let Some(tx) = self.join_tx.take() {
            let _ = tx.send(result);
        }
    }

    fn fail_join(&mut self, e: ConclaveError) {
        if let Some(tx) = self.join_tx.take() {
            let _ = tx.send(Err(e));
        }
    }
}
