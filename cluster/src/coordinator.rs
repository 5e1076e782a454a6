use crate::ack::AckTracker;
use crate::spi::{DiscoveryEventKind, ExchangeBag};
use crate::worker::Worker;
use conclave_common::codec;
use conclave_common::paths::{AliveNodeName, CustomEventName};
use conclave_common::{
    ClusterNode, ConclaveError, EventLog, EventRecord, JoinDataForJoined, JoiningNodeData, Result,
};
use conclave_store::CreateMode;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Coordinator-side behavior: the single writer of the event log.
impl Worker {
    pub(crate) async fn on_become_coordinator(&mut self, loc_internal_id: u64) -> Result<()> {
        let data = self.client.get_data(&self.paths.evts_path).await?;

        if !data.is_empty() {
            let log: EventLog = codec::decode(&data)?;

            self.replay(&log).await?;
            self.evts = Some(log);
        }

        self.crd = true;

        if self.joined {
            info!(
                "Node is the new discovery coordinator [locId={}]",
                self.local_id
            );
        } else {
            info!("Node is the first cluster node [locId={}]", self.local_id);

            self.new_cluster_started(loc_internal_id).await?;
        }

        let alive = self
            .client
            .get_children_watch(&self.paths.alive_nodes_dir)
            .await?;
        self.generate_topology_events(alive).await?;

        let custom = self
            .client
            .get_children_watch(&self.paths.custom_evts_dir)
            .await?;
        self.generate_custom_events(custom).await
    }

    /// First node of a cluster lineage: wipe whatever a previous lineage left
    /// behind and start a fresh event log at topology version 1.
    async fn new_cluster_started(&mut self, loc_internal_id: u64) -> Result<()> {
        self.cleanup_previous_cluster_data().await?;

        let start_time = now_millis();

        self.shared
            .cluster_start_time
            .store(start_time, Ordering::Relaxed);

        self.evts = Some(EventLog::new(start_time));
        self.joined = true;

        let mut local = ClusterNode::new(self.local_id, self.local_attributes.clone());
        local.local = true;
        local.internal_id = loc_internal_id;
        local.order = 1;

        let local = Arc::new(local);
        *self.shared.local.write() = local.clone();
        self.shared.topology.add_node(local.clone());

        self.notify_listener(DiscoveryEventKind::NodeJoined, 1, local, None);
        self.complete_join(Ok(()));

        Ok(())
    }

    async fn cleanup_previous_cluster_data(&self) -> Result<()> {
        self.client
            .set_data(&self.paths.evts_path, &[], None)
            .await?;

        let event_children = self.client.get_children(&self.paths.evts_path).await?;

        for child in &event_children {
            let dir = format!("{}/{}", self.paths.evts_path, child);
            let grandchildren = self.client.get_children(&dir).await?;

            self.client.multi_delete(&dir, &grandchildren, None).await?;
        }

        self.client
            .multi_delete(&self.paths.evts_path, &event_children, None)
            .await?;

        for child in self.client.get_children(&self.paths.custom_evts_dir).await? {
            let dir = self.paths.custom_event_path(&child);
            let acks = self.client.get_children(&dir).await?;

            self.client.multi_delete(&dir, &acks, None).await?;
            self.client.delete_if_exists(&dir, None).await?;
        }

        Ok(())
    }

    /// Alive-children delta: an unknown alive sequence is a join, an indexed
    /// member without an alive entry has failed. Joins are processed in
    /// ascending sequence order.
    pub(crate) async fn generate_topology_events(&mut self, alive: Vec<String>) -> Result<()> {
        debug_assert!(self.crd);

        info!("Processing alive nodes change [aliveCount={}]", alive.len());

        let mut alives: BTreeMap<u64, AliveNodeName> = BTreeMap::new();

        for name in &alive {
            let parsed = AliveNodeName::parse(name)?;

            if alives.insert(parsed.internal_id, parsed).is_some() {
                return Err(ConclaveError::Internal {
                    message: format!("duplicate alive sequence {}", parsed.internal_id),
                });
            }
        }

        let mut cur_top = self.shared.topology.order_map();
        let mut appended = false;

        for parsed in alives.values() {
            if !self.shared.topology.contains_internal_id(parsed.internal_id) {
                appended |= self.generate_node_join(&mut cur_top, *parsed).await?;
            }
        }

        for node in self.shared.topology.snapshot() {
            if !alives.contains_key(&node.internal_id) {
                self.generate_node_fail(&mut cur_top, &node);

                appended = true;
            }
        }

        if appended {
            self.persist_and_replay().await?;
        }

        Ok(())
    }

    /// Returns false when the join produced no event: the joiner left before
    /// its data was read, or its data is unreadable and the join is refused.
    async fn generate_node_join(
        &mut self,
        cur_top: &mut BTreeMap<u64, Arc<ClusterNode>>,
        alive: AliveNodeName,
    ) -> Result<bool> {
        let join_data_path = self.paths.join_data_path(alive.node_id, alive.join_seq);

        let join_bytes = match self.client.get_data(&join_data_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_no_node() => {
                warn!(
                    "Failed to read joining node data, node left before join finished [nodeId={}]",
                    alive.node_id
                );

                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let joining: JoiningNodeData = match codec::decode(&join_bytes) {
            Ok(joining) => joining,
            Err(e) => {
                warn!(
                    "Refusing joining node with unreadable join data [nodeId={}, err={}]",
                    alive.node_id, e
                );

                return Ok(false);
            }
        };

        if joining.node.id != alive.node_id {
            warn!(
                "Refusing joining node, join data identity mismatch [expected={}, actual={}]",
                alive.node_id, joining.node.id
            );

            return Ok(false);
        }

        let (event_id, top_ver) = {
            let log = self.evts.as_mut().expect("coordinator owns the event log");

            log.top_ver += 1;
            log.evt_id_gen += 1;

            (log.evt_id_gen, log.top_ver)
        };

        let mut node = joining.node.clone();
        node.order = top_ver;
        node.internal_id = alive.internal_id;
        node.local = false;

        // Absorb the joiner's data, then collect what the cluster hands back.
        let mut joining_bag = ExchangeBag::new(node.id);
        joining_bag.joining_data = joining.discovery_data.clone();
        self.exchange.on_exchange(&joining_bag);

        let mut collect_bag = ExchangeBag::new(node.id);
        self.exchange.collect(&mut collect_bag);

        // Topology snapshot before the join, as the joiner must see it.
        let data_for_joined = JoinDataForJoined {
            topology: cur_top.values().map(|n| (**n).clone()).collect(),
            common_data: collect_bag.common_data,
        };

        cur_top.insert(node.order, Arc::new(node.clone()));

        let record = EventRecord::NodeJoined {
            event_id,
            top_ver,
            node_id: node.id,
            joined_internal_id: node.internal_id,
            joining_data: Some(JoiningNodeData {
                node,
                discovery_data: joining.discovery_data,
            }),
        };

        let node_id = alive.node_id;

        self.evts
            .as_mut()
            .expect("coordinator owns the event log")
            .add_event(record);

        self.client
            .create(
                &self.paths.event_data_path(event_id),
                &join_bytes,
                CreateMode::Persistent,
            )
            .await?;
        self.client
            .create(
                &self.paths.event_joined_data_path(event_id),
                &codec::encode(&data_for_joined)?,
                CreateMode::Persistent,
            )
            .await?;

        info!(
            "Generated node-joined event [topVer={}, nodeId={}]",
            top_ver, node_id
        );

        Ok(true)
    }

    fn generate_node_fail(
        &mut self,
        cur_top: &mut BTreeMap<u64, Arc<ClusterNode>>,
        failed: &ClusterNode,
    ) {
        let removed = cur_top.remove(&failed.order);
        debug_assert!(removed.is_some());

        let log = self.evts.as_mut().expect("coordinator owns the event log");

        log.top_ver += 1;
        log.evt_id_gen += 1;

        let top_ver = log.top_ver;

        log.add_event(EventRecord::NodeFailed {
            event_id: log.evt_id_gen,
            top_ver,
            failed_internal_id: failed.internal_id,
        });

        info!(
            "Generated node-failed event [topVer={}, nodeId={}]",
            top_ver, failed.id
        );
    }

    /// Absorbs custom-event children past the processed high-water mark, in
    /// ascending sequence order. Custom events bump the event id only, never
    /// the topology version.
    pub(crate) async fn generate_custom_events(&mut self, children: Vec<String>) -> Result<()> {
        debug_assert!(self.crd);

        let proc_cust_evt = self
            .evts
            .as_ref()
            .expect("coordinator owns the event log")
            .proc_cust_evt;

        let mut new_events: BTreeMap<u64, (CustomEventName, String)> = BTreeMap::new();

        for name in children {
            let parsed = CustomEventName::parse(&name)?;

            if parsed.sequence as i64 > proc_cust_evt {
                new_events.insert(parsed.sequence, (parsed, name));
            }
        }

        if new_events.is_empty() {
            return Ok(());
        }

        for (seq, (parsed, name)) in new_events {
            let event_path = self.paths.custom_event_path(&name);

            if self.shared.topology.get(&parsed.sender_id).is_some() {
                let payload = self.client.get_data(&event_path).await?;

                let log = self.evts.as_mut().expect("coordinator owns the event log");

                log.evt_id_gen += 1;

                let top_ver = log.top_ver;

                log.add_event(EventRecord::Custom {
                    event_id: log.evt_id_gen,
                    top_ver,
                    sender_node_id: parsed.sender_id,
                    event_path: name,
                    message: Some(payload),
                });

                info!(
                    "Generated custom event [topVer={}, sender={}]",
                    top_ver, parsed.sender_id
                );
            } else {
                warn!(
                    "Ignoring custom event from unknown node [nodeId={}]",
                    parsed.sender_id
                );

                self.client.delete_if_exists(&event_path, None).await?;
            }

            self.evts
                .as_mut()
                .expect("coordinator owns the event log")
                .proc_cust_evt = seq as i64;
        }

        self.persist_and_replay().await
    }

    /// Publishes the updated log, then replays it locally so the coordinator
    /// observes its own events exactly like every other member.
    async fn persist_and_replay(&mut self) -> Result<()> {
        let log = self.evts.clone().expect("coordinator owns the event log");

        let bytes = codec::encode(&log)?;

        self.client
            .set_data(&self.paths.evts_path, &bytes, None)
            .await?;

        info!(
            "Discovery coordinator saved topology events [topVer={}, evtIdGen={}]",
            log.top_ver, log.evt_id_gen
        );

        self.replay(&log).await
    }

    /// Starts awaiting member acknowledgements of a custom event. Completes
    /// immediately in a single-member topology.
    pub(crate) async fn start_ack_tracker(&mut self, event_id: u64, event_path: &str) -> Result<()> {
        let local_internal_id = self.shared.local.read().internal_id;

        let members = self
            .shared
            .topology
            .internal_ids()
            .into_iter()
            .filter(|id| *id != local_internal_id);

        let mut tracker = AckTracker::new(
            event_id,
            self.paths.custom_event_path(event_path),
            members,
        );

        if !tracker.completed() {
            let children = self.client.get_children_watch(&tracker.path).await?;

            tracker.observe_acks(parse_acks(&children));
        }

        if tracker.completed() {
            self.finish_ack(tracker).await
        } else {
            debug!(
                "Awaiting custom event acknowledgements [eventId={}, remaining={}]",
                event_id,
                tracker.remaining()
            );

            self.ack_futs.insert(event_id, tracker);

            Ok(())
        }
    }

    pub(crate) async fn on_ack_children_changed(&mut self, path: &str) -> Result<()> {
        let Some(event_id) = self
            .ack_futs
            .values()
            .find(|tracker| tracker.path == path)
            .map(|tracker| tracker.event_id)
        else {
            return Ok(());
        };

        let children = self.client.get_children_watch(path).await?;

        let tracker = self.ack_futs.get_mut(&event_id).expect("tracker present");

        tracker.observe_acks(parse_acks(&children));

        if tracker.completed() {
            let tracker = self.ack_futs.remove(&event_id).expect("tracker present");

            self.finish_ack(tracker).await?;
        }

        Ok(())
    }

    /// Every member has replayed the message, so the event node and its acks
    /// can go.
    pub(crate) async fn finish_ack(&mut self, tracker: AckTracker) -> Result<()> {
        info!(
            "Custom event acknowledged by all members [eventId={}]",
            tracker.event_id
        );

        let acks = match self.client.get_children(&tracker.path).await {
            Ok(children) => children,
            Err(e) if e.is_no_node() => return Ok(()),
            Err(e) => return Err(e),
        };

        self.client.multi_delete(&tracker.path, &acks, None).await?;
        self.client.delete_if_exists(&tracker.path, None).await
    }
}

fn parse_acks(children: &[String]) -> Vec<u64> {
    children
        .iter()
        .filter_map(|name| match name.parse() {
            Ok(internal_id) => Some(internal_id),
            Err(_) => {
                debug!("Ignoring malformed acknowledgement child: {}", name);

                None
            }
        })
        .collect()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
