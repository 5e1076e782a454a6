use crate::spi::{DataExchange, DiscoveryListener, ExchangeBag};
use crate::worker::{SharedState, Worker};
use crate::DiscoveryConfig;
use conclave_common::paths::AliveNodeName;
use conclave_common::{codec, ClusterNode, ClusterPaths, ConclaveError, JoiningNodeData, NodeId, Result};
use conclave_store::{CreateMode, StoreClient, StoreConnector};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Interval of the waiting-for-join diagnostic while the local join event has
/// not yet been observed
const JOIN_WARN_INTERVAL: Duration = Duration::from_secs(10);

/// Entry point of the discovery subsystem.
///
/// One manager represents one prospective cluster member. `join_topology`
/// registers the node in the coordination store, runs the coordinator
/// election and blocks until the local join event has been replayed; from
/// then on the configured listener receives the ordered event stream.
pub struct DiscoveryManager {
    config: DiscoveryConfig,
    paths: ClusterPaths,
    listener: Arc<dyn DiscoveryListener>,
    exchange: Arc<dyn DataExchange>,
    connector: Arc<dyn StoreConnector>,
    shared: Arc<SharedState>,
    client: RwLock<Option<Arc<StoreClient>>>,
    shutdown: Arc<Notify>,
    started: AtomicBool,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryManager {
    pub fn new(
        config: DiscoveryConfig,
        listener: Arc<dyn DiscoveryListener>,
        exchange: Arc<dyn DataExchange>,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let paths = ClusterPaths::new(&config.base_path, &config.cluster_name)?;

        let mut local = ClusterNode::new(config.node_id, config.attributes.clone());
        local.local = true;

        Ok(Self {
            paths,
            listener,
            exchange,
            connector,
            shared: Arc::new(SharedState::new(local)),
            client: RwLock::new(None),
            shutdown: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
            worker_handle: Mutex::new(None),
            config,
        })
    }

    /// Joins the cluster and blocks until the local join event is observed.
    /// Fails when the store session is lost before the join completes, when
    /// the node is stopped, or on a fatal event-processing error.
    pub async fn join_topology(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConclaveError::Internal {
                message: "discovery already started".to_string(),
            });
        }

        // Exchange payload collected before the node becomes visible.
        let mut bag = ExchangeBag::new(self.config.node_id);
        self.exchange.collect(&mut bag);

        let mut local = ClusterNode::new(self.config.node_id, self.config.attributes.clone());
        local.local = true;

        let join_bytes = codec::encode(&JoiningNodeData {
            node: local,
            discovery_data: bag.joining_data,
        })?;

        info!(
            "Connecting to the coordination store [connect={}, instance={}]",
            self.config.connect_string, self.config.instance_name
        );

        let session = self
            .connector
            .connect(&self.config.connect_string, self.config.session_timeout)
            .await
            .map_err(|e| ConclaveError::ClientFailed {
                message: format!("failed to open store session: {}", e),
            })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = Arc::new(StoreClient::new(
            session,
            self.config.session_timeout,
            events_tx,
        ));

        *self.client.write() = Some(client.clone());

        let (join_tx, mut join_rx) = oneshot::channel();

        let worker = Worker::new(
            self.config.instance_name.clone(),
            self.paths.clone(),
            client,
            self.listener.clone(),
            self.exchange.clone(),
            self.shared.clone(),
            self.shutdown.clone(),
            self.config.node_id,
            self.config.attributes.clone(),
            join_tx,
        );

        let handle = tokio::spawn(worker.run(join_bytes, events_rx));
        *self.worker_handle.lock() = Some(handle);

        loop {
            match tokio::time::timeout(JOIN_WARN_INTERVAL, &mut join_rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => return Err(ConclaveError::Stopped),
                Err(_) => warn!(
                    "Still waiting for the local join event [nodeId={}, instance={}]",
                    self.config.node_id, self.config.instance_name
                ),
            }
        }
    }

    /// The local node; carries its assigned order and internal id once joined
    pub fn local_node(&self) -> Arc<ClusterNode> {
        self.shared.local.read().clone()
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<ClusterNode>> {
        self.shared.topology.get(id)
    }

    pub fn remote_nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.shared.topology.remote_nodes(&self.config.node_id)
    }

    /// Current membership in ascending join order
    pub fn topology_snapshot(&self) -> Vec<Arc<ClusterNode>> {
        self.shared.topology.snapshot()
    }

    pub fn ping_node(&self, id: &NodeId) -> bool {
        self.shared.topology.get(id).is_some()
    }

    /// Creation timestamp of the cluster lineage, ms since the epoch
    pub fn cluster_start_time(&self) -> u64 {
        self.shared.cluster_start_time.load(Ordering::Relaxed)
    }

    /// Checks the store for an alive entry of the given node
    pub async fn known_node(&self, id: &NodeId) -> Result<bool> {
        let client = self.client()?;

        let children = client.get_children(&self.paths.alive_nodes_dir).await?;

        for name in children {
            if AliveNodeName::parse(&name)?.node_id == *id {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Publishes an opaque custom message observed by every member as a
    /// custom discovery event
    pub async fn send_custom_message(&self, payload: &[u8]) -> Result<()> {
        let client = self.client()?;

        client
            .create(
                &self.paths.custom_event_prefix(self.config.node_id),
                payload,
                CreateMode::PersistentSequential,
            )
            .await?;

        Ok(())
    }

    /// Stops the node: the store session closes, which releases the alive
    /// entry and lets the coordinator generate the fail event.
    pub async fn stop(&self) {
        info!("Stopping discovery [instance={}]", self.config.instance_name);

        self.shutdown.notify_one();

        let client = self.client.read().clone();

        if let Some(client) = client {
            client.close();
        }

        let handle = self.worker_handle.lock().take();

        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn client(&self) -> Result<Arc<StoreClient>> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| ConclaveError::Internal {
                message: "discovery is not started".to_string(),
            })
    }
}
