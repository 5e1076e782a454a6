mod ack;
mod coordinator;
pub mod manager;
pub mod spi;
pub mod topology;
mod worker;

pub use manager::DiscoveryManager;
pub use spi::{
    DataExchange, DiscoveryEvent, DiscoveryEventKind, DiscoveryListener, ExchangeBag, NoopExchange,
};
pub use topology::TopologyIndex;

use conclave_common::{ClusterPaths, ConclaveError, NodeId, Result};
use std::time::Duration;

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// This node's ID
    pub node_id: NodeId,

    /// Opaque attributes published with the node descriptor
    pub attributes: Vec<u8>,

    /// Store path all clusters live under
    pub base_path: String,

    /// Name of the cluster to join
    pub cluster_name: String,

    /// Connection string handed to the store connector
    pub connect_string: String,

    /// Store session timeout; a disconnect lasting longer segments the node
    pub session_timeout: Duration,

    /// Instance name used in diagnostics
    pub instance_name: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(),
            attributes: Vec::new(),
            base_path: "/conclave".to_string(),
            cluster_name: "default".to_string(),
            connect_string: String::new(),
            session_timeout: Duration::from_secs(15),
            instance_name: String::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        ClusterPaths::new(&self.base_path, &self.cluster_name)?;

        if self.session_timeout.is_zero() {
            return Err(ConclaveError::Config {
                message: "session timeout must be positive".to_string(),
            });
        }

        Ok(())
    }
}
