use crate::error::{ConclaveError, Result};
use crate::node::NodeId;

/// Fixed set of store paths used by a cluster, derived from the configured
/// base path and cluster name. Pure name derivation, no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPaths {
    pub base_path: String,
    pub cluster_dir: String,
    pub evts_path: String,
    pub join_data_dir: String,
    pub custom_evts_dir: String,
    pub alive_nodes_dir: String,
}

impl ClusterPaths {
    pub fn new(base_path: &str, cluster_name: &str) -> Result<Self> {
        validate_path(base_path)?;

        if cluster_name.is_empty() {
            return Err(ConclaveError::Config {
                message: "Cluster name is empty".to_string(),
            });
        }

        if cluster_name.contains('/') {
            return Err(ConclaveError::Config {
                message: format!("Cluster name must not contain '/': {}", cluster_name),
            });
        }

        let cluster_dir = format!("{}/{}", base_path, cluster_name);

        Ok(Self {
            base_path: base_path.to_string(),
            evts_path: format!("{}/events", cluster_dir),
            join_data_dir: format!("{}/joinData", cluster_dir),
            custom_evts_dir: format!("{}/customEvents", cluster_dir),
            alive_nodes_dir: format!("{}/alive", cluster_dir),
            cluster_dir,
        })
    }

    /// Name prefix submitted when creating the join-data entry; the store
    /// appends the 10-digit sequence.
    pub fn join_data_prefix(&self, node_id: NodeId) -> String {
        format!("{}/{}|", self.join_data_dir, node_id)
    }

    /// Join-data path as re-derived by the coordinator from a parsed alive name
    pub fn join_data_path(&self, node_id: NodeId, join_seq: u64) -> String {
        format!("{}/{}|{:010}", self.join_data_dir, node_id, join_seq)
    }

    /// Name prefix submitted when creating the alive entry
    pub fn alive_node_prefix(&self, node_id: NodeId, join_seq: u64) -> String {
        format!("{}/{}|{}|", self.alive_nodes_dir, node_id, join_seq)
    }

    pub fn alive_node_path(&self, alive_name: &str) -> String {
        format!("{}/{}", self.alive_nodes_dir, alive_name)
    }

    /// Name prefix submitted when publishing a custom event
    pub fn custom_event_prefix(&self, node_id: NodeId) -> String {
        format!("{}/{}|", self.custom_evts_dir, node_id)
    }

    pub fn custom_event_path(&self, event_name: &str) -> String {
        format!("{}/{}", self.custom_evts_dir, event_name)
    }

    pub fn custom_event_ack_path(&self, event_name: &str, internal_id: u64) -> String {
        format!("{}/{}/{}", self.custom_evts_dir, event_name, internal_id)
    }

    pub fn event_data_path(&self, event_id: u64) -> String {
        format!("{}/{}", self.evts_path, event_id)
    }

    pub fn event_joined_data_path(&self, event_id: u64) -> String {
        format!("{}/joined", self.event_data_path(event_id))
    }
}

/// Decoded alive entry name: `{uuid}|{join_seq}|{store_seq:010}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliveNodeName {
    pub node_id: NodeId,
    pub join_seq: u64,
    pub internal_id: u64,
}

impl AliveNodeName {
    pub fn parse(name: &str) -> Result<Self> {
        let mut parts = name.split('|');

        let (Some(id), Some(join_seq), Some(seq), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad_name(name));
        };

        Ok(Self {
            node_id: NodeId::from_string(id).map_err(|_| bad_name(name))?,
            join_seq: join_seq.parse().map_err(|_| bad_name(name))?,
            internal_id: seq.parse().map_err(|_| bad_name(name))?,
        })
    }
}

/// Decoded custom event name: `{uuid}|{store_seq:010}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomEventName {
    pub sender_id: NodeId,
    pub sequence: u64,
}

impl CustomEventName {
    pub fn parse(name: &str) -> Result<Self> {
        let mut parts = name.split('|');

        let (Some(id), Some(seq), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(bad_name(name));
        };

        Ok(Self {
            sender_id: NodeId::from_string(id).map_err(|_| bad_name(name))?,
            sequence: seq.parse().map_err(|_| bad_name(name))?,
        })
    }
}

/// Recovers the store-assigned sequence from the final path returned by a
/// sequential create (the digits after the last `|`).
pub fn sequence_of(created_path: &str) -> Result<u64> {
    let idx = created_path
        .rfind('|')
        .ok_or_else(|| bad_name(created_path))?;

    created_path[idx + 1..]
        .parse()
        .map_err(|_| bad_name(created_path))
}

/// Validates a store path: leading slash, no empty / relative segments and no
/// trailing slash.
pub fn validate_path(path: &str) -> Result<()> {
    let invalid = |message: &str| ConclaveError::InvalidPath {
        path: path.to_string(),
        message: message.to_string(),
    };

    if path.is_empty() {
        return Err(invalid("path is empty"));
    }

    if !path.starts_with('/') {
        return Err(invalid("path must start with '/'"));
    }

    if path == "/" {
        return Ok(());
    }

    if path.ends_with('/') {
        return Err(invalid("path must not end with '/'"));
    }

    for segment in path[1..].split('/') {
        if segment.is_empty() {
            return Err(invalid("path contains an empty segment"));
        }

        if segment == "." || segment == ".." {
            return Err(invalid("path contains a relative segment"));
        }

        if segment.chars().any(|c| c.is_control()) {
            return Err(invalid("path contains control characters"));
        }
    }

    Ok(())
}

fn bad_name(name: &str) -> ConclaveError {
    ConclaveError::BadName {
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let paths = ClusterPaths::new("/conclave", "test").unwrap();

        assert_eq!(paths.cluster_dir, "/conclave/test");
        assert_eq!(paths.evts_path, "/conclave/test/events");
        assert_eq!(paths.join_data_dir, "/conclave/test/joinData");
        assert_eq!(paths.custom_evts_dir, "/conclave/test/customEvents");
        assert_eq!(paths.alive_nodes_dir, "/conclave/test/alive");
    }

    #[test]
    fn test_invalid_base_path_rejected() {
        assert!(ClusterPaths::new("", "test").is_err());
        assert!(ClusterPaths::new("relative", "test").is_err());
        assert!(ClusterPaths::new("/trailing/", "test").is_err());
        assert!(ClusterPaths::new("/a//b", "test").is_err());
        assert!(ClusterPaths::new("/a/../b", "test").is_err());
    }

    #[test]
    fn test_invalid_cluster_name_rejected() {
        assert!(ClusterPaths::new("/conclave", "").is_err());
        assert!(ClusterPaths::new("/conclave", "a/b").is_err());
    }

    #[test]
    fn test_alive_name_round_trip() {
        let id = NodeId::new();
        let name = format!("{}|{}|{:010}", id, 7, 42);

        let parsed = AliveNodeName::parse(&name).unwrap();

        assert_eq!(parsed.node_id, id);
        assert_eq!(parsed.join_seq, 7);
        assert_eq!(parsed.internal_id, 42);
    }

    #[test]
    fn test_alive_name_malformed() {
        assert!(AliveNodeName::parse("not-a-name").is_err());
        assert!(AliveNodeName::parse("xyz|1|2").is_err());

        let id = NodeId::new();
        assert!(AliveNodeName::parse(&format!("{}|1", id)).is_err());
        assert!(AliveNodeName::parse(&format!("{}|1|2|3", id)).is_err());
    }

    #[test]
    fn test_custom_event_name_round_trip() {
        let id = NodeId::new();
        let name = format!("{}|{:010}", id, 3);

        let parsed = CustomEventName::parse(&name).unwrap();

        assert_eq!(parsed.sender_id, id);
        assert_eq!(parsed.sequence, 3);
    }

    #[test]
    fn test_sequence_of_created_path() {
        let id = NodeId::new();
        let path = format!("/conclave/test/joinData/{}|{:010}", id, 15);

        assert_eq!(sequence_of(&path).unwrap(), 15);
        assert!(sequence_of("/no/separator").is_err());
    }

    #[test]
    fn test_join_data_path_matches_created_name() {
        let paths = ClusterPaths::new("/conclave", "test").unwrap();
        let id = NodeId::new();

        // The store appends the zero-padded sequence to the submitted prefix.
        let created = format!("{}{:010}", paths.join_data_prefix(id), 3);

        assert_eq!(created, paths.join_data_path(id, 3));
    }
}
