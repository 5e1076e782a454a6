use thiserror::Error;

/// Result type for conclave operations
pub type Result<T> = std::result::Result<T, ConclaveError>;

/// Errors surfaced by the discovery library
#[derive(Debug, Clone, Error)]
pub enum ConclaveError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid store path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("Malformed store node name '{name}'")]
    BadName { name: String },

    #[error("Node does not exist: {path}")]
    NoNode { path: String },

    #[error("Store client failed: {message}")]
    ClientFailed { message: String },

    #[error("Serialization error: {message}")]
    Codec { message: String },

    #[error("Failed to join cluster: {message}")]
    JoinFailed { message: String },

    #[error("Node stopped")]
    Stopped,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ConclaveError {
    /// True for the terminal client failure that ends the session
    pub fn is_client_failed(&self) -> bool {
        matches!(self, ConclaveError::ClientFailed { .. })
    }

    /// True when the error reports an absent store node
    pub fn is_no_node(&self) -> bool {
        matches!(self, ConclaveError::NoNode { .. })
    }
}
