use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

/// Wire-level result codes of the coordination store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("connection to the store was lost")]
    ConnectionLoss,

    #[error("store session expired")]
    SessionExpired,

    #[error("node does not exist")]
    NoNode,

    #[error("node already exists")]
    NodeExists,

    #[error("version mismatch")]
    BadVersion,

    #[error("node has children")]
    NotEmpty,

    #[error("session is closed")]
    Closed,

    #[error("store error: {0}")]
    Other(String),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Creation mode of a store node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// Session-level connectivity transitions reported by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SyncConnected,
    Disconnected,
    Expired,
}

/// What a triggered watch observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    DataChanged,
    ChildrenChanged,
    Created,
    Deleted,
}

/// A one-shot watch delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchKind,
}

/// Events delivered serially on a session's event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    State(SessionState),
    Watch(WatchEvent),
}

/// Raw session with a ZooKeeper-style coordination store.
///
/// Reads optionally arm a one-shot watch; triggered watches and connectivity
/// transitions are delivered serially on the stream handed out by
/// `take_events`. Sequential creates append a 10-digit zero-padded per-parent
/// counter to the submitted name and return the final path.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Hands out the session's event stream. Must be called exactly once.
    fn take_events(&self) -> UnboundedReceiver<SessionEvent>;

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> SessionResult<String>;

    async fn exists(&self, path: &str, watch: bool) -> SessionResult<bool>;

    async fn get_data(&self, path: &str, watch: bool) -> SessionResult<Vec<u8>>;

    async fn get_children(&self, path: &str, watch: bool) -> SessionResult<Vec<String>>;

    async fn set_data(&self, path: &str, data: &[u8], version: Option<u32>) -> SessionResult<()>;

    async fn delete(&self, path: &str, version: Option<u32>) -> SessionResult<()>;

    /// All-or-nothing removal of the named children of `parent`
    async fn multi_delete(
        &self,
        parent: &str,
        names: &[String],
        version: Option<u32>,
    ) -> SessionResult<()>;

    fn is_alive(&self) -> bool;

    /// Closes the session, releasing its ephemeral nodes. Idempotent.
    fn close(&self);
}

/// Opens sessions against a concrete store backend
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(
        &self,
        connect_string: &str,
        session_timeout: Duration,
    ) -> SessionResult<Arc<dyn StoreSession>>;
}
