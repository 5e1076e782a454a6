pub mod client;
pub mod memory;
pub mod session;

pub use client::{ClientEvent, ConnectionState, StoreClient};
pub use memory::{MemorySession, MemoryStore};
pub use session::{
    CreateMode, SessionError, SessionEvent, SessionResult, SessionState, StoreConnector,
    StoreSession, WatchEvent, WatchKind,
};
