pub mod codec;
pub mod error;
pub mod events;
pub mod node;
pub mod paths;

pub use error::{ConclaveError, Result};
pub use events::{EventLog, EventRecord, JoinDataForJoined, JoiningNodeData};
pub use node::{ClusterNode, NodeId};
pub use paths::{AliveNodeName, ClusterPaths, CustomEventName};
