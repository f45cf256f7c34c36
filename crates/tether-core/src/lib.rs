//! Tether Core - multiplexed streaming RPC and topic reconciliation.
//!
//! Many logical calls share one long-lived websocket per client. On top of
//! that transport this crate provides:
//!
//! - [`ipc`]: the connection manager, per-call stream handles and the
//!   runtime-side stream server
//! - [`pubsub`]: the topic registry and the reconciliation engine that merges
//!   a snapshot fetch with a live subscription
//! - [`cell`]: a single-writer document that persists and publishes every
//!   effective change
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::ipc::ConnectionManager;
//! use tether_core::pubsub::{FnReducer, MethodSnapshotSource, TopicQuery};
//! use tether_core::TopicId;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let conn = ConnectionManager::new("ws://127.0.0.1:9010/api/websocket")?;
//!     let topic = TopicId::new("app/counter", "state");
//!     let source = MethodSnapshotSource::new(&conn, "GetCounter", serde_json::json!({}));
//!     let reducer = FnReducer::new(|_old: &serde_json::Value, new: serde_json::Value| new);
//!
//!     let query = TopicQuery::subscribe(&conn, topic, source, reducer)?;
//!     let synced = query.wait_synced().await?;
//!     println!("counter {} state {}", synced.counter, synced.state);
//!     Ok(())
//! }
//! ```

pub mod cell;
pub mod config;
pub mod error;
pub mod ids;
pub mod ipc;
pub mod persist;
pub mod pubsub;

// Re-export commonly used types
pub use cell::{CellPublisher, CellStore, JsonFileStore, MemoryStore, StateCell};
pub use config::{ReconnectPolicy, ServerConfig, TopicConfig, TransportConfig};
pub use error::{Result, TetherError};
pub use ids::{CorrelationId, TopicId};
pub use ipc::{
    ConnectionManager, ConnectionState, StreamCallbacks, StreamHandle, StreamHandler,
    StreamMethod, StreamServer, StreamServerHandle, StreamSink,
};
pub use pubsub::{Snapshot, TopicQuery, TopicRegistry};
