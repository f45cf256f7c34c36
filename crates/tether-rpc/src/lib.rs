//! Tether RPC - the runtime process.
//!
//! Serves the multiplexed stream endpoint for clients, owns the topic
//! registry, keeps per-app settings documents and proxies `RunAppMethod`
//! calls to per-app daemons started on demand.

pub mod handler;
pub mod methods;
pub mod server;
pub mod settings;

pub use server::{start_server, stream_server, AppState};
pub use settings::{Settings, SettingsStore, SETTINGS_CATEGORY};
