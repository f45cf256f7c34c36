//! Tether Daemon - per-application worker processes.
//!
//! A daemon is a small HTTP server that exposes one application's callable
//! methods to the runtime and exits on its own once idle. This crate has
//! both halves of that contract:
//!
//! - inside the daemon: [`DaemonContext`], [`MethodRegistry`],
//!   [`StartupHandlers`] and [`Daemon`]
//! - inside the runtime: [`DaemonSupervisor`], which spawns daemons lazily
//!   and forwards calls through [`DaemonClient`]
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_daemon::{Daemon, DaemonContext, MethodRegistry};
//!
//! async fn greet(name: String) -> anyhow::Result<String> {
//!     Ok(format!("hello {}", name))
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = DaemonContext::from_env()?;
//!     let registry = MethodRegistry::new().with_method("greeter", "greet", greet)?;
//!     Daemon::new(ctx, registry).run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod context;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod startup;
pub mod supervisor;

pub use client::DaemonClient;
pub use context::{DaemonConfig, DaemonContext};
pub use error::{DaemonError, Result};
pub use protocol::{HealthResponse, RunMethodRequest, RunMethodResponse};
pub use registry::MethodRegistry;
pub use server::{Daemon, DaemonHandle};
pub use startup::StartupHandlers;
pub use supervisor::{load_manifest, AppSpec, DaemonStatus, DaemonSupervisor};
