//! Runtime stream methods backed by the daemon supervisor and app settings.
//!
//! Each of these sends a single output and finishes, except where noted.

use crate::settings::{Settings, SettingsStore};
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tether_core::{StreamMethod, StreamSink};
use tether_daemon::DaemonSupervisor;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAppMethodInput {
    pub app_id: String,
    pub server_file: String,
    pub method_name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppIdInput {
    app_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSettingsInput {
    app_id: String,
    settings: Settings,
}

/// `RunAppMethod {appId, serverFile, methodName, data}`: forwards to the
/// app's daemon, spawning it if needed. Daemon failures surface as `error`.
pub struct RunApp {
    supervisor: Arc<DaemonSupervisor>,
}

impl RunApp {
    pub fn new(supervisor: Arc<DaemonSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait::async_trait]
impl StreamMethod for RunApp {
    fn name(&self) -> &str {
        "RunAppMethod"
    }

    async fn run(&self, input: Value, sink: StreamSink) -> anyhow::Result<()> {
        let input: RunAppMethodInput = serde_json::from_value(input)
            .context("RunAppMethod expects {appId, serverFile, methodName, data}")?;
        let result = self
            .supervisor
            .run_method(
                &input.app_id,
                &input.server_file,
                &input.method_name,
                input.data,
            )
            .await?;
        sink.send(&result)?;
        Ok(())
    }
}

/// `RestartApp {appId}`: stops the app's daemon; the next call respawns it.
pub struct RestartApp {
    supervisor: Arc<DaemonSupervisor>,
}

impl RestartApp {
    pub fn new(supervisor: Arc<DaemonSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait::async_trait]
impl StreamMethod for RestartApp {
    fn name(&self) -> &str {
        "RestartApp"
    }

    async fn run(&self, input: Value, sink: StreamSink) -> anyhow::Result<()> {
        let input: AppIdInput =
            serde_json::from_value(input).context("RestartApp expects {appId}")?;
        let stopped = self.supervisor.stop(&input.app_id).await?;
        info!("Restart requested for {} (was running: {})", input.app_id, stopped);
        sink.send(&json!({ "stopped": stopped }))?;
        Ok(())
    }
}

/// `GetApps {}`: configured apps and whether their daemons are running.
pub struct ListApps {
    supervisor: Arc<DaemonSupervisor>,
}

impl ListApps {
    pub fn new(supervisor: Arc<DaemonSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait::async_trait]
impl StreamMethod for ListApps {
    fn name(&self) -> &str {
        "GetApps"
    }

    async fn run(&self, _input: Value, sink: StreamSink) -> anyhow::Result<()> {
        sink.send(&self.supervisor.status().await)?;
        Ok(())
    }
}

/// `GetAppSettings {appId}`: `{state, counter}` for the app's settings.
pub struct GetAppSettings {
    settings: Arc<SettingsStore>,
}

impl GetAppSettings {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl StreamMethod for GetAppSettings {
    fn name(&self) -> &str {
        "GetAppSettings"
    }

    async fn run(&self, input: Value, sink: StreamSink) -> anyhow::Result<()> {
        let input: AppIdInput =
            serde_json::from_value(input).context("GetAppSettings expects {appId}")?;
        sink.send(&self.settings.snapshot(&input.app_id).await?)?;
        Ok(())
    }
}

/// `UpdateAppSettings {appId, settings}`: replaces the settings document.
pub struct UpdateAppSettings {
    settings: Arc<SettingsStore>,
}

impl UpdateAppSettings {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl StreamMethod for UpdateAppSettings {
    fn name(&self) -> &str {
        "UpdateAppSettings"
    }

    async fn run(&self, input: Value, sink: StreamSink) -> anyhow::Result<()> {
        let input: UpdateSettingsInput = serde_json::from_value(input)
            .context("UpdateAppSettings expects {appId, settings}")?;
        let changed = self.settings.update(&input.app_id, input.settings).await?;
        sink.send(&json!({ "changed": changed }))?;
        Ok(())
    }
}
