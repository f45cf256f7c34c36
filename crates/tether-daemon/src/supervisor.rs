//! Lazily spawned daemon processes, one per application.
//!
//! The first call for an app spawns its program with the daemon environment
//! contract, reads the `TETHER_DAEMON_PORT=` line from its stdout, waits for
//! `/api/health` and then forwards the call. A daemon that has exited (idle
//! shutdown or crash) is respawned by the next call. Spawns for one app are
//! serialized; different apps never wait on each other.

use crate::client::DaemonClient;
use crate::context::DaemonConfig;
use crate::{DaemonError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How to launch one application's daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl AppSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            target: String::new(),
            args: Vec::new(),
            idle_timeout_secs: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }
}

/// Load an apps manifest: a JSON object mapping app id to [`AppSpec`].
pub fn load_manifest(path: &Path) -> Result<BTreeMap<String, AppSpec>> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| DaemonError::io_with_path(e, path))?;
    serde_json::from_str(&contents).map_err(|e| DaemonError::Config {
        message: format!("invalid apps manifest {}: {}", path.display(), e),
    })
}

/// Running status of one app's daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub app_id: String,
    pub running: bool,
    pub port: Option<u16>,
}

struct RunningDaemon {
    child: Child,
    port: u16,
    client: DaemonClient,
    stdout_drain: JoinHandle<()>,
}

impl RunningDaemon {
    fn is_alive(&mut self, app_id: &str) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!("Daemon for {} exited ({})", app_id, status);
                false
            }
            Err(e) => {
                warn!("Failed to poll daemon for {}: {}", app_id, e);
                false
            }
        }
    }

    async fn stop(mut self, app_id: &str) {
        self.stdout_drain.abort();
        if !self.is_alive(app_id) {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = self.child.id() {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                if tokio::time::timeout(DaemonConfig::STOP_GRACE_PERIOD, self.child.wait())
                    .await
                    .is_ok()
                {
                    info!("Daemon for {} stopped", app_id);
                    return;
                }
                warn!("Daemon for {} ignored SIGTERM, killing", app_id);
            }
        }

        let _ = self.child.kill().await;
        info!("Daemon for {} killed", app_id);
    }
}

struct AppSlot {
    spec: AppSpec,
    running: Mutex<Option<RunningDaemon>>,
}

/// Owns the daemons of every configured application.
#[derive(Default)]
pub struct DaemonSupervisor {
    apps: RwLock<HashMap<String, Arc<AppSlot>>>,
}

impl DaemonSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: impl IntoIterator<Item = (String, AppSpec)>) -> Self {
        let supervisor = Self::new();
        for (app_id, spec) in specs {
            supervisor.add_app(app_id, spec);
        }
        supervisor
    }

    /// Configure `app_id`. Replacing a spec only affects future spawns.
    pub fn add_app(&self, app_id: impl Into<String>, spec: AppSpec) {
        let slot = Arc::new(AppSlot {
            spec,
            running: Mutex::new(None),
        });
        self.apps
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(app_id.into(), slot);
    }

    pub fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .apps
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn slot(&self, app_id: &str) -> Result<Arc<AppSlot>> {
        self.apps
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(app_id)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownApp {
                app_id: app_id.to_string(),
            })
    }

    /// Run `server_file.method_name` in `app_id`'s daemon, spawning it first
    /// if it is not running.
    pub async fn run_method(
        &self,
        app_id: &str,
        server_file: &str,
        method_name: &str,
        data: Value,
    ) -> Result<Value> {
        let slot = self.slot(app_id)?;
        let client = ensure_running(app_id, &slot).await?;
        match client.run_method(server_file, method_name, data.clone()).await {
            // The daemon may have gone idle between the liveness check and
            // the request; try once more with a fresh process.
            Err(DaemonError::Unavailable { message }) => {
                debug!("Daemon for {} unavailable ({}), respawning", app_id, message);
                let client = ensure_running(app_id, &slot).await?;
                client.run_method(server_file, method_name, data).await
            }
            result => result,
        }
    }

    /// Port of `app_id`'s daemon if it is running.
    pub async fn running_port(&self, app_id: &str) -> Result<Option<u16>> {
        let slot = self.slot(app_id)?;
        let mut running = slot.running.lock().await;
        Ok(match running.as_mut() {
            Some(daemon) => daemon.is_alive(app_id).then_some(daemon.port),
            None => None,
        })
    }

    pub async fn status(&self) -> Vec<DaemonStatus> {
        let mut statuses = Vec::new();
        for app_id in self.app_ids() {
            let port = self.running_port(&app_id).await.ok().flatten();
            statuses.push(DaemonStatus {
                running: port.is_some(),
                port,
                app_id,
            });
        }
        statuses
    }

    /// Stop `app_id`'s daemon. Returns whether one was running.
    pub async fn stop(&self, app_id: &str) -> Result<bool> {
        let slot = self.slot(app_id)?;
        let daemon = slot.running.lock().await.take();
        match daemon {
            Some(daemon) => {
                daemon.stop(app_id).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop every daemon.
    pub async fn shutdown(&self) {
        for app_id in self.app_ids() {
            let _ = self.stop(&app_id).await;
        }
    }
}

/// Client for `app_id`'s live daemon, spawning one if needed.
async fn ensure_running(app_id: &str, slot: &AppSlot) -> Result<DaemonClient> {
    let mut running = slot.running.lock().await;
    if let Some(daemon) = running.as_mut() {
        if daemon.is_alive(app_id) {
            return Ok(daemon.client.clone());
        }
    }
    if let Some(stale) = running.take() {
        stale.stdout_drain.abort();
    }

    let daemon = spawn_daemon(app_id, &slot.spec).await?;
    let client = daemon.client.clone();
    *running = Some(daemon);
    Ok(client)
}

async fn spawn_daemon(app_id: &str, spec: &AppSpec) -> Result<RunningDaemon> {
    info!("Spawning daemon for {}: {}", app_id, spec.program.display());

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .env(DaemonConfig::PROCESS_TYPE_ENV, DaemonConfig::PROCESS_TYPE_DAEMON)
        .env(DaemonConfig::APP_ID_ENV, app_id)
        .env(DaemonConfig::TARGET_ENV, &spec.target)
        .env(DaemonConfig::PORT_ENV, "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(secs) = spec.idle_timeout_secs {
        command.env(DaemonConfig::IDLE_SECS_ENV, secs.to_string());
    }

    let mut child = command.spawn().map_err(|e| DaemonError::Spawn {
        app_id: app_id.to_string(),
        message: e.to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| DaemonError::Spawn {
        app_id: app_id.to_string(),
        message: "stdout was not captured".to_string(),
    })?;
    let mut lines = BufReader::new(stdout).lines();

    let port = match tokio::time::timeout(
        DaemonConfig::PORT_DISCOVERY_TIMEOUT,
        read_port_line(app_id, &mut lines),
    )
    .await
    {
        Ok(Ok(port)) => port,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(e);
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(DaemonError::PortDiscovery {
                app_id: app_id.to_string(),
                message: format!(
                    "no port line within {:?}",
                    DaemonConfig::PORT_DISCOVERY_TIMEOUT
                ),
            });
        }
    };

    let client = DaemonClient::for_port(port)?;
    if let Err(e) = client.wait_healthy(DaemonConfig::HEALTH_WAIT_TIMEOUT).await {
        let _ = child.kill().await;
        return Err(e);
    }

    let drain_app = app_id.to_string();
    let stdout_drain = tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{}] {}", drain_app, line);
        }
    });

    info!("Daemon for {} ready on port {}", app_id, port);
    Ok(RunningDaemon {
        child,
        port,
        client,
        stdout_drain,
    })
}

async fn read_port_line(app_id: &str, lines: &mut Lines<BufReader<ChildStdout>>) -> Result<u16> {
    loop {
        let line = lines.next_line().await?.ok_or_else(|| DaemonError::PortDiscovery {
            app_id: app_id.to_string(),
            message: "daemon exited before reporting its port".to_string(),
        })?;
        match line.strip_prefix(DaemonConfig::PORT_LINE_PREFIX) {
            Some(value) => {
                return value.trim().parse().map_err(|_| DaemonError::PortDiscovery {
                    app_id: app_id.to_string(),
                    message: format!("invalid port line '{}'", line),
                })
            }
            None => debug!("[{}] {}", app_id, line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_parsing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("apps.json");
        std::fs::write(
            &path,
            json!({
                "notes": {
                    "program": "/opt/apps/notes-daemon",
                    "target": "server/main",
                    "idleTimeoutSecs": 60
                },
                "clock": {"program": "clockd", "args": ["--quiet"]}
            })
            .to_string(),
        )
        .unwrap();

        let manifest = load_manifest(&path).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(
            manifest["notes"],
            AppSpec::new("/opt/apps/notes-daemon")
                .with_target("server/main")
                .with_idle_timeout(Duration::from_secs(60))
        );
        assert_eq!(manifest["clock"].args, vec!["--quiet"]);
        assert_eq!(manifest["clock"].idle_timeout_secs, None);
    }

    #[test]
    fn test_bad_manifest_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("apps.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(
            load_manifest(&path),
            Err(DaemonError::Config { .. })
        ));
        assert!(matches!(
            load_manifest(&dir.path().join("missing.json")),
            Err(DaemonError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_app() {
        let supervisor = DaemonSupervisor::new();
        let err = supervisor
            .run_method("ghost", "a", "b", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::UnknownApp { .. }));
        assert!(supervisor.stop("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let supervisor = DaemonSupervisor::from_specs([(
            "broken".to_string(),
            AppSpec::new("/definitely/not/a/daemon"),
        )]);
        let err = supervisor
            .run_method("broken", "a", "b", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Spawn { .. }));
        assert_eq!(supervisor.running_port("broken").await.unwrap(), None);
    }

    /// Install a hand-spawned process as `app_id`'s daemon.
    #[cfg(unix)]
    async fn adopt(supervisor: &DaemonSupervisor, app_id: &str, child: Child, port: u16) {
        let slot = supervisor.slot(app_id).unwrap();
        *slot.running.lock().await = Some(RunningDaemon {
            child,
            port,
            client: DaemonClient::for_port(port).unwrap(),
            stdout_drain: tokio::spawn(async {}),
        });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_running_port_tracks_process_liveness() {
        let supervisor = DaemonSupervisor::from_specs([
            ("live".to_string(), AppSpec::new("sleep")),
            ("gone".to_string(), AppSpec::new("true")),
        ]);

        let live = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        adopt(&supervisor, "live", live, 4100).await;

        let mut gone = Command::new("true").spawn().unwrap();
        gone.wait().await.unwrap();
        adopt(&supervisor, "gone", gone, 4101).await;

        assert_eq!(supervisor.running_port("live").await.unwrap(), Some(4100));
        assert_eq!(supervisor.running_port("gone").await.unwrap(), None);
        assert_eq!(
            supervisor.status().await,
            vec![
                DaemonStatus {
                    app_id: "gone".to_string(),
                    running: false,
                    port: None,
                },
                DaemonStatus {
                    app_id: "live".to_string(),
                    running: true,
                    port: Some(4100),
                },
            ]
        );

        assert!(supervisor.stop("live").await.unwrap());
        assert_eq!(supervisor.running_port("live").await.unwrap(), None);
    }
}
