//! HTTP client for a running daemon.

use crate::context::DaemonConfig;
use crate::protocol::{HealthResponse, RunMethodRequest, RunMethodResponse};
use crate::{DaemonError, Result};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Client for one daemon's HTTP surface.
///
/// Method calls have no overall timeout: a daemon method may legitimately
/// run for a long time. Only connecting and health checks are bounded.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    base_url: String,
    client: reqwest::Client,
}

impl DaemonClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(DaemonConfig::CONNECT_TIMEOUT)
            .user_agent("tether-daemon")
            .build()
            .map_err(|e| DaemonError::Http {
                message: format!("failed to build HTTP client: {}", e),
                source: Some(e),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Client for a daemon listening on the loopback interface.
    pub fn for_port(port: u16) -> Result<Self> {
        Self::new(&format!("http://127.0.0.1:{}", port))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether the daemon answers `GET /api/health` with `{ok:true}`.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}{}", self.base_url, DaemonConfig::HEALTH_PATH);
        let response = match self
            .client
            .get(&url)
            .timeout(DaemonConfig::HEALTH_REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            _ => return false,
        };
        matches!(
            response.json::<HealthResponse>().await,
            Ok(HealthResponse { ok: true })
        )
    }

    /// Poll the health endpoint until it succeeds or `timeout` elapses.
    pub async fn wait_healthy(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.health_check().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DaemonError::Unhealthy {
                    url: self.base_url.clone(),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Call `server_file.method_name` with `data`.
    pub async fn run_method(
        &self,
        server_file: &str,
        method_name: &str,
        data: Value,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, DaemonConfig::RUN_METHOD_PATH);
        debug!("Calling {}.{} at {}", server_file, method_name, url);

        let response = self
            .client
            .post(&url)
            .json(&RunMethodRequest {
                server_file: server_file.to_string(),
                method_name: method_name.to_string(),
                data,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        match serde_json::from_str::<RunMethodResponse>(&body) {
            Ok(RunMethodResponse::Success { result }) => Ok(result),
            Ok(RunMethodResponse::Error { error }) => Err(DaemonError::Remote { message: error }),
            Err(_) => Err(DaemonError::Http {
                message: format!("daemon returned {}: {}", status, body),
                source: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = DaemonClient::new("http://127.0.0.1:4100/").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:4100");
        assert_eq!(
            DaemonClient::for_port(9).unwrap().base_url(),
            "http://127.0.0.1:9"
        );
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_unavailable() {
        // Port 1 is never a daemon.
        let client = DaemonClient::for_port(1).unwrap();
        assert!(!client.health_check().await);
        let err = client
            .run_method("math", "add", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Unavailable { .. }));
    }
}
