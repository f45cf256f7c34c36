//! The daemon's HTTP surface and idle shutdown.
//!
//! Routes:
//! - `GET /api/health` → `{ok:true}`
//! - `POST /api/RunAppMethod` → `200 {type:"success", result}` or
//!   `500 {type:"error", error}`
//!
//! Every request refreshes the last-activity instant. A watchdog shuts the
//! server down gracefully once no request has been seen, and none is in
//! flight, for the context's idle timeout.

use crate::context::DaemonConfig;
use crate::protocol::{HealthResponse, RunMethodRequest, RunMethodResponse};
use crate::{DaemonContext, DaemonError, MethodRegistry, Result, StartupHandlers};
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Last request instant plus the number of requests being served.
struct Activity {
    last: Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn begin(&self) -> ActivityGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        ActivityGuard(self)
    }

    /// Time since the last request, or `None` while one is in flight.
    fn idle_for(&self) -> Option<Duration> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return None;
        }
        let last = *self.last.lock().unwrap_or_else(|p| p.into_inner());
        Some(last.elapsed())
    }
}

struct ActivityGuard<'a>(&'a Activity);

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.0.touch();
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct DaemonState {
    registry: MethodRegistry,
    activity: Activity,
}

/// A daemon ready to start: context, methods and startup handlers.
pub struct Daemon {
    ctx: DaemonContext,
    registry: MethodRegistry,
    startup: StartupHandlers,
}

impl Daemon {
    pub fn new(ctx: DaemonContext, registry: MethodRegistry) -> Self {
        Self {
            ctx,
            registry,
            startup: StartupHandlers::new(),
        }
    }

    pub fn with_startup(mut self, startup: StartupHandlers) -> Self {
        self.startup = startup;
        self
    }

    pub fn context(&self) -> &DaemonContext {
        &self.ctx
    }

    /// Validate, run startup handlers, bind and serve in the background.
    pub async fn start(self) -> Result<DaemonHandle> {
        let Daemon {
            ctx,
            registry,
            startup,
        } = self;

        registry.validate()?;
        startup.run(&ctx).await?;

        let addr = SocketAddr::from(([127, 0, 0, 1], ctx.port()));
        let listener = TcpListener::bind(addr).await.map_err(|e| DaemonError::Io {
            message: format!("failed to bind {}: {}", addr, e),
            path: None,
            source: Some(e),
        })?;
        let addr = listener.local_addr()?;

        let state = Arc::new(DaemonState {
            registry,
            activity: Activity::new(),
        });
        let app = Router::new()
            .route(DaemonConfig::HEALTH_PATH, get(handle_health))
            .route(DaemonConfig::RUN_METHOD_PATH, post(handle_run_method))
            .layer(middleware::from_fn_with_state(state.clone(), track_activity))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        info!(
            "Daemon for {} listening on {} ({} methods)",
            ctx.app_id(),
            addr,
            state.registry.len()
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let idle_timeout = ctx.idle_timeout();
        let check_interval = ctx.idle_check_interval();
        let task = tokio::spawn(async move {
            let stop = async move {
                tokio::select! {
                    _ = idle_watchdog(state, idle_timeout, check_interval) => {}
                    _ = shutdown_rx => debug!("Daemon shutdown requested"),
                }
            };
            axum::serve(listener, app)
                .with_graceful_shutdown(stop)
                .await
                .map_err(DaemonError::from)?;
            info!("Daemon stopped");
            Ok::<(), DaemonError>(())
        });

        Ok(DaemonHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Start, announce the port on stdout, and serve until idle.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        // Read by the supervisor to discover the port.
        println!("{}{}", DaemonConfig::PORT_LINE_PREFIX, handle.port());
        handle.wait().await
    }
}

/// Handle to a running daemon. Dropping stops it.
pub struct DaemonHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl DaemonHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting requests; in-flight ones finish.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait until the daemon stops on its own or after [`shutdown`](Self::shutdown).
    pub async fn wait(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task.await.map_err(|e| DaemonError::Io {
                message: format!("daemon task failed: {}", e),
                path: None,
                source: None,
            })?,
            None => Ok(()),
        }
    }

    pub async fn stop(mut self) -> Result<()> {
        self.shutdown();
        self.wait().await
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn idle_watchdog(state: Arc<DaemonState>, idle_timeout: Duration, check_interval: Duration) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Some(idle) = state.activity.idle_for() {
            if idle >= idle_timeout {
                info!("No requests in {:?}, shutting down", idle);
                return;
            }
        }
    }
}

async fn track_activity(
    State(state): State<Arc<DaemonState>>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = state.activity.begin();
    next.run(request).await
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn handle_run_method(
    State(state): State<Arc<DaemonState>>,
    body: Bytes,
) -> (StatusCode, Json<RunMethodResponse>) {
    let request: RunMethodRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(DaemonError::InvalidInput {
                message: format!("invalid request body: {}", e),
            })
        }
    };

    debug!("RunAppMethod {}.{}", request.server_file, request.method_name);
    match state
        .registry
        .call(&request.server_file, &request.method_name, request.data)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(RunMethodResponse::Success { result })),
        Err(e) => {
            warn!(
                "RunAppMethod {}.{} failed: {}",
                request.server_file, request.method_name, e
            );
            error_response(e)
        }
    }
}

fn error_response(error: DaemonError) -> (StatusCode, Json<RunMethodResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(RunMethodResponse::Error {
            error: error.to_string(),
        }),
    )
}
