//! Websocket stream server: the runtime side of the duplex protocol.
//!
//! Serves `/api/websocket` with axum. Each accepted socket gets:
//! - one writer task fed by an unbounded channel, since the socket cannot be
//!   written concurrently
//! - an in-flight map of correlation id → method task, so `cancel` can abort
//!   a running method
//!
//! Closing the socket aborts every method still running on it.

use super::protocol::ServerFrame;
use crate::config::{ServerConfig, TransportConfig};
use crate::ids::CorrelationId;
use crate::{Result, TetherError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A method callable over the stream endpoint.
#[async_trait::async_trait]
pub trait StreamMethod: Send + Sync + 'static {
    /// Name used in `call` frames.
    fn name(&self) -> &str;

    /// Whether the method sends `methodStarted` itself through
    /// [`StreamSink::started`].
    ///
    /// Subscriptions return true so the client is only confirmed once the
    /// subscription is live. Other methods are announced before they run.
    fn announces_start(&self) -> bool {
        false
    }

    /// Run the method. `Ok` ends the call with `methodDone`, `Err` with an
    /// `error` frame carrying the message.
    async fn run(&self, input: Value, sink: StreamSink) -> anyhow::Result<()>;
}

/// Output side of one running call.
#[derive(Clone)]
pub struct StreamSink {
    id: CorrelationId,
    method: Arc<str>,
    out: mpsc::UnboundedSender<ServerFrame>,
    started: Arc<AtomicBool>,
}

impl StreamSink {
    fn new(id: CorrelationId, method: &str, out: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            id,
            method: Arc::from(method),
            out,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Send `methodStarted`. Only the first call has an effect.
    pub fn started(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            let _ = self.out.send(ServerFrame::MethodStarted {
                id: self.id.clone(),
                method: Some(self.method.to_string()),
            });
        }
    }

    /// Send one `methodOutput` frame.
    pub fn send<T: Serialize>(&self, data: &T) -> Result<()> {
        let data = serde_json::to_value(data)?;
        self.out
            .send(ServerFrame::output(self.id.clone(), &self.method, data))
            .map_err(|_| TetherError::ConnectionClosed {
                reason: "client disconnected".to_string(),
            })
    }

    /// Whether the client connection is gone.
    pub fn is_closed(&self) -> bool {
        self.out.is_closed()
    }

    /// Resolve once the client connection is gone.
    pub async fn closed(&self) {
        self.out.closed().await
    }
}

struct ServerShared {
    methods: Arc<HashMap<String, Arc<dyn StreamMethod>>>,
    drop_rx: watch::Receiver<u64>,
    active_connections: AtomicUsize,
}

/// Registry of stream methods plus the websocket endpoint serving them.
pub struct StreamServer {
    methods: Arc<HashMap<String, Arc<dyn StreamMethod>>>,
    drop_tx: Arc<watch::Sender<u64>>,
}

impl Default for StreamServer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamServer {
    pub fn new() -> Self {
        let (drop_tx, _) = watch::channel(0);
        Self {
            methods: Arc::new(HashMap::new()),
            drop_tx: Arc::new(drop_tx),
        }
    }

    /// Register a method. Names must be unique.
    pub fn register<M: StreamMethod>(&mut self, method: M) -> Result<()> {
        let name = method.name().to_string();
        if self.methods.contains_key(&name) {
            return Err(TetherError::DuplicateMethod { method: name });
        }
        Arc::make_mut(&mut self.methods).insert(name, Arc::new(method));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_method<M: StreamMethod>(mut self, method: M) -> Result<Self> {
        self.register(method)?;
        Ok(self)
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Router serving the websocket endpoint.
    pub fn router(&self) -> Router {
        let shared = Arc::new(ServerShared {
            methods: self.methods.clone(),
            drop_rx: self.drop_tx.subscribe(),
            active_connections: AtomicUsize::new(0),
        });
        Router::new()
            .route(TransportConfig::WEBSOCKET_PATH, get(websocket_handler))
            .with_state(shared)
    }

    /// Bind `addr` and serve the websocket endpoint.
    pub async fn start(self, addr: SocketAddr) -> Result<StreamServerHandle> {
        self.start_with(addr, Router::new()).await
    }

    /// Bind `addr` and serve the websocket endpoint merged with `routes`.
    pub async fn start_with(self, addr: SocketAddr, routes: Router) -> Result<StreamServerHandle> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TetherError::Io {
                message: format!("failed to bind {}: {}", addr, e),
                path: None,
                source: Some(e),
            })?;
        let addr = listener.local_addr()?;
        let app = self.router().merge(routes);

        info!("Stream server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!("Stream server error: {}", e);
            }
            info!("Stream server stopped");
        });

        Ok(StreamServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            drop_tx: self.drop_tx,
            task_handle: Some(task),
        })
    }
}

/// Handle to a running stream server. Dropping shuts down the server.
pub struct StreamServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    drop_tx: Arc<watch::Sender<u64>>,
    task_handle: Option<JoinHandle<()>>,
}

impl StreamServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `ws://` URL of the stream endpoint.
    pub fn websocket_url(&self) -> String {
        format!("ws://{}{}", self.addr, TransportConfig::WEBSOCKET_PATH)
    }

    /// Close every live socket while continuing to accept new ones.
    pub fn drop_connections(&self) {
        self.drop_tx.send_modify(|epoch| *epoch += 1);
    }

    /// Stop accepting connections and close the live ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.drop_connections();
    }

    /// Shut down and wait for the server task to finish.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(task) = self.task_handle.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StreamServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

async fn websocket_handler(
    State(shared): State<Arc<ServerShared>>,
    ws: WebSocketUpgrade,
) -> Response {
    let current = shared.active_connections.load(Ordering::Relaxed);
    if current >= ServerConfig::MAX_CONNECTIONS {
        warn!(
            "Rejecting websocket connection: at max capacity ({})",
            ServerConfig::MAX_CONNECTIONS
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(ServerConfig::MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            shared.active_connections.fetch_add(1, Ordering::Relaxed);
            handle_socket(socket, &shared).await;
            shared.active_connections.fetch_sub(1, Ordering::Relaxed);
        })
}

/// Client frame parsed loosely so every protocol error gets its own message.
#[derive(Debug, Deserialize)]
struct RawClientFrame {
    #[serde(default)]
    id: String,
    kind: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    data: Value,
}

struct Connection<'a> {
    shared: &'a ServerShared,
    out_tx: mpsc::UnboundedSender<ServerFrame>,
    done_tx: mpsc::UnboundedSender<CorrelationId>,
    in_flight: HashMap<CorrelationId, JoinHandle<()>>,
}

async fn handle_socket(socket: WebSocket, shared: &ServerShared) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<CorrelationId>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(text)).await {
                debug!("Failed to write to websocket: {}", e);
                break;
            }
        }
    });

    let mut conn = Connection {
        shared,
        out_tx,
        done_tx,
        in_flight: HashMap::new(),
    };
    let mut drop_rx = shared.drop_rx.clone();
    drop_rx.borrow_and_update();
    let mut drop_live = true;

    debug!("Websocket connection opened");
    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => conn.handle_text(&text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Websocket read error: {}", e);
                    break;
                }
            },
            Some(id) = done_rx.recv() => {
                conn.in_flight.remove(&id);
            }
            changed = drop_rx.changed(), if drop_live => {
                if changed.is_err() {
                    drop_live = false;
                    continue;
                }
                info!("Dropping websocket connection");
                break;
            }
        }
    }

    for (id, task) in conn.in_flight.drain() {
        debug!("Aborting in-flight call {}", id);
        task.abort();
    }
    writer.abort();
    debug!("Websocket connection closed");
}

impl Connection<'_> {
    fn reply_error(&self, id: &str, method: &str, message: &str) {
        let method = (!method.is_empty()).then_some(method);
        let _ = self
            .out_tx
            .send(ServerFrame::error(CorrelationId::from(id), method, message));
    }

    fn handle_text(&mut self, text: &str) {
        let frame: RawClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Stream server failed to parse frame: {}", e);
                self.reply_error("", "", "failed to parse JSON");
                return;
            }
        };

        let id = CorrelationId::from(frame.id.as_str());
        match frame.kind.as_str() {
            "call" => {
                let Some(method) = self.shared.methods.get(&frame.method).cloned() else {
                    debug!("Stream server got invalid value for 'method': {}", frame.method);
                    self.reply_error(&frame.id, &frame.method, "invalid value for 'method'");
                    return;
                };
                if frame.id.is_empty() {
                    self.reply_error(&frame.id, &frame.method, "'id' field was empty");
                    return;
                }
                if self.in_flight.contains_key(&id) {
                    self.reply_error(&frame.id, &frame.method, "'id' field used previous ID value");
                    return;
                }

                let task = tokio::spawn(run_method(
                    method,
                    id.clone(),
                    frame.data,
                    self.out_tx.clone(),
                    self.done_tx.clone(),
                ));
                self.in_flight.insert(id, task);
            }
            "cancel" => match self.in_flight.remove(&id) {
                Some(task) => {
                    debug!("Cancelling call {}", id);
                    task.abort();
                }
                None => self.reply_error(&frame.id, &frame.method, "'id' not found"),
            },
            other => {
                debug!("Stream server got invalid value for 'kind': {}", other);
                self.reply_error(&frame.id, &frame.method, "invalid value for 'kind'");
            }
        }
    }
}

async fn run_method(
    method: Arc<dyn StreamMethod>,
    id: CorrelationId,
    input: Value,
    out_tx: mpsc::UnboundedSender<ServerFrame>,
    done_tx: mpsc::UnboundedSender<CorrelationId>,
) {
    let name = method.name().to_string();
    debug!("Starting stream method {} ({})", name, id);

    let sink = StreamSink::new(id.clone(), &name, out_tx.clone());
    if !method.announces_start() {
        sink.started();
    }

    let outcome = AssertUnwindSafe(method.run(input, sink)).catch_unwind().await;
    let frame = match outcome {
        Ok(Ok(())) => ServerFrame::MethodDone {
            id: id.clone(),
            method: Some(name),
        },
        Ok(Err(e)) => {
            debug!("Stream method {} ({}) failed: {:#}", name, id, e);
            ServerFrame::error(id.clone(), Some(&name), format!("{:#}", e))
        }
        Err(_) => {
            error!("Stream method {} ({}) panicked", name, id);
            ServerFrame::error(id.clone(), Some(&name), "method panicked")
        }
    };
    let _ = out_tx.send(frame);
    let _ = done_tx.send(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl StreamMethod for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, _input: Value, _sink: StreamSink) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_methods_rejected() {
        let mut server = StreamServer::new();
        server.register(Named("Echo")).unwrap();
        let err = server.register(Named("Echo")).unwrap_err();
        assert!(matches!(err, TetherError::DuplicateMethod { .. }));
        assert_eq!(server.method_names(), vec!["Echo".to_string()]);
    }

    #[tokio::test]
    async fn test_sink_announces_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = StreamSink::new("Echo-1".into(), "Echo", tx);

        sink.started();
        sink.started();
        sink.send(&serde_json::json!({"n": 1})).unwrap();
        drop(sink);

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], ServerFrame::MethodStarted { .. }));
        assert!(matches!(frames[1], ServerFrame::MethodOutput { .. }));
    }
}
