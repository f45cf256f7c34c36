//! Shared websocket connection multiplexing every stream of a client.
//!
//! One background task owns the socket and the correlation id → route map.
//! The public [`ConnectionManager`] handle only sends commands to that task,
//! so registering, unregistering and sending never block the caller.
//!
//! The task:
//! 1. Connects (bounded by the policy's connect timeout) and flushes frames
//!    queued while offline
//! 2. Reads text frames and routes them to the stream owning their id
//! 3. On a transport break, notifies every registered route once with
//!    [`RouteEvent::WebsocketClosed`] and forgets it
//! 4. Reconnects with exponential backoff until the policy is exhausted

use super::backoff::ReconnectBackoff;
use super::protocol::{ClientFrame, FrameKind, InboundFrame};
use crate::config::ReconnectPolicy;
use crate::ids::CorrelationId;
use crate::{Result, TetherError};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why the connection is not open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The socket dropped; a reconnect is pending.
    TransportClosed,
    /// The reconnect policy gave up. Terminal.
    ReconnectExhausted,
    /// The manager was shut down. Terminal.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed(DisconnectCause),
}

impl ConnectionState {
    /// Whether the connection will never open again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Closed(DisconnectCause::ReconnectExhausted)
                | ConnectionState::Closed(DisconnectCause::Shutdown)
        )
    }
}

/// Event delivered to the owner of a correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteEvent {
    /// `methodOutput`, `methodStarted` or an unknown kind.
    Message(InboundFrame),
    /// `error` frame; the stream stays open.
    MethodError(Value),
    /// `methodDone` frame; the route has been removed.
    MethodDone,
    /// The physical connection closed; the route has been removed.
    WebsocketClosed,
}

/// Receiver of the frames addressed to one correlation id.
///
/// Called on the connection task. Implementations must not block.
pub trait FrameRoute: Send + Sync + 'static {
    fn route(&self, event: RouteEvent);
}

enum ConnCmd {
    Register {
        id: CorrelationId,
        route: Arc<dyn FrameRoute>,
    },
    Unregister {
        id: CorrelationId,
    },
    Send(ClientFrame),
    Shutdown,
}

struct Inner {
    url: Url,
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    state_rx: watch::Receiver<ConnectionState>,
    _task: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(ConnCmd::Shutdown);
    }
}

/// Cloneable handle to the shared connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Start managing a connection to `url` with the default reconnect policy.
    ///
    /// Must be called from within a tokio runtime. Returns immediately; the
    /// first connect attempt happens in the background.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_policy(url, ReconnectPolicy::default())
    }

    pub fn with_policy(url: &str, policy: ReconnectPolicy) -> Result<Self> {
        let url = Url::parse(url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(TetherError::Config {
                message: format!("websocket URL must use ws:// or wss://, got {}", url),
            });
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let driver = Driver {
            url: url.clone(),
            policy,
            cmd_rx,
            state_tx,
            routes: HashMap::new(),
            pending: VecDeque::new(),
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                cmd_tx,
                state_rx,
                _task: task,
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Wait until the connection is open.
    ///
    /// Fails once the connection reaches a terminal state.
    pub async fn wait_open(&self) -> Result<()> {
        let mut state_rx = self.watch_state();
        let state = state_rx
            .wait_for(|state| *state == ConnectionState::Open || state.is_terminal())
            .await
            .map_err(|_| TetherError::ConnectionClosed {
                reason: "connection task ended".to_string(),
            })?;
        match *state {
            ConnectionState::Open => Ok(()),
            other => Err(closed_error(other)),
        }
    }

    /// Queue a frame. While offline, `call` frames wait for the next open
    /// and a `cancel` drops the queued `call` with the same id.
    pub fn send(&self, frame: ClientFrame) -> Result<()> {
        self.command(ConnCmd::Send(frame))
    }

    /// Route frames for `id` to `route` until `methodDone`, a transport
    /// break or [`unregister`](Self::unregister).
    pub fn register(&self, id: CorrelationId, route: Arc<dyn FrameRoute>) -> Result<()> {
        self.command(ConnCmd::Register { id, route })
    }

    pub fn unregister(&self, id: CorrelationId) -> Result<()> {
        self.command(ConnCmd::Unregister { id })
    }

    /// Close the socket and notify every registered route. Terminal.
    pub fn shutdown(&self) {
        let _ = self.inner.cmd_tx.send(ConnCmd::Shutdown);
    }

    fn command(&self, cmd: ConnCmd) -> Result<()> {
        if self.current_state().is_terminal() {
            return Err(closed_error(self.current_state()));
        }
        self.inner
            .cmd_tx
            .send(cmd)
            .map_err(|_| TetherError::ConnectionClosed {
                reason: "connection task ended".to_string(),
            })
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.url.as_str())
            .field("state", &self.current_state())
            .finish()
    }
}

fn closed_error(state: ConnectionState) -> TetherError {
    let reason = match state {
        ConnectionState::Closed(DisconnectCause::ReconnectExhausted) => "reconnect attempts exhausted",
        ConnectionState::Closed(DisconnectCause::Shutdown) => "connection manager shut down",
        _ => "connection closed",
    };
    TetherError::ConnectionClosed {
        reason: reason.to_string(),
    }
}

/// Outcome of handling a command while no socket is open.
enum Offline {
    Continue,
    Shutdown,
}

struct Driver {
    url: Url,
    policy: ReconnectPolicy,
    cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    state_tx: watch::Sender<ConnectionState>,
    routes: HashMap<CorrelationId, Arc<dyn FrameRoute>>,
    pending: VecDeque<ClientFrame>,
}

impl Driver {
    async fn run(mut self) {
        let mut backoff = ReconnectBackoff::new(&self.policy);
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);

            let socket = match self.connect().await {
                Some(Ok(socket)) => socket,
                Some(Err(e)) => {
                    failures += 1;
                    warn!(
                        "Connect attempt {} to {} failed: {}",
                        failures, self.url, e
                    );
                    if self.policy.is_exhausted(failures) {
                        warn!("Giving up on {} after {} attempts", self.url, failures);
                        self.finish(DisconnectCause::ReconnectExhausted);
                        return;
                    }
                    if let Offline::Shutdown = self.wait_offline(backoff.next_duration()).await {
                        self.finish(DisconnectCause::Shutdown);
                        return;
                    }
                    continue;
                }
                None => {
                    self.finish(DisconnectCause::Shutdown);
                    return;
                }
            };

            failures = 0;
            backoff.reset();
            info!("Connected to {}", self.url);
            self.set_state(ConnectionState::Open);

            if let Offline::Shutdown = self.serve(socket).await {
                self.finish(DisconnectCause::Shutdown);
                return;
            }

            info!("Connection to {} closed", self.url);
            self.set_state(ConnectionState::Closed(DisconnectCause::TransportClosed));
            self.pending.clear();
            self.fail_routes();

            if let Offline::Shutdown = self.wait_offline(backoff.next_duration()).await {
                self.finish(DisconnectCause::Shutdown);
                return;
            }
        }
    }

    /// One connect attempt. `None` means shutdown was requested meanwhile.
    async fn connect(&mut self) -> Option<Result<Socket>> {
        let url = self.url.to_string();
        let timeout = self.policy.connect_timeout;
        let attempt = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url));
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return Some(match result {
                        Ok(Ok((socket, _response))) => Ok(socket),
                        Ok(Err(e)) => Err(e.into()),
                        Err(_) => Err(TetherError::Timeout(timeout)),
                    });
                }
                cmd = self.cmd_rx.recv() => {
                    if let Offline::Shutdown = self.handle_offline(cmd) {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep for `delay` while still accepting commands.
    async fn wait_offline(&mut self, delay: std::time::Duration) -> Offline {
        debug!("Reconnecting to {} in {:?}", self.url, delay);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Offline::Continue,
                cmd = self.cmd_rx.recv() => {
                    if let Offline::Shutdown = self.handle_offline(cmd) {
                        return Offline::Shutdown;
                    }
                }
            }
        }
    }

    fn handle_offline(&mut self, cmd: Option<ConnCmd>) -> Offline {
        match cmd {
            Some(ConnCmd::Register { id, route }) => {
                self.routes.insert(id, route);
            }
            Some(ConnCmd::Unregister { id }) => {
                self.routes.remove(&id);
            }
            Some(ConnCmd::Send(frame)) => match frame {
                ClientFrame::Call { .. } => self.pending.push_back(frame),
                ClientFrame::Cancel { ref id, .. } => {
                    self.pending.retain(|queued| queued.id() != id);
                }
            },
            Some(ConnCmd::Shutdown) | None => return Offline::Shutdown,
        }
        Offline::Continue
    }

    /// Pump frames until the socket breaks or shutdown is requested.
    async fn serve(&mut self, socket: Socket) -> Offline {
        let (mut sink, mut stream) = socket.split();

        while let Some(frame) = self.pending.pop_front() {
            if let Err(e) = write_frame(&mut sink, &frame).await {
                warn!("Failed to flush queued frame {}: {}", frame.id(), e);
                return Offline::Continue;
            }
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Register { id, route }) => {
                        self.routes.insert(id, route);
                    }
                    Some(ConnCmd::Unregister { id }) => {
                        self.routes.remove(&id);
                    }
                    Some(ConnCmd::Send(frame)) => {
                        if let Err(e) = write_frame(&mut sink, &frame).await {
                            warn!("Failed to send frame {}: {}", frame.id(), e);
                            return Offline::Continue;
                        }
                    }
                    Some(ConnCmd::Shutdown) | None => {
                        let _ = sink.close().await;
                        return Offline::Shutdown;
                    }
                },
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(_))) | None => return Offline::Continue,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Websocket read error on {}: {}", self.url, e);
                        return Offline::Continue;
                    }
                },
            }
        }
    }

    fn dispatch(&mut self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unparseable frame: {}", e);
                return;
            }
        };

        if frame.kind == FrameKind::MethodDone {
            match self.routes.remove(&frame.id) {
                Some(route) => route.route(RouteEvent::MethodDone),
                None => debug!("methodDone for unknown id {}", frame.id),
            }
            return;
        }

        let Some(route) = self.routes.get(&frame.id) else {
            debug!("Dropping {:?} frame for unknown id {}", frame.kind, frame.id);
            return;
        };
        match frame.kind {
            FrameKind::Error => route.route(RouteEvent::MethodError(frame.data)),
            _ => route.route(RouteEvent::Message(frame)),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn fail_routes(&mut self) {
        for (_, route) in std::mem::take(&mut self.routes) {
            route.route(RouteEvent::WebsocketClosed);
        }
    }

    fn finish(&mut self, cause: DisconnectCause) {
        info!("Connection manager for {} stopped: {:?}", self.url, cause);
        self.set_state(ConnectionState::Closed(cause));
        self.pending.clear();
        self.fail_routes();
    }
}

async fn write_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<RouteEvent>>,
    }

    impl FrameRoute for Recorder {
        fn route(&self, event: RouteEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ConnectionState::Open.is_terminal());
        assert!(!ConnectionState::Closed(DisconnectCause::TransportClosed).is_terminal());
        assert!(ConnectionState::Closed(DisconnectCause::ReconnectExhausted).is_terminal());
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_url() {
        let err = ConnectionManager::new("http://127.0.0.1:1/api/websocket").unwrap_err();
        assert!(matches!(err, TetherError::Config { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_policy_notifies_routes() {
        // Nothing listens on port 1.
        let policy = ReconnectPolicy::new()
            .with_delay_initial(Duration::from_millis(10))
            .with_delay_max(Duration::from_millis(10))
            .with_jitter(Duration::ZERO)
            .with_max_attempts(Some(2));
        let conn = ConnectionManager::with_policy("ws://127.0.0.1:1/api/websocket", policy).unwrap();

        let recorder = Arc::new(Recorder::default());
        conn.register("a".into(), recorder.clone()).unwrap();

        let err = conn.wait_open().await.unwrap_err();
        assert!(matches!(err, TetherError::ConnectionClosed { .. }));
        assert_eq!(
            conn.current_state(),
            ConnectionState::Closed(DisconnectCause::ReconnectExhausted)
        );
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![RouteEvent::WebsocketClosed]
        );
        assert!(conn.send(ClientFrame::Cancel {
            method: "m".into(),
            id: "a".into()
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_while_connecting() {
        let policy = ReconnectPolicy::new()
            .with_delay_initial(Duration::from_secs(60))
            .with_max_attempts(None);
        let conn = ConnectionManager::with_policy("ws://127.0.0.1:1/api/websocket", policy).unwrap();
        let recorder = Arc::new(Recorder::default());
        conn.register("b".into(), recorder.clone()).unwrap();

        conn.shutdown();
        let mut state_rx = conn.watch_state();
        state_rx
            .wait_for(|state| *state == ConnectionState::Closed(DisconnectCause::Shutdown))
            .await
            .unwrap();

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![RouteEvent::WebsocketClosed]
        );
    }
}
