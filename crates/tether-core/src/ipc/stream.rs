//! Per-call stream handles.
//!
//! A [`StreamHandle`] is one logical call multiplexed over a
//! [`ConnectionManager`]. It moves through `Idle → Started → Receiving →
//! Closed(cause)` and never leaves `Closed`.
//!
//! # Callbacks
//!
//! Frames are delivered to a [`StreamHandler`] on the connection task. An
//! error returned from, or a panic inside, `on_message` is reported through
//! `on_error` as [`StreamError::Handler`] and never reaches the connection.
//! `on_close` fires exactly once per handle.

use super::connection::{ConnectionManager, FrameRoute, RouteEvent};
use super::protocol::{ClientFrame, FrameKind, InboundFrame};
use crate::config::TransportConfig;
use crate::ids::CorrelationId;
use crate::{Result, TetherError};
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

/// Why a stream closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// [`StreamHandle::close`] was called.
    CalledCloseMethod,
    /// The physical connection dropped.
    WebsocketClosed,
    /// The runtime finished the method.
    MethodDone,
}

/// Error reported to a stream's handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    /// The runtime sent an `error` frame. The stream stays open.
    #[error("method error: {0}")]
    Method(Value),
    /// The handler's own `on_message` failed or panicked.
    #[error("handler exception: {0}")]
    Handler(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Started,
    Receiving,
    Closed(CloseCause),
}

/// Consumer of one stream's frames.
pub trait StreamHandler: Send + Sync + 'static {
    fn on_message(&self, frame: InboundFrame) -> anyhow::Result<()>;

    fn on_error(&self, error: StreamError) {
        warn!("Unhandled stream error: {}", error);
    }

    fn on_close(&self, cause: CloseCause) {
        debug!("Stream closed: {:?}", cause);
    }
}

type MessageFn = Box<dyn Fn(InboundFrame) -> anyhow::Result<()> + Send + Sync>;
type ErrorFn = Box<dyn Fn(StreamError) + Send + Sync>;
type CloseFn = Box<dyn Fn(CloseCause) + Send + Sync>;

/// Closure-based [`StreamHandler`].
///
/// ```rust,ignore
/// let handler = StreamCallbacks::new()
///     .on_message(|frame| { println!("{:?}", frame.data); Ok(()) })
///     .on_close(|cause| println!("closed: {:?}", cause));
/// ```
#[derive(Default)]
pub struct StreamCallbacks {
    message: Option<MessageFn>,
    error: Option<ErrorFn>,
    close: Option<CloseFn>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(InboundFrame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.message = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(StreamError) + Send + Sync + 'static,
    {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(CloseCause) + Send + Sync + 'static,
    {
        self.close = Some(Box::new(f));
        self
    }
}

impl StreamHandler for StreamCallbacks {
    fn on_message(&self, frame: InboundFrame) -> anyhow::Result<()> {
        match &self.message {
            Some(f) => f(frame),
            None => {
                debug!("Stream message {}: {}", frame.id, frame.data);
                Ok(())
            }
        }
    }

    fn on_error(&self, error: StreamError) {
        match &self.error {
            Some(f) => f(error),
            None => warn!("Unhandled stream error: {}", error),
        }
    }

    fn on_close(&self, cause: CloseCause) {
        if let Some(f) = &self.close {
            f(cause);
        }
    }
}

/// Returned by [`StreamHandle::start`].
///
/// Awaiting [`confirmed`](Self::confirmed) is optional; the call is already
/// queued when `start` returns.
#[derive(Debug)]
pub struct StartReceipt {
    id: CorrelationId,
    confirm_rx: oneshot::Receiver<std::result::Result<(), String>>,
}

impl StartReceipt {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Resolve once the runtime acknowledges the call with its first
    /// non-error frame.
    ///
    /// Fails with [`TetherError::CallRejected`] when the first frame is an
    /// `error`, and with [`TetherError::StreamClosed`] when the stream closes
    /// before any frame arrived.
    pub async fn confirmed(self) -> Result<()> {
        match self.confirm_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(TetherError::CallRejected {
                id: self.id.to_string(),
                message,
            }),
            Err(_) => Err(TetherError::StreamClosed {
                id: self.id.to_string(),
            }),
        }
    }
}

/// State shared between a handle and the connection task.
struct StreamShared {
    id: CorrelationId,
    method: String,
    handler: Arc<dyn StreamHandler>,
    state: Mutex<StreamState>,
    payload: Mutex<Option<Value>>,
    confirm_tx: Mutex<Option<oneshot::Sender<std::result::Result<(), String>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Callbacks never run under these locks, so poisoning cannot leave
    // the guarded data half-updated.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl StreamShared {
    fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    fn confirm(&self, outcome: std::result::Result<(), String>) {
        if let Some(tx) = lock(&self.confirm_tx).take() {
            let _ = tx.send(outcome);
        }
    }

    fn deliver(&self, frame: InboundFrame) {
        {
            let mut state = lock(&self.state);
            match *state {
                StreamState::Started => *state = StreamState::Receiving,
                StreamState::Receiving => {}
                StreamState::Idle | StreamState::Closed(_) => return,
            }
        }
        self.confirm(Ok(()));

        let handler = &self.handler;
        match catch_unwind(AssertUnwindSafe(|| handler.on_message(frame))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report(StreamError::Handler(format!("{:#}", e))),
            Err(panic) => self.report(StreamError::Handler(panic_message(panic))),
        }
    }

    fn method_error(&self, data: Value) {
        if matches!(self.state(), StreamState::Closed(_)) {
            return;
        }
        let message = match &data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.confirm(Err(message));
        self.report(StreamError::Method(data));
    }

    fn report(&self, error: StreamError) {
        let handler = &self.handler;
        if catch_unwind(AssertUnwindSafe(|| handler.on_error(error))).is_err() {
            warn!("on_error handler for {} panicked", self.id);
        }
    }

    /// Move to `Closed(cause)`. Returns false if already closed.
    fn close_with(&self, cause: CloseCause) -> bool {
        {
            let mut state = lock(&self.state);
            if matches!(*state, StreamState::Closed(_)) {
                return false;
            }
            *state = StreamState::Closed(cause);
        }
        // Dropping the sender fails a pending confirmation.
        lock(&self.confirm_tx).take();

        let handler = &self.handler;
        if catch_unwind(AssertUnwindSafe(|| handler.on_close(cause))).is_err() {
            warn!("on_close handler for {} panicked", self.id);
        }
        true
    }
}

impl FrameRoute for StreamShared {
    fn route(&self, event: RouteEvent) {
        match event {
            RouteEvent::Message(frame) => self.deliver(frame),
            RouteEvent::MethodError(data) => self.method_error(data),
            RouteEvent::MethodDone => {
                self.close_with(CloseCause::MethodDone);
            }
            RouteEvent::WebsocketClosed => {
                self.close_with(CloseCause::WebsocketClosed);
            }
        }
    }
}

/// One logical call over a shared connection.
pub struct StreamHandle {
    conn: ConnectionManager,
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    pub fn new(
        conn: &ConnectionManager,
        method: impl Into<String>,
        handler: impl StreamHandler,
    ) -> Self {
        Self::with_handler(conn, method, Arc::new(handler))
    }

    pub fn with_handler(
        conn: &ConnectionManager,
        method: impl Into<String>,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        let method = method.into();
        Self {
            conn: conn.clone(),
            shared: Arc::new(StreamShared {
                id: CorrelationId::generate(&method),
                method,
                handler,
                state: Mutex::new(StreamState::Idle),
                payload: Mutex::new(None),
                confirm_tx: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &CorrelationId {
        &self.shared.id
    }

    pub fn method(&self) -> &str {
        &self.shared.method
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), StreamState::Closed(_))
    }

    /// Register with the connection and queue the `call` frame.
    ///
    /// Never waits for connectivity. Fails if the handle was already started
    /// or the connection is terminally closed.
    pub fn start(&self, payload: Value) -> Result<StartReceipt> {
        {
            let mut state = lock(&self.shared.state);
            if *state != StreamState::Idle {
                return Err(TetherError::AlreadyStarted {
                    id: self.shared.id.to_string(),
                });
            }
            if self.conn.current_state().is_terminal() {
                return Err(TetherError::ConnectionClosed {
                    reason: format!("cannot start {}: connection is closed", self.shared.id),
                });
            }
            *state = StreamState::Started;
        }

        let (confirm_tx, confirm_rx) = oneshot::channel();
        *lock(&self.shared.confirm_tx) = Some(confirm_tx);
        *lock(&self.shared.payload) = Some(payload.clone());

        let queued = self
            .conn
            .register(self.shared.id.clone(), self.shared.clone())
            .and_then(|_| {
                self.conn.send(ClientFrame::Call {
                    method: self.shared.method.clone(),
                    id: self.shared.id.clone(),
                    data: payload,
                })
            });
        if let Err(e) = queued {
            // The connection task is gone.
            self.shared.close_with(CloseCause::WebsocketClosed);
            return Err(e);
        }

        debug!("Started stream {}", self.shared.id);
        Ok(StartReceipt {
            id: self.shared.id.clone(),
            confirm_rx,
        })
    }

    /// Close the stream. Idempotent and infallible.
    ///
    /// A started stream is unregistered and a best-effort `cancel` is sent.
    pub fn close(&self) {
        let was_started = !matches!(self.state(), StreamState::Idle);
        if !self.shared.close_with(CloseCause::CalledCloseMethod) {
            return;
        }
        if !was_started {
            return;
        }

        let _ = self.conn.unregister(self.shared.id.clone());
        let _ = self.conn.send(ClientFrame::Cancel {
            method: self.shared.method.clone(),
            id: self.shared.id.clone(),
        });
    }

    /// Close locally without sending `cancel`, for calls the runtime has
    /// already finished.
    fn detach(&self) {
        let was_started = !matches!(self.state(), StreamState::Idle);
        if self.shared.close_with(CloseCause::CalledCloseMethod) && was_started {
            let _ = self.conn.unregister(self.shared.id.clone());
        }
    }

    /// A fresh idle handle for the same method, payload and handler, with a
    /// new correlation id.
    pub fn clone_with_same_handlers(&self) -> StreamHandle {
        let fresh = Self::with_handler(&self.conn, self.shared.method.clone(), self.shared.handler.clone());
        *lock(&fresh.shared.payload) = lock(&self.shared.payload).clone();
        fresh
    }

    /// Payload passed to the last `start`, if any.
    pub fn payload(&self) -> Option<Value> {
        lock(&self.shared.payload).clone()
    }

    /// Start a handle produced by [`clone_with_same_handlers`](Self::clone_with_same_handlers)
    /// with the payload it inherited.
    pub fn restart(&self) -> Result<StartReceipt> {
        let payload = self.payload().unwrap_or(Value::Null);
        self.start(payload)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.shared.id)
            .field("method", &self.shared.method)
            .field("state", &self.state())
            .finish()
    }
}

type UnaryReply = Arc<Mutex<Option<oneshot::Sender<std::result::Result<Value, String>>>>>;

/// Call `method` and wait for its first `methodOutput`.
///
/// The stream is closed once the reply arrives; `cancel` is only sent when
/// the runtime has not reported `methodDone` shortly after. Fails with
/// [`TetherError::CallRejected`] on an `error` frame and with
/// [`TetherError::StreamClosed`] when the method finishes without output.
pub async fn call_unary(conn: &ConnectionManager, method: &str, payload: Value) -> Result<Value> {
    let (tx, rx) = oneshot::channel();
    let reply: UnaryReply = Arc::new(Mutex::new(Some(tx)));

    let done = Arc::new(Notify::new());

    let on_output = reply.clone();
    let on_error = reply.clone();
    let on_close = reply;
    let on_done = done.clone();
    let handler = StreamCallbacks::new()
        .on_message(move |frame| {
            if frame.kind == FrameKind::MethodOutput {
                if let Some(tx) = lock(&on_output).take() {
                    let _ = tx.send(Ok(frame.data));
                }
            }
            Ok(())
        })
        .on_error(move |error| {
            if let Some(tx) = lock(&on_error).take() {
                let message = match error {
                    StreamError::Method(Value::String(s)) => s,
                    other => other.to_string(),
                };
                let _ = tx.send(Err(message));
            }
        })
        .on_close(move |cause| {
            lock(&on_close).take();
            if cause == CloseCause::MethodDone {
                on_done.notify_one();
            }
        });

    let handle = StreamHandle::new(conn, method, handler);
    handle.start(payload)?;
    let reply = rx.await;

    match &reply {
        Ok(Ok(_)) => {
            // Output and methodDone are separate frames.
            if !handle.is_closed() {
                let grace = TransportConfig::UNARY_DONE_GRACE;
                let _ = tokio::time::timeout(grace, done.notified()).await;
            }
            handle.close();
        }
        // A failed or rejected call is no longer running on the runtime.
        Ok(Err(_)) => handle.detach(),
        Err(_) => {}
    }

    match reply {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(TetherError::CallRejected {
            id: handle.id().to_string(),
            message,
        }),
        Err(_) => Err(TetherError::StreamClosed {
            id: handle.id().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn offline_conn() -> ConnectionManager {
        let policy = ReconnectPolicy::new()
            .with_delay_initial(Duration::from_secs(60))
            .with_max_attempts(None);
        ConnectionManager::with_policy("ws://127.0.0.1:1/api/websocket", policy).unwrap()
    }

    fn frame(id: &CorrelationId, data: Value) -> InboundFrame {
        InboundFrame {
            id: id.clone(),
            kind: FrameKind::MethodOutput,
            method: None,
            data,
        }
    }

    #[derive(Default)]
    struct Counting {
        messages: AtomicUsize,
        errors: Mutex<Vec<StreamError>>,
        closes: Mutex<Vec<CloseCause>>,
    }

    impl StreamHandler for Arc<Counting> {
        fn on_message(&self, frame: InboundFrame) -> anyhow::Result<()> {
            self.messages.fetch_add(1, Ordering::SeqCst);
            if frame.data == Value::String("fail".into()) {
                anyhow::bail!("bad payload");
            }
            if frame.data == Value::String("panic".into()) {
                panic!("handler blew up");
            }
            Ok(())
        }

        fn on_error(&self, error: StreamError) {
            self.errors.lock().unwrap().push(error);
        }

        fn on_close(&self, cause: CloseCause) {
            self.closes.lock().unwrap().push(cause);
        }
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let conn = offline_conn();
        let handle = StreamHandle::new(&conn, "Echo", StreamCallbacks::new());

        handle.start(Value::Null).unwrap();
        assert_eq!(handle.state(), StreamState::Started);

        let err = handle.start(Value::Null).unwrap_err();
        assert!(matches!(err, TetherError::AlreadyStarted { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let conn = offline_conn();
        let counting = Arc::new(Counting::default());
        let handle = StreamHandle::new(&conn, "Echo", counting.clone());

        handle.start(Value::Null).unwrap();
        handle.close();
        handle.close();

        assert_eq!(handle.state(), StreamState::Closed(CloseCause::CalledCloseMethod));
        assert_eq!(*counting.closes.lock().unwrap(), vec![CloseCause::CalledCloseMethod]);
    }

    #[tokio::test]
    async fn test_dropping_a_started_handle_closes_it() {
        let conn = offline_conn();
        let counting = Arc::new(Counting::default());
        let handle = StreamHandle::new(&conn, "Echo", counting.clone());
        let receipt = handle.start(Value::Null).unwrap();

        drop(handle);

        assert_eq!(*counting.closes.lock().unwrap(), vec![CloseCause::CalledCloseMethod]);
        assert!(matches!(
            receipt.confirmed().await,
            Err(TetherError::StreamClosed { .. })
        ));
    }

    #[test]
    fn test_start_on_dead_connection_task_fires_on_close() {
        // The runtime goes away with the connection task, leaving the
        // last reported state non-terminal.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let conn = runtime.block_on(async { offline_conn() });
        drop(runtime);

        let counting = Arc::new(Counting::default());
        let handle = StreamHandle::new(&conn, "Echo", counting.clone());
        let err = handle.start(Value::Null).unwrap_err();

        assert!(matches!(err, TetherError::ConnectionClosed { .. }));
        assert_eq!(handle.state(), StreamState::Closed(CloseCause::WebsocketClosed));
        drop(handle);
        assert_eq!(*counting.closes.lock().unwrap(), vec![CloseCause::WebsocketClosed]);
    }

    #[tokio::test]
    async fn test_late_frames_after_close_are_ignored() {
        let conn = offline_conn();
        let counting = Arc::new(Counting::default());
        let handle = StreamHandle::new(&conn, "Echo", counting.clone());

        handle.start(Value::Null).unwrap();
        handle.close();
        handle
            .shared
            .route(RouteEvent::Message(frame(handle.id(), Value::Null)));
        handle.shared.route(RouteEvent::WebsocketClosed);

        assert_eq!(counting.messages.load(Ordering::SeqCst), 0);
        assert_eq!(counting.closes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_become_handler_exceptions() {
        let conn = offline_conn();
        let counting = Arc::new(Counting::default());
        let handle = StreamHandle::new(&conn, "Echo", counting.clone());
        handle.start(Value::Null).unwrap();

        handle
            .shared
            .route(RouteEvent::Message(frame(handle.id(), Value::String("fail".into()))));
        handle
            .shared
            .route(RouteEvent::Message(frame(handle.id(), Value::String("panic".into()))));
        handle
            .shared
            .route(RouteEvent::Message(frame(handle.id(), Value::Null)));

        let errors = counting.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, StreamError::Handler(_))));
        assert_eq!(counting.messages.load(Ordering::SeqCst), 3);
        assert_eq!(handle.state(), StreamState::Receiving);
    }

    #[tokio::test]
    async fn test_method_error_keeps_stream_open() {
        let conn = offline_conn();
        let counting = Arc::new(Counting::default());
        let handle = StreamHandle::new(&conn, "Echo", counting.clone());
        let receipt = handle.start(Value::Null).unwrap();

        handle
            .shared
            .route(RouteEvent::MethodError(Value::String("invalid value for 'method'".into())));

        assert_eq!(handle.state(), StreamState::Started);
        assert!(matches!(
            receipt.confirmed().await,
            Err(TetherError::CallRejected { .. })
        ));
        assert!(matches!(
            counting.errors.lock().unwrap()[0],
            StreamError::Method(_)
        ));
    }

    #[tokio::test]
    async fn test_confirmed_resolves_on_first_frame() {
        let conn = offline_conn();
        let handle = StreamHandle::new(&conn, "Echo", StreamCallbacks::new());
        let receipt = handle.start(Value::Null).unwrap();

        handle.shared.route(RouteEvent::Message(InboundFrame {
            id: handle.id().clone(),
            kind: FrameKind::MethodStarted,
            method: Some("Echo".into()),
            data: Value::Null,
        }));

        receipt.confirmed().await.unwrap();
    }

    #[tokio::test]
    async fn test_confirmed_fails_when_closed_first() {
        let conn = offline_conn();
        let handle = StreamHandle::new(&conn, "Echo", StreamCallbacks::new());
        let receipt = handle.start(Value::Null).unwrap();
        handle.close();

        assert!(matches!(
            receipt.confirmed().await,
            Err(TetherError::StreamClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_clone_with_same_handlers_gets_new_id() {
        let conn = offline_conn();
        let counting = Arc::new(Counting::default());
        let handle = StreamHandle::new(&conn, "SubscribeTopic", counting.clone());
        handle.start(serde_json::json!({"category": "a", "key": "b"})).unwrap();

        let fresh = handle.clone_with_same_handlers();
        assert_ne!(fresh.id(), handle.id());
        assert_eq!(fresh.state(), StreamState::Idle);
        assert_eq!(fresh.payload(), handle.payload());

        fresh.restart().unwrap();
        fresh
            .shared
            .route(RouteEvent::Message(frame(fresh.id(), Value::Null)));
        assert_eq!(counting.messages.load(Ordering::SeqCst), 1);
    }
}
