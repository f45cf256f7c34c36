//! Topic reconciliation: merging a snapshot fetch with a live subscription.
//!
//! The snapshot and the live messages travel through independent paths, so
//! either may arrive first. [`Reconciler`] buffers live messages until a
//! snapshot lands, then discards the ones the snapshot already reflects and
//! folds the rest in id order. From then on the counter only moves forward.
//!
//! [`TopicQuery`] drives a reconciler from a `SubscribeTopic` stream and a
//! [`SnapshotSource`]: it subscribes, waits for the runtime to confirm the
//! subscription, and only then fetches the snapshot. A transport break
//! starts a new epoch; snapshots fetched for an older epoch are dropped.
//! A failed snapshot fetch is retried with backoff within its epoch.
//!
//! A query that can no longer sync (the connection closed for good, the
//! runtime rejected the subscription, or the publisher ended the topic
//! first) records the failure, and [`TopicQuery::wait_synced`] returns it.

use crate::config::{ReconnectPolicy, TopicConfig};
use crate::ids::TopicId;
use crate::ipc::backoff::ReconnectBackoff;
use crate::ipc::{
    call_unary, CloseCause, ConnectionManager, FrameKind, InboundFrame, PubSubMessage,
    StartReceipt, StreamError, StreamHandle, StreamHandler,
};
use crate::{Result, TetherError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Point-in-time state plus the id of the last message it reflects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    pub state: S,
    pub counter: u64,
}

/// Folds one topic message into the state.
pub trait TopicReducer: Send + Sync + 'static {
    type State: Clone + Send + Sync + 'static;
    type Message: DeserializeOwned;

    fn reduce(&self, state: &Self::State, message: Self::Message) -> Self::State;
}

/// [`TopicReducer`] backed by a closure.
pub struct FnReducer<S, M, F> {
    f: F,
    _marker: PhantomData<fn(&S, M) -> S>,
}

impl<S, M, F> FnReducer<S, M, F>
where
    F: Fn(&S, M) -> S,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<S, M, F> TopicReducer for FnReducer<S, M, F>
where
    S: Clone + Send + Sync + 'static,
    M: DeserializeOwned + 'static,
    F: Fn(&S, M) -> S + Send + Sync + 'static,
{
    type State = S;
    type Message = M;

    fn reduce(&self, state: &S, message: M) -> S {
        (self.f)(state, message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileState<S> {
    Empty { buffered: Vec<PubSubMessage> },
    Synced { counter: u64, state: S },
}

/// What [`Reconciler::ingest`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Buffered,
    Applied,
    /// Already reflected in the state.
    Duplicate,
    /// Id not above the last buffered id.
    OutOfOrder,
}

/// Pure reconciliation state machine.
pub struct Reconciler<R: TopicReducer> {
    reducer: Arc<R>,
    state: ReconcileState<R::State>,
}

impl<R: TopicReducer> Reconciler<R> {
    pub fn new(reducer: Arc<R>) -> Self {
        Self {
            reducer,
            state: ReconcileState::Empty {
                buffered: Vec::new(),
            },
        }
    }

    pub fn state(&self) -> &ReconcileState<R::State> {
        &self.state
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.state, ReconcileState::Synced { .. })
    }

    pub fn current(&self) -> Option<&R::State> {
        match &self.state {
            ReconcileState::Synced { state, .. } => Some(state),
            ReconcileState::Empty { .. } => None,
        }
    }

    pub fn counter(&self) -> Option<u64> {
        match &self.state {
            ReconcileState::Synced { counter, .. } => Some(*counter),
            ReconcileState::Empty { .. } => None,
        }
    }

    pub fn snapshot(&self) -> Option<Snapshot<R::State>> {
        match &self.state {
            ReconcileState::Synced { counter, state } => Some(Snapshot {
                state: state.clone(),
                counter: *counter,
            }),
            ReconcileState::Empty { .. } => None,
        }
    }

    /// Feed one live message.
    pub fn ingest(&mut self, message: PubSubMessage) -> Ingested {
        match &mut self.state {
            ReconcileState::Empty { buffered } => {
                if let Some(last) = buffered.last() {
                    if message.message_id <= last.message_id {
                        warn!(
                            "Dropping out-of-order message {} (last buffered {})",
                            message.message_id, last.message_id
                        );
                        return Ingested::OutOfOrder;
                    }
                }
                buffered.push(message);
                Ingested::Buffered
            }
            ReconcileState::Synced { counter, state } => {
                if message.message_id <= *counter {
                    debug!(
                        "Dropping duplicate message {} (counter {})",
                        message.message_id, counter
                    );
                    return Ingested::Duplicate;
                }
                *state = fold(&*self.reducer, state, message.data);
                *counter = message.message_id;
                Ingested::Applied
            }
        }
    }

    /// Merge a snapshot. Returns false when it was discarded as older than
    /// the synced state.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot<R::State>) -> bool {
        match &mut self.state {
            ReconcileState::Empty { buffered } => {
                let buffered = std::mem::take(buffered);
                let mut state = snapshot.state;
                let mut counter = snapshot.counter;
                for message in buffered {
                    if message.message_id <= counter {
                        continue;
                    }
                    state = fold(&*self.reducer, &state, message.data);
                    counter = message.message_id;
                }
                self.state = ReconcileState::Synced { counter, state };
                true
            }
            ReconcileState::Synced { counter, state } => {
                if snapshot.counter < *counter {
                    debug!(
                        "Discarding stale snapshot at {} (counter {})",
                        snapshot.counter, counter
                    );
                    return false;
                }
                *counter = snapshot.counter;
                *state = snapshot.state;
                true
            }
        }
    }

    /// Forget everything and buffer again.
    pub fn reset(&mut self) {
        self.state = ReconcileState::Empty {
            buffered: Vec::new(),
        };
    }
}

/// An undecodable payload leaves the state untouched.
fn fold<R: TopicReducer>(reducer: &R, state: &R::State, data: Value) -> R::State {
    match serde_json::from_value::<R::Message>(data) {
        Ok(message) => reducer.reduce(state, message),
        Err(e) => {
            warn!("Skipping topic message with invalid payload: {}", e);
            state.clone()
        }
    }
}

/// Fetches the point-in-time state of a topic.
#[async_trait::async_trait]
pub trait SnapshotSource<S>: Send + Sync + 'static {
    async fn fetch_snapshot(&self, topic: &TopicId) -> anyhow::Result<Snapshot<S>>;
}

/// [`SnapshotSource`] that calls a stream method returning `{state, counter}`.
pub struct MethodSnapshotSource {
    conn: ConnectionManager,
    method: String,
    payload: Value,
}

impl MethodSnapshotSource {
    pub fn new(conn: &ConnectionManager, method: impl Into<String>, payload: Value) -> Self {
        Self {
            conn: conn.clone(),
            method: method.into(),
            payload,
        }
    }
}

#[async_trait::async_trait]
impl<S> SnapshotSource<S> for MethodSnapshotSource
where
    S: DeserializeOwned + Send + 'static,
{
    async fn fetch_snapshot(&self, _topic: &TopicId) -> anyhow::Result<Snapshot<S>> {
        let value = call_unary(&self.conn, &self.method, self.payload.clone()).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Error surfaced by a [`TopicQuery`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("snapshot fetch failed: {0}")]
    Snapshot(String),
    #[error("subscription failed: {0}")]
    Subscribe(String),
    #[error("topic {0} was closed before the query synced")]
    TopicClosed(TopicId),
}

const ERROR_CHANNEL_CAPACITY: usize = 64;

struct QueryState<R: TopicReducer> {
    reconciler: Reconciler<R>,
    epoch: u64,
    finished: bool,
    /// Set once the query can never sync again.
    failure: Option<QueryError>,
    /// A stream start is in progress; restarts requested meanwhile are
    /// deferred until it returns.
    restarting: bool,
    restart_pending: bool,
}

struct QueryShared<R: TopicReducer> {
    topic: TopicId,
    source: Arc<dyn SnapshotSource<R::State>>,
    state: Mutex<QueryState<R>>,
    handle: Mutex<Option<StreamHandle>>,
    view_tx: watch::Sender<Option<Snapshot<R::State>>>,
    errors_tx: broadcast::Sender<QueryError>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Live, reconciled view of one topic.
///
/// Dropping the query closes its subscription.
pub struct TopicQuery<R: TopicReducer> {
    shared: Arc<QueryShared<R>>,
}

impl<R: TopicReducer> TopicQuery<R> {
    /// Subscribe to `topic` and start reconciling.
    ///
    /// Returns as soon as the subscription is queued; use
    /// [`wait_synced`](Self::wait_synced) to wait for the first state.
    pub fn subscribe(
        conn: &ConnectionManager,
        topic: TopicId,
        source: impl SnapshotSource<R::State>,
        reducer: R,
    ) -> Result<Self> {
        let reducer = Arc::new(reducer);
        let (view_tx, _) = watch::channel(None);
        let (errors_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        let shared = Arc::new_cyclic(|weak: &Weak<QueryShared<R>>| {
            let handler = Arc::new(QueryHandler { query: weak.clone() });
            let handle =
                StreamHandle::with_handler(conn, TopicConfig::SUBSCRIBE_METHOD, handler);
            QueryShared {
                topic,
                source: Arc::new(source),
                state: Mutex::new(QueryState {
                    reconciler: Reconciler::new(reducer),
                    epoch: 0,
                    finished: false,
                    failure: None,
                    // Held until the first start returns.
                    restarting: true,
                    restart_pending: false,
                }),
                handle: Mutex::new(Some(handle)),
                view_tx,
                errors_tx,
            }
        });

        let payload = serde_json::to_value(&shared.topic)?;
        let (receipt, epoch, pending) = {
            let slot = lock(&shared.handle);
            let receipt = match slot.as_ref() {
                Some(handle) => handle.start(payload)?,
                None => {
                    return Err(TetherError::Other(format!(
                        "subscription to {} was closed before it started",
                        shared.topic
                    )))
                }
            };
            let pending = shared.end_start();
            let mut state = lock(&shared.state);
            state.epoch += 1;
            (receipt, state.epoch, pending)
        };
        tokio::spawn(complete_epoch(shared.clone(), epoch, receipt));
        if pending {
            // The connection dropped while the first call was being queued.
            shared.restart();
        }

        Ok(Self { shared })
    }

    pub fn topic(&self) -> &TopicId {
        &self.shared.topic
    }

    /// Reconciled state, `None` until a snapshot has been merged.
    pub fn current(&self) -> Option<R::State> {
        lock(&self.shared.state).reconciler.current().cloned()
    }

    pub fn counter(&self) -> Option<u64> {
        lock(&self.shared.state).reconciler.counter()
    }

    /// Watch the synced view. `None` while buffering.
    pub fn watch(&self) -> watch::Receiver<Option<Snapshot<R::State>>> {
        self.shared.view_tx.subscribe()
    }

    /// Errors from the stream, the handler and snapshot fetches.
    pub fn errors(&self) -> broadcast::Receiver<QueryError> {
        self.shared.errors_tx.subscribe()
    }

    /// Wait until the query holds a synced state and return it.
    ///
    /// Fails with the recorded error once the query can no longer sync.
    pub async fn wait_synced(&self) -> std::result::Result<Snapshot<R::State>, QueryError> {
        let mut view = self.watch();
        loop {
            if let Some(snapshot) = view.borrow_and_update().clone() {
                return Ok(snapshot);
            }
            if let Some(failure) = self.failure() {
                return Err(failure);
            }
            // The sender lives as long as `self`, so this only returns on change.
            let _ = view.changed().await;
        }
    }

    /// Why the query stopped trying to sync, if it did.
    pub fn failure(&self) -> Option<QueryError> {
        lock(&self.shared.state).failure.clone()
    }

    /// Whether the publisher closed the topic.
    pub fn is_finished(&self) -> bool {
        lock(&self.shared.state).finished
    }

    /// Close the subscription. The last state stays readable.
    pub fn close(&self) {
        let handle = lock(&self.shared.handle).take();
        if let Some(handle) = handle {
            handle.close();
        }
    }
}

impl<R: TopicReducer> Drop for TopicQuery<R> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<R: TopicReducer> QueryShared<R> {
    fn publish_view(&self, state: &QueryState<R>) {
        self.view_tx.send_replace(state.reconciler.snapshot());
    }

    fn report(&self, error: QueryError) {
        warn!("Topic query {} error: {}", self.topic, error);
        let _ = self.errors_tx.send(error);
    }

    /// Record a terminal failure and wake anyone waiting for a sync.
    fn fail(&self, error: QueryError) {
        {
            let mut state = lock(&self.state);
            if state.failure.is_none() {
                state.failure = Some(error.clone());
            }
            self.publish_view(&state);
        }
        self.report(error);
    }

    /// Whether `epoch` is still the live one and worth more work.
    fn is_current(&self, epoch: u64) -> bool {
        let open = lock(&self.handle).is_some();
        let state = lock(&self.state);
        open && state.epoch == epoch && state.failure.is_none()
    }

    fn ingest(&self, message: PubSubMessage) {
        let mut state = lock(&self.state);
        if state.reconciler.ingest(message) == Ingested::Applied {
            self.publish_view(&state);
        }
    }

    /// Start a new epoch on a fresh stream after a transport break.
    fn restart(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if state.failure.is_some() {
                return;
            }
            if state.restarting {
                state.restart_pending = true;
                return;
            }
            state.restarting = true;
        }

        let mut handle_slot = lock(&self.handle);
        let Some(old) = handle_slot.as_ref() else {
            // Closed by the consumer.
            self.end_start();
            return;
        };
        let fresh = old.clone_with_same_handlers();

        let epoch = {
            let mut state = lock(&self.state);
            state.epoch += 1;
            state.reconciler.reset();
            self.publish_view(&state);
            state.epoch
        };
        debug!("Restarting topic query {} (epoch {})", self.topic, epoch);

        let started = fresh.restart();
        *handle_slot = Some(fresh);
        drop(handle_slot);
        let pending = self.end_start();

        match started {
            Ok(receipt) => {
                tokio::spawn(complete_epoch(self.clone(), epoch, receipt));
                if pending {
                    self.restart();
                }
            }
            // A failed start closes its own stream; that close is not a
            // reason to try again.
            Err(e) => self.fail(QueryError::Subscribe(e.to_string())),
        }
    }

    /// Clear `restarting`; returns whether a restart was deferred meanwhile.
    fn end_start(&self) -> bool {
        let mut state = lock(&self.state);
        state.restarting = false;
        std::mem::take(&mut state.restart_pending)
    }

    fn finish(&self) {
        let synced = {
            let mut state = lock(&self.state);
            state.finished = true;
            state.reconciler.is_synced()
        };
        debug!("Topic {} was closed by its publisher", self.topic);
        if !synced {
            self.fail(QueryError::TopicClosed(self.topic.clone()));
        }
    }
}

/// Backoff between snapshot fetch attempts within one epoch.
fn snapshot_retry_policy() -> ReconnectPolicy {
    ReconnectPolicy::new()
        .with_delay_initial(TopicConfig::SNAPSHOT_RETRY_DELAY_INITIAL)
        .with_delay_max(TopicConfig::SNAPSHOT_RETRY_DELAY_MAX)
}

/// Wait for the subscription to go live, then fetch and merge the snapshot,
/// retrying failed fetches until one lands or the epoch ends.
async fn complete_epoch<R: TopicReducer>(
    shared: Arc<QueryShared<R>>,
    epoch: u64,
    receipt: StartReceipt,
) {
    if let Err(e) = receipt.confirmed().await {
        // A transport break already moved on to a new epoch.
        if shared.is_current(epoch) {
            shared.fail(QueryError::Subscribe(e.to_string()));
        }
        return;
    }

    let mut backoff = ReconnectBackoff::new(&snapshot_retry_policy());
    loop {
        let fetched = shared.source.fetch_snapshot(&shared.topic).await;

        {
            let mut state = lock(&shared.state);
            if state.epoch != epoch {
                debug!(
                    "Discarding snapshot of {} from epoch {} (now {})",
                    shared.topic, epoch, state.epoch
                );
                return;
            }
            match fetched {
                Ok(snapshot) => {
                    if state.reconciler.apply_snapshot(snapshot) {
                        shared.publish_view(&state);
                    }
                    return;
                }
                Err(e) => {
                    drop(state);
                    shared.report(QueryError::Snapshot(format!("{:#}", e)));
                }
            }
        }

        tokio::time::sleep(backoff.next_duration()).await;
        if !shared.is_current(epoch) {
            return;
        }
        debug!("Retrying snapshot of {} (epoch {})", shared.topic, epoch);
    }
}

struct QueryHandler<R: TopicReducer> {
    query: Weak<QueryShared<R>>,
}

impl<R: TopicReducer> StreamHandler for QueryHandler<R> {
    fn on_message(&self, frame: InboundFrame) -> anyhow::Result<()> {
        if frame.kind != FrameKind::MethodOutput {
            return Ok(());
        }
        let Some(query) = self.query.upgrade() else {
            return Ok(());
        };
        let message: PubSubMessage = serde_json::from_value(frame.data)?;
        query.ingest(message);
        Ok(())
    }

    fn on_error(&self, error: StreamError) {
        if let Some(query) = self.query.upgrade() {
            query.report(QueryError::Stream(error));
        }
    }

    fn on_close(&self, cause: CloseCause) {
        let Some(query) = self.query.upgrade() else {
            return;
        };
        match cause {
            CloseCause::WebsocketClosed => query.restart(),
            CloseCause::MethodDone => query.finish(),
            CloseCause::CalledCloseMethod => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Counter {
        count: i64,
    }

    #[derive(Deserialize)]
    struct Add {
        add: i64,
    }

    fn reconciler() -> Reconciler<impl TopicReducer<State = Counter>> {
        Reconciler::new(Arc::new(FnReducer::new(|state: &Counter, msg: Add| Counter {
            count: state.count + msg.add,
        })))
    }

    fn msg(id: u64, add: i64) -> PubSubMessage {
        PubSubMessage {
            message_id: id,
            data: json!({"add": add}),
        }
    }

    fn snapshot(count: i64, counter: u64) -> Snapshot<Counter> {
        Snapshot {
            state: Counter { count },
            counter,
        }
    }

    #[test]
    fn test_snapshot_then_messages() {
        let mut rec = reconciler();
        assert!(rec.apply_snapshot(snapshot(1, 1)));
        assert_eq!(rec.ingest(msg(2, 1)), Ingested::Applied);
        assert_eq!(rec.ingest(msg(3, 1)), Ingested::Applied);

        assert_eq!(rec.counter(), Some(3));
        assert_eq!(rec.current(), Some(&Counter { count: 3 }));
    }

    #[test]
    fn test_messages_buffered_before_snapshot() {
        let mut rec = reconciler();
        assert_eq!(rec.ingest(msg(1, 1)), Ingested::Buffered);
        assert_eq!(rec.ingest(msg(2, 1)), Ingested::Buffered);
        assert_eq!(rec.ingest(msg(3, 1)), Ingested::Buffered);
        assert_eq!(rec.current(), None);

        // Snapshot already reflects message 1.
        assert!(rec.apply_snapshot(snapshot(1, 1)));
        assert_eq!(rec.counter(), Some(3));
        assert_eq!(rec.current(), Some(&Counter { count: 3 }));
    }

    #[test]
    fn test_every_interleaving_converges() {
        // Publisher history: count starts at 0, messages 1..=4 each add 1.
        // The snapshot may be taken after any prefix, and live delivery may
        // start at any message, as long as the subscription predates the
        // snapshot.
        for snap_at in 0..=4u64 {
            for sub_from in 1..=(snap_at + 1) {
                for arrive_before in 0..=(5 - sub_from) {
                    let mut rec = reconciler();
                    let live: Vec<u64> = (sub_from..=4).collect();
                    let (early, late) = live.split_at(arrive_before.min(live.len() as u64) as usize);

                    for id in early {
                        rec.ingest(msg(*id, 1));
                    }
                    rec.apply_snapshot(snapshot(snap_at as i64, snap_at));
                    for id in late {
                        rec.ingest(msg(*id, 1));
                    }

                    assert_eq!(rec.counter(), Some(4), "snap_at={snap_at} sub_from={sub_from}");
                    assert_eq!(rec.current(), Some(&Counter { count: 4 }));
                }
            }
        }
    }

    #[test]
    fn test_counter_never_decreases() {
        let mut rec = reconciler();
        rec.apply_snapshot(snapshot(5, 5));
        assert!(!rec.apply_snapshot(snapshot(3, 3)));
        assert_eq!(rec.counter(), Some(5));

        assert_eq!(rec.ingest(msg(5, 1)), Ingested::Duplicate);
        assert_eq!(rec.ingest(msg(4, 1)), Ingested::Duplicate);
        assert_eq!(rec.current(), Some(&Counter { count: 5 }));

        assert!(rec.apply_snapshot(snapshot(9, 7)));
        assert_eq!(rec.counter(), Some(7));
    }

    #[test]
    fn test_out_of_order_while_buffering() {
        let mut rec = reconciler();
        rec.ingest(msg(3, 1));
        assert_eq!(rec.ingest(msg(2, 1)), Ingested::OutOfOrder);
        rec.apply_snapshot(snapshot(0, 0));
        assert_eq!(rec.counter(), Some(3));
        assert_eq!(rec.current(), Some(&Counter { count: 1 }));
    }

    #[test]
    fn test_invalid_payload_advances_counter() {
        let mut rec = reconciler();
        rec.apply_snapshot(snapshot(0, 0));
        rec.ingest(PubSubMessage {
            message_id: 1,
            data: json!("garbage"),
        });
        assert_eq!(rec.counter(), Some(1));
        assert_eq!(rec.current(), Some(&Counter { count: 0 }));
    }

    #[test]
    fn test_reset_returns_to_empty() {
        let mut rec = reconciler();
        rec.apply_snapshot(snapshot(2, 2));
        rec.reset();
        assert!(!rec.is_synced());
        assert_eq!(
            rec.state(),
            &ReconcileState::Empty {
                buffered: Vec::new()
            }
        );
    }
}
