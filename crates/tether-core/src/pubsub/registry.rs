//! Publisher side of pub/sub.
//!
//! Every topic numbers its messages from 1, incrementing by one per publish.
//! Closing a topic ends its subscribers' channels and announces the close on
//! the registry's meta topic (`/topics/meta`).

use crate::ids::TopicId;
use crate::ipc::PubSubMessage;
use crate::{Result, TetherError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Snapshot of a topic's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicInfo {
    pub id: TopicId,
    pub closed: bool,
    pub count: u64,
    pub subscriber_count: usize,
}

/// Event published on the meta topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum MetaEvent {
    Create(TopicId),
    Close(TopicId),
}

struct TopicInner {
    counter: u64,
    closed: bool,
    subscribers: Vec<(u64, mpsc::UnboundedSender<PubSubMessage>)>,
}

/// One named, ordered publish channel.
pub struct Topic {
    id: TopicId,
    meta: Option<Arc<Topic>>,
    next_subscriber: AtomicU64,
    inner: Mutex<TopicInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Topic {
    fn new(id: TopicId, meta: Option<Arc<Topic>>) -> Self {
        Self {
            id,
            meta,
            next_subscriber: AtomicU64::new(1),
            inner: Mutex::new(TopicInner {
                counter: 0,
                closed: false,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> &TopicId {
        &self.id
    }

    /// Publish `data` to every subscriber and return its message id.
    pub fn publish(&self, data: Value) -> Result<u64> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(TetherError::TopicClosed {
                topic: self.id.to_string(),
            });
        }

        inner.counter += 1;
        let message = PubSubMessage {
            message_id: inner.counter,
            data,
        };
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(message.clone()).is_ok());

        Ok(message.message_id)
    }

    /// Serialize `value` and publish it.
    pub fn publish_json<T: Serialize>(&self, value: &T) -> Result<u64> {
        self.publish(serde_json::to_value(value)?)
    }

    /// Close the topic. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return;
            }
            inner.closed = true;
            // Dropping the senders ends every subscription stream.
            inner.subscribers.clear();
        }
        debug!("Closed topic {}", self.id);

        if let Some(meta) = &self.meta {
            if let Err(e) = meta.publish_json(&MetaEvent::Close(self.id.clone())) {
                warn!("Failed to announce close of {}: {}", self.id, e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Id of the last published message, 0 if none.
    pub fn counter(&self) -> u64 {
        lock(&self.inner).counter
    }

    pub fn info(&self) -> TopicInfo {
        let inner = lock(&self.inner);
        TopicInfo {
            id: self.id.clone(),
            closed: inner.closed,
            count: inner.counter,
            subscriber_count: inner.subscribers.len(),
        }
    }

    fn subscribe(self: &Arc<Self>) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return Err(TetherError::TopicClosed {
                    topic: self.id.to_string(),
                });
            }
            inner.subscribers.push((key, tx));
        }
        Ok(Subscription {
            topic: self.clone(),
            key,
            rx,
        })
    }

    fn unsubscribe(&self, key: u64) {
        lock(&self.inner).subscribers.retain(|(k, _)| *k != key);
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic").field("info", &self.info()).finish()
    }
}

/// Live feed of one topic. Unsubscribes on drop.
pub struct Subscription {
    topic: Arc<Topic>,
    key: u64,
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
}

impl Subscription {
    pub fn topic_id(&self) -> &TopicId {
        self.topic.id()
    }

    /// Next message, or `None` once the topic closed.
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.topic.unsubscribe(self.key);
    }
}

struct RegistryInner {
    meta: Arc<Topic>,
    topics: Mutex<HashMap<TopicId, Arc<Topic>>>,
}

/// Cloneable registry of topics.
#[derive(Clone)]
pub struct TopicRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        let meta = Arc::new(Topic::new(TopicId::meta(), None));
        let mut topics = HashMap::new();
        topics.insert(meta.id().clone(), meta.clone());
        Self {
            inner: Arc::new(RegistryInner {
                meta,
                topics: Mutex::new(topics),
            }),
        }
    }

    /// The registry's lifecycle topic.
    pub fn meta_topic(&self) -> Arc<Topic> {
        self.inner.meta.clone()
    }

    /// Create a topic. A closed topic with the same id may be replaced.
    pub fn create_topic(&self, id: TopicId) -> Result<Arc<Topic>> {
        if id.is_reserved() {
            return Err(TetherError::Validation {
                field: "category".to_string(),
                message: format!("'{}' is reserved for the topic registry", id.category),
            });
        }

        let topic = {
            let mut topics = lock(&self.inner.topics);
            if let Some(existing) = topics.get(&id) {
                if !existing.is_closed() {
                    return Err(TetherError::TopicExists {
                        topic: id.to_string(),
                    });
                }
            }
            let topic = Arc::new(Topic::new(id.clone(), Some(self.inner.meta.clone())));
            topics.insert(id.clone(), topic.clone());
            topic
        };

        debug!("Created topic {}", id);
        if let Err(e) = self.inner.meta.publish_json(&MetaEvent::Create(id.clone())) {
            warn!("Failed to announce topic {}: {}", id, e);
        }
        Ok(topic)
    }

    pub fn topic(&self, id: &TopicId) -> Option<Arc<Topic>> {
        lock(&self.inner.topics).get(id).cloned()
    }

    /// Subscribe to a live topic.
    pub fn subscribe(&self, id: &TopicId) -> Result<Subscription> {
        let topic = self.topic(id).ok_or_else(|| TetherError::TopicNotFound {
            topic: id.to_string(),
        })?;
        topic.subscribe()
    }

    /// Ids of every known topic, sorted.
    pub fn topics(&self) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = lock(&self.inner.topics).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Bookkeeping of every known topic, keyed by `category/key`.
    pub fn topic_info(&self) -> BTreeMap<String, TopicInfo> {
        lock(&self.inner.topics)
            .values()
            .map(|topic| (topic.id().to_string(), topic.info()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_message_ids_start_at_one() {
        let registry = TopicRegistry::new();
        let topic = registry.create_topic(TopicId::new("app", "counter")).unwrap();
        let mut sub = registry.subscribe(topic.id()).unwrap();

        assert_eq!(topic.publish(json!("a")).unwrap(), 1);
        assert_eq!(topic.publish(json!("b")).unwrap(), 2);

        assert_eq!(sub.recv().await.unwrap().message_id, 1);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.message_id, 2);
        assert_eq!(second.data, json!("b"));
    }

    #[tokio::test]
    async fn test_close_ends_subscription_and_notifies_meta() {
        let registry = TopicRegistry::new();
        let id = TopicId::new("app", "logs");
        let topic = registry.create_topic(id.clone()).unwrap();
        let mut meta = registry.subscribe(&TopicId::meta()).unwrap();
        let mut sub = registry.subscribe(&id).unwrap();

        topic.close();
        topic.close();

        assert!(sub.recv().await.is_none());
        let event = meta.recv().await.unwrap();
        assert_eq!(event.data, json!({"kind": "close", "data": {"category": "app", "key": "logs"}}));
        assert!(matches!(
            topic.publish(json!(1)),
            Err(TetherError::TopicClosed { .. })
        ));
    }

    #[test]
    fn test_reserved_and_duplicate_topics_rejected() {
        let registry = TopicRegistry::new();
        assert!(matches!(
            registry.create_topic(TopicId::new("/topics/x", "y")),
            Err(TetherError::Validation { .. })
        ));

        let id = TopicId::new("app", "db");
        let first = registry.create_topic(id.clone()).unwrap();
        assert!(matches!(
            registry.create_topic(id.clone()),
            Err(TetherError::TopicExists { .. })
        ));

        first.close();
        let second = registry.create_topic(id.clone()).unwrap();
        assert_eq!(second.counter(), 0);
    }

    #[test]
    fn test_subscribe_unknown_topic() {
        let registry = TopicRegistry::new();
        assert!(matches!(
            registry.subscribe(&TopicId::new("nope", "nope")),
            Err(TetherError::TopicNotFound { .. })
        ));
    }

    #[test]
    fn test_topic_info_tracks_subscribers() {
        let registry = TopicRegistry::new();
        let id = TopicId::new("app", "state");
        let topic = registry.create_topic(id.clone()).unwrap();
        let sub = registry.subscribe(&id).unwrap();
        topic.publish(json!(null)).unwrap();

        let info = &registry.topic_info()["app/state"];
        assert_eq!(info.count, 1);
        assert_eq!(info.subscriber_count, 1);

        drop(sub);
        assert_eq!(topic.info().subscriber_count, 0);
        assert_eq!(registry.topics(), vec![TopicId::meta(), id]);
    }
}
