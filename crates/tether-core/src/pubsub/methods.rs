//! Stream methods exposing a [`TopicRegistry`] to clients.

use super::registry::TopicRegistry;
use crate::config::TopicConfig;
use crate::ids::TopicId;
use crate::ipc::{StreamMethod, StreamSink};
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// `SubscribeTopic {category, key}`: streams every message of a topic as
/// `{messageId, data}` until the topic closes.
///
/// `methodStarted` is sent only once the subscription is registered, so a
/// client that fetches a snapshot after confirmation cannot miss messages.
pub struct SubscribeTopicMethod {
    registry: TopicRegistry,
}

impl SubscribeTopicMethod {
    pub fn new(registry: TopicRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl StreamMethod for SubscribeTopicMethod {
    fn name(&self) -> &str {
        TopicConfig::SUBSCRIBE_METHOD
    }

    fn announces_start(&self) -> bool {
        true
    }

    async fn run(&self, input: Value, sink: StreamSink) -> anyhow::Result<()> {
        let topic: TopicId =
            serde_json::from_value(input).context("SubscribeTopic expects {category, key}")?;
        let mut subscription = self.registry.subscribe(&topic)?;
        sink.started();
        debug!("Client subscribed to {} ({})", topic, sink.id());

        loop {
            tokio::select! {
                message = subscription.recv() => match message {
                    Some(message) => sink.send(&message)?,
                    None => return Ok(()),
                },
                _ = sink.closed() => return Ok(()),
            }
        }
    }
}

/// `GetTopics {}`: one output with the bookkeeping of every topic.
pub struct GetTopicsMethod {
    registry: TopicRegistry,
}

impl GetTopicsMethod {
    pub fn new(registry: TopicRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl StreamMethod for GetTopicsMethod {
    fn name(&self) -> &str {
        "GetTopics"
    }

    async fn run(&self, _input: Value, sink: StreamSink) -> anyhow::Result<()> {
        sink.send(&self.registry.topic_info())?;
        Ok(())
    }
}

/// `CreateTopic {category, key}`: one output with the new topic's info.
pub struct CreateTopicMethod {
    registry: TopicRegistry,
}

impl CreateTopicMethod {
    pub fn new(registry: TopicRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl StreamMethod for CreateTopicMethod {
    fn name(&self) -> &str {
        "CreateTopic"
    }

    async fn run(&self, input: Value, sink: StreamSink) -> anyhow::Result<()> {
        let topic: TopicId =
            serde_json::from_value(input).context("CreateTopic expects {category, key}")?;
        let created = self.registry.create_topic(topic)?;
        sink.send(&created.info())?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct PublishInput {
    #[serde(flatten)]
    topic: TopicId,
    data: Value,
}

/// `PublishTopic {category, key, data}`: one output `{messageId}`.
pub struct PublishTopicMethod {
    registry: TopicRegistry,
}

impl PublishTopicMethod {
    pub fn new(registry: TopicRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl StreamMethod for PublishTopicMethod {
    fn name(&self) -> &str {
        "PublishTopic"
    }

    async fn run(&self, input: Value, sink: StreamSink) -> anyhow::Result<()> {
        let input: PublishInput =
            serde_json::from_value(input).context("PublishTopic expects {category, key, data}")?;
        if input.topic.is_reserved() {
            anyhow::bail!("topic {} is reserved", input.topic);
        }
        let topic = self
            .registry
            .topic(&input.topic)
            .ok_or_else(|| anyhow::anyhow!("Topic does not exist: {}", input.topic))?;
        let message_id = topic.publish(input.data)?;
        sink.send(&json!({ "messageId": message_id }))?;
        Ok(())
    }
}
