//! Identifiers shared by the transport and the pub/sub layer.

use crate::config::TopicConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-unique token tying a `call` frame to its response frames.
///
/// Rendered as `<method>-<uuid>` so ids stay readable in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh id for a call to `method`.
    pub fn generate(method: &str) -> Self {
        Self(format!("{}-{}", method, uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a publish channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId {
    pub category: String,
    pub key: String,
}

impl TopicId {
    pub fn new(category: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            key: key.into(),
        }
    }

    /// The registry's own lifecycle topic.
    pub fn meta() -> Self {
        Self::new(TopicConfig::META_CATEGORY, TopicConfig::META_KEY)
    }

    /// Whether the category belongs to the registry rather than applications.
    pub fn is_reserved(&self) -> bool {
        self.category
            .starts_with(TopicConfig::RESERVED_CATEGORY_PREFIX)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique_per_call() {
        let a = CorrelationId::generate("SubscribeTopic");
        let b = CorrelationId::generate("SubscribeTopic");

        assert_ne!(a, b);
        assert!(a.as_str().starts_with("SubscribeTopic-"));
    }

    #[test]
    fn test_topic_display_and_reserved() {
        let topic = TopicId::new("app/pogo", "db");
        assert_eq!(topic.to_string(), "app/pogo/db");
        assert!(!topic.is_reserved());
        assert!(TopicId::meta().is_reserved());
    }

    #[test]
    fn test_topic_id_wire_shape() {
        let json = serde_json::to_value(TopicId::new("logs", "app")).unwrap();
        assert_eq!(json, serde_json::json!({"category": "logs", "key": "app"}));
    }
}
