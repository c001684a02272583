//! Messaging source for the secondary ingestion path
//!
//! Producers publish encoded metric batches to partition topics
//! (`partition = i mod partitions`); the messaging processor consumes them.
//! The message bus itself is a collaborator.

pub mod codec;
mod memory;

pub use memory::InMemoryMessagingService;

use crate::table::SYSTEM_NAMESPACE;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// A messaging topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicId {
    pub namespace: String,
    pub topic: String,
}

impl TopicId {
    pub fn new(namespace: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
        }
    }

    pub fn system(topic: impl Into<String>) -> Self {
        Self::new(SYSTEM_NAMESPACE, topic)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.topic)
    }
}

/// A fetched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Position in the topic, increasing from 0
    pub offset: u64,
    pub payload: Bytes,
}

#[async_trait]
pub trait MessagingService: Send + Sync {
    async fn topic_exists(&self, topic: &TopicId) -> Result<bool>;

    /// Append a payload, returning its offset
    async fn publish(&self, topic: &TopicId, payload: Bytes) -> Result<u64>;

    /// Up to `limit` messages with offsets greater than `after`, or from the
    /// start of the topic when `after` is `None`
    async fn fetch(
        &self,
        topic: &TopicId,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>>;
}
