//! In-memory message bus for standalone mode and testing

use super::{Message, MessagingService, TopicId};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct InMemoryMessagingService {
    topics: DashMap<TopicId, Arc<RwLock<Vec<Bytes>>>>,
}

impl InMemoryMessagingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic; existing topics are left untouched
    pub fn create_topic(&self, topic: TopicId) {
        self.topics.entry(topic).or_default();
    }

    /// Remove a topic and its messages
    pub fn delete_topic(&self, topic: &TopicId) -> bool {
        self.topics.remove(topic).is_some()
    }

    fn log(&self, topic: &TopicId) -> Result<Arc<RwLock<Vec<Bytes>>>> {
        self.topics
            .get(topic)
            .map(|log| Arc::clone(log.value()))
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))
    }
}

#[async_trait]
impl MessagingService for InMemoryMessagingService {
    async fn topic_exists(&self, topic: &TopicId) -> Result<bool> {
        Ok(self.topics.contains_key(topic))
    }

    async fn publish(&self, topic: &TopicId, payload: Bytes) -> Result<u64> {
        let log = self.log(topic)?;
        let mut log = log.write();
        log.push(payload);
        Ok(log.len() as u64 - 1)
    }

    async fn fetch(
        &self,
        topic: &TopicId,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let log = self.log(topic)?;
        let log = log.read();
        let start = after.map_or(0, |offset| offset as usize + 1);
        Ok(log
            .iter()
            .enumerate()
            .skip(start)
            .take(limit)
            .map(|(offset, payload)| Message {
                offset: offset as u64,
                payload: payload.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_fetch_after_offset() {
        let bus = InMemoryMessagingService::new();
        let topic = TopicId::system("metrics0");
        bus.create_topic(topic.clone());

        for i in 0..5u8 {
            assert_eq!(bus.publish(&topic, Bytes::from(vec![i])).await.unwrap(), i as u64);
        }

        let first = bus.fetch(&topic, None, 2).await.unwrap();
        assert_eq!(first.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![0, 1]);

        let rest = bus.fetch(&topic, Some(1), 10).await.unwrap();
        assert_eq!(rest.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert!(bus.fetch(&topic, Some(4), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_topic() {
        let bus = InMemoryMessagingService::new();
        let topic = TopicId::system("absent");
        assert!(!bus.topic_exists(&topic).await.unwrap());
        assert!(matches!(
            bus.publish(&topic, Bytes::new()).await,
            Err(Error::TopicNotFound(_))
        ));
    }
}
