// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Topic administration for the producer.
//!
//! Creating a topic is a comparatively slow administrative round trip, so the set of topics
//! known to exist is cached in a [`TopicRegistry`]. Only a registry miss triggers creation, and
//! a topic is added only after the broker confirmed its creation. The registry is append-only:
//! topics deleted externally stay registered until the process restarts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication, TopicResult};
use rdkafka::client::DefaultClientContext;
use tracing::{debug, info};

use crate::errors::QueueError;

#[async_trait]
pub trait TopicAdmin: Send + Sync {
    fn exist(&self, topic: &str) -> bool;

    /// Creates `topic` on the broker. Failures are returned as-is, including the race where
    /// another producer created it first.
    async fn create_topic(
        &self,
        topic: &str,
        partitions: i32,
        replication_factor: i32,
    ) -> Result<(), QueueError>;

    /// Marks `topic` as existing. Only call after a successful [`TopicAdmin::create_topic`].
    fn add_topic(&self, topic: &str);

    /// Releases the admin client. Later creations fail with [`QueueError::Closed`].
    fn close(&self);
}

/// Set of topic names known to exist, shared by every concurrent produce call.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: RwLock<HashSet<String>>,
}

impl TopicRegistry {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TopicRegistry {
            topics: RwLock::new(topics.into_iter().map(Into::into).collect()),
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic)
    }

    /// Returns false if the topic was already registered.
    pub fn insert(&self, topic: &str) -> bool {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string())
    }

    pub fn len(&self) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`TopicAdmin`] backed by the rdkafka admin API.
pub struct KafkaTopicAdmin {
    client: Mutex<Option<Arc<AdminClient<DefaultClientContext>>>>,
    registry: TopicRegistry,
    operation_timeout: Duration,
}

impl KafkaTopicAdmin {
    /// `known_topics` seeds the registry, typically from the broker metadata fetched while
    /// connecting.
    pub fn new(
        client: AdminClient<DefaultClientContext>,
        known_topics: Vec<String>,
        operation_timeout: Duration,
    ) -> Self {
        debug!("Topic registry seeded with {} topics", known_topics.len());
        KafkaTopicAdmin {
            client: Mutex::new(Some(Arc::new(client))),
            registry: TopicRegistry::new(known_topics),
            operation_timeout,
        }
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    fn exist(&self, topic: &str) -> bool {
        self.registry.contains(topic)
    }

    async fn create_topic(
        &self,
        topic: &str,
        partitions: i32,
        replication_factor: i32,
    ) -> Result<(), QueueError> {
        let new_topic = NewTopic::new(
            topic,
            partitions,
            TopicReplication::Fixed(replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.operation_timeout));

        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(QueueError::Closed)?;
        let results = client.create_topics([&new_topic], &options).await?;
        creation_outcome(results)?;

        info!("Created topic {topic} with {partitions} partitions, replication factor {replication_factor}");
        Ok(())
    }

    fn add_topic(&self, topic: &str) {
        self.registry.insert(topic);
    }

    fn close(&self) {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if client.is_some() {
            debug!("Closing kafka admin with {} known topics", self.registry.len());
        }
    }
}

/// First per-topic failure of a creation request, with the broker's error code intact.
fn creation_outcome(results: Vec<TopicResult>) -> Result<(), QueueError> {
    for result in results {
        if let Err((topic, code)) = result {
            return Err(QueueError::TopicCreation { topic, code });
        }
    }
    Ok(())
}
