// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Admission and routing of timbers into Kafka.
//!
//! Each timber goes through the same path: rate-limit check, topic resolution (creating the
//! topic on a registry miss), then a publish that waits for the broker acknowledgement. Locks
//! guarding the registry and the rate windows are only held for the in-memory mutation, never
//! across the admin or publish calls.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::errors::ProduceError;
use crate::kafka::SyncProducer;
use crate::metrics::ThroughputCounter;
use crate::rate_limiter::RateLimiter;
use crate::timber::{ProduceResult, Timber, TimberCollection};
use crate::topic_admin::TopicAdmin;

/// Routing settings of a [`ProducerService`].
#[derive(Debug, Clone)]
pub struct ProducerServiceConfig {
    pub topic_suffix: String,
    pub new_event_topic: Option<String>,
    pub default_partitions: i32,
    pub default_replication_factor: i32,
}

impl Default for ProducerServiceConfig {
    fn default() -> Self {
        Self {
            topic_suffix: "_logs".to_string(),
            new_event_topic: None,
            default_partitions: 1,
            default_replication_factor: 1,
        }
    }
}

pub struct ProducerService {
    config: ProducerServiceConfig,
    producer: Arc<dyn SyncProducer>,
    admin: Arc<dyn TopicAdmin>,
    limiter: Arc<dyn RateLimiter>,
    counter: Option<Arc<ThroughputCounter>>,
}

impl ProducerService {
    pub fn new(
        config: ProducerServiceConfig,
        producer: Arc<dyn SyncProducer>,
        admin: Arc<dyn TopicAdmin>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        ProducerService {
            config,
            producer,
            admin,
            limiter,
            counter: None,
        }
    }

    #[must_use]
    pub fn with_counter(mut self, counter: Arc<ThroughputCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Releases the kafka clients.
    pub fn close(&self) {
        self.admin.close();
        self.producer.close();
    }

    pub async fn produce(&self, timber: &Timber) -> Result<ProduceResult, ProduceError> {
        self.handle_produce(timber).await
    }

    /// Items are produced one after the other. The first failure is returned and the remaining
    /// items are not attempted; items already published stay published. On success the result
    /// carries the topic of the last item.
    pub async fn produce_batch(
        &self,
        collection: &TimberCollection,
    ) -> Result<ProduceResult, ProduceError> {
        let mut result = ProduceResult::default();
        for timber in &collection.items {
            result = self.handle_produce(timber).await?;
        }
        debug!(
            "Produced batch of {} timbers, last topic {}",
            collection.items.len(),
            result.topic
        );
        Ok(result)
    }

    async fn handle_produce(&self, timber: &Timber) -> Result<ProduceResult, ProduceError> {
        let topic = timber.topic_name(&self.config.topic_suffix);

        if self
            .limiter
            .is_hit_limit(&topic, timber.context.app_max_tps)
        {
            return Err(ProduceError::RateLimitExceeded);
        }

        if !self.admin.exist(&topic) {
            self.create_topic(&topic, timber).await?;
        }

        let payload = timber
            .to_bytes()
            .map_err(|e| ProduceError::Store(e.into()))?;
        self.producer
            .send_message(&topic, payload)
            .await
            .map_err(ProduceError::Store)?;

        if let Some(counter) = &self.counter {
            counter.incr(&timber.context.kafka_topic, 1);
        }

        Ok(ProduceResult { topic })
    }

    async fn create_topic(&self, topic: &str, timber: &Timber) -> Result<(), ProduceError> {
        let partitions = match timber.context.kafka_partition {
            0 => self.config.default_partitions,
            partitions => partitions,
        };
        let replication_factor = match timber.context.kafka_replication_factor {
            0 => self.config.default_replication_factor,
            replication_factor => replication_factor,
        };

        self.admin
            .create_topic(topic, partitions, replication_factor)
            .await
            .map_err(ProduceError::TopicCreation)?;
        self.admin.add_topic(topic);
        info!("Topic {topic} created and registered");

        self.announce_new_topic(topic).await;
        Ok(())
    }

    /// Tells consumers of the new-topic event stream that `topic` exists. Best effort: the topic
    /// is already created and registered, so a failure here does not fail the produce call.
    async fn announce_new_topic(&self, topic: &str) {
        let Some(event_topic) = &self.config.new_event_topic else {
            return;
        };
        if let Err(e) = self
            .producer
            .send_message(event_topic, topic.as_bytes().to_vec())
            .await
        {
            error!("Failed to announce new topic {topic} on {event_topic}: {e}");
        }
    }
}
