// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Kafka client construction and the producer-side publisher.
//!
//! Services never build rdkafka clients themselves: they receive a [`KafkaFactory`] so tests can
//! substitute in-memory fakes for the publisher and the admin client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::AdminClient;
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, warn};

use crate::errors::QueueError;
use crate::topic_admin::{KafkaTopicAdmin, TopicAdmin};

const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishes one message and waits for the broker acknowledgement.
#[async_trait]
pub trait SyncProducer: Send + Sync {
    /// Returns the partition and offset the message landed on.
    async fn send_message(&self, topic: &str, payload: Vec<u8>) -> Result<(i32, i64), QueueError>;

    fn close(&self);
}

#[async_trait]
pub trait KafkaFactory: Send + Sync {
    async fn make_sync_producer(&self) -> Result<Arc<dyn SyncProducer>, QueueError>;

    async fn make_kafka_admin(&self) -> Result<Arc<dyn TopicAdmin>, QueueError>;
}

pub struct KafkaSyncProducer {
    producer: FutureProducer,
    message_timeout: Duration,
}

impl KafkaSyncProducer {
    pub fn new(producer: FutureProducer, message_timeout: Duration) -> Self {
        KafkaSyncProducer {
            producer,
            message_timeout,
        }
    }
}

#[async_trait]
impl SyncProducer for KafkaSyncProducer {
    async fn send_message(&self, topic: &str, payload: Vec<u8>) -> Result<(i32, i64), QueueError> {
        let record = FutureRecord::<(), Vec<u8>>::to(topic).payload(&payload);
        self.producer
            .send(record, Timeout::After(self.message_timeout))
            .await
            .map_err(|(err, _)| QueueError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn close(&self) {
        if let Err(e) = self.producer.flush(Timeout::After(self.message_timeout)) {
            error!("Failed to flush kafka producer on close: {e}");
        }
    }
}

/// Builds rdkafka clients, probing broker metadata to confirm connectivity. A failed probe is
/// retried `max_retry` times, `retry_interval` apart.
#[derive(Debug, Clone)]
pub struct RdKafkaFactory {
    brokers: Vec<String>,
    max_retry: u32,
    retry_interval: Duration,
    message_timeout: Duration,
    metadata_timeout: Duration,
}

impl RdKafkaFactory {
    pub fn new(brokers: Vec<String>, max_retry: u32, retry_interval: Duration) -> Self {
        RdKafkaFactory {
            brokers,
            max_retry,
            retry_interval,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("message.timeout.ms", self.message_timeout.as_millis().to_string())
            .set("acks", "all");
        config
    }

    async fn connect<T, F>(&self, what: &str, make: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: Fn(ClientConfig) -> Result<T, QueueError> + Clone + Send + 'static,
    {
        let attempts = self.max_retry.max(1);
        for attempt in 1..=attempts {
            let make = make.clone();
            let config = self.client_config();
            match tokio::task::spawn_blocking(move || make(config)).await {
                Ok(Ok(client)) => {
                    debug!("Connected {what} to kafka on attempt {attempt}");
                    return Ok(client);
                }
                Ok(Err(e)) => warn!("Cannot connect {what} to kafka ({attempt}/{attempts}): {e}"),
                Err(e) => warn!("Kafka {what} connection task failed ({attempt}/{attempts}): {e}"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
        Err(QueueError::RetryLimitReached)
    }
}

#[async_trait]
impl KafkaFactory for RdKafkaFactory {
    async fn make_sync_producer(&self) -> Result<Arc<dyn SyncProducer>, QueueError> {
        let metadata_timeout = self.metadata_timeout;
        let producer = self
            .connect("producer", move |config| {
                let producer: FutureProducer = config.create()?;
                producer.client().fetch_metadata(None, metadata_timeout)?;
                Ok(producer)
            })
            .await?;
        Ok(Arc::new(KafkaSyncProducer::new(
            producer,
            self.message_timeout,
        )))
    }

    async fn make_kafka_admin(&self) -> Result<Arc<dyn TopicAdmin>, QueueError> {
        let metadata_timeout = self.metadata_timeout;
        let (client, topics) = self
            .connect("admin", move |config| {
                let client: AdminClient<DefaultClientContext> = config.create()?;
                let metadata = client.inner().fetch_metadata(None, metadata_timeout)?;
                let topics = metadata
                    .topics()
                    .iter()
                    .map(|topic| topic.name().to_string())
                    .collect::<Vec<_>>();
                Ok((client, topics))
            })
            .await?;
        Ok(Arc::new(KafkaTopicAdmin::new(
            client,
            topics,
            self.metadata_timeout,
        )))
    }
}
