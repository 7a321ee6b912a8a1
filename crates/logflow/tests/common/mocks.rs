// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory fakes of the Kafka and Elasticsearch collaborators

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use logflow::elastic::Store;
use logflow::errors::{QueueError, SinkError};
use logflow::kafka::{KafkaFactory, SyncProducer};
use logflow::kafka_consumer::{ConsumerStreams, GroupConsumer, Notification, QueueMessage};
use logflow::rate_limiter::RateLimiter;
use logflow::timber::Timber;
use logflow::topic_admin::{TopicAdmin, TopicRegistry};
use rdkafka::types::RDKafkaErrorCode;

/// Rate limiter with a fixed answer
#[derive(Default)]
pub struct DummyRateLimiter {
    pub hit_limit: bool,
    started: AtomicBool,
    pub checks: AtomicUsize,
}

impl DummyRateLimiter {
    pub fn limited() -> Self {
        DummyRateLimiter {
            hit_limit: true,
            ..Default::default()
        }
    }
}

impl RateLimiter for DummyRateLimiter {
    fn is_hit_limit(&self, _key: &str, _max_tokens: u32) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.hit_limit
    }

    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn is_start(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }
}

/// Topic admin backed by an in-memory registry, recording every call
#[derive(Default)]
pub struct MockTopicAdmin {
    registry: TopicRegistry,
    pub fail_create: AtomicBool,
    pub created: Mutex<Vec<(String, i32, i32)>>,
    pub added: Mutex<Vec<String>>,
    pub exist_calls: AtomicUsize,
    pub closed: AtomicBool,
}

impl MockTopicAdmin {
    pub fn with_topics(topics: &[&str]) -> Self {
        MockTopicAdmin {
            registry: TopicRegistry::new(topics.iter().copied()),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        let admin = MockTopicAdmin::default();
        admin.fail_create.store(true, Ordering::SeqCst);
        admin
    }

    pub fn created_topics(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _, _)| topic.clone())
            .collect()
    }

    pub fn added_topics(&self) -> Vec<String> {
        self.added.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.exist_calls.load(Ordering::SeqCst)
            + self.created.lock().unwrap().len()
            + self.added.lock().unwrap().len()
    }
}

#[async_trait]
impl TopicAdmin for MockTopicAdmin {
    fn exist(&self, topic: &str) -> bool {
        self.exist_calls.fetch_add(1, Ordering::SeqCst);
        self.registry.contains(topic)
    }

    async fn create_topic(
        &self,
        topic: &str,
        partitions: i32,
        replication_factor: i32,
    ) -> Result<(), QueueError> {
        self.created
            .lock()
            .unwrap()
            .push((topic.to_string(), partitions, replication_factor));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(QueueError::TopicCreation {
                topic: topic.to_string(),
                code: RDKafkaErrorCode::BrokerTransportFailure,
            });
        }
        Ok(())
    }

    fn add_topic(&self, topic: &str) {
        self.added.lock().unwrap().push(topic.to_string());
        self.registry.insert(topic);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Publisher that records messages instead of sending them
#[derive(Default)]
pub struct MockSyncProducer {
    pub fail_topics: Mutex<HashSet<String>>,
    pub sent: Mutex<Vec<(String, Vec<u8>)>>,
    pub closed: AtomicBool,
}

impl MockSyncProducer {
    pub fn failing_on(topic: &str) -> Self {
        let producer = MockSyncProducer::default();
        producer.fail_topics.lock().unwrap().insert(topic.to_string());
        producer
    }

    pub fn sent_topics(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn sent_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl SyncProducer for MockSyncProducer {
    async fn send_message(&self, topic: &str, payload: Vec<u8>) -> Result<(i32, i64), QueueError> {
        if self.fail_topics.lock().unwrap().contains(topic) {
            return Err(QueueError::Publish {
                topic: topic.to_string(),
                reason: "not enough replicas".to_string(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((topic.to_string(), payload));
        Ok((0, sent.len() as i64 - 1))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out the given fakes, or failing on demand
#[derive(Default)]
pub struct DummyKafkaFactory {
    pub producer: Arc<MockSyncProducer>,
    pub admin: Arc<MockTopicAdmin>,
    pub fail_producer: bool,
    pub fail_admin: bool,
}

#[async_trait]
impl KafkaFactory for DummyKafkaFactory {
    async fn make_sync_producer(&self) -> Result<Arc<dyn SyncProducer>, QueueError> {
        if self.fail_producer {
            return Err(QueueError::RetryLimitReached);
        }
        Ok(self.producer.clone())
    }

    async fn make_kafka_admin(&self) -> Result<Arc<dyn TopicAdmin>, QueueError> {
        if self.fail_admin {
            return Err(QueueError::RetryLimitReached);
        }
        Ok(self.admin.clone())
    }
}

/// Group consumer fed by the test through channel senders
pub struct FakeGroupConsumer {
    streams: Mutex<Option<ConsumerStreams>>,
    pub fail_subscribe: bool,
    pub marked: Mutex<Vec<QueueMessage>>,
    pub closed: AtomicBool,
}

pub struct FakeConsumerFeed {
    pub messages: mpsc::Sender<QueueMessage>,
    pub notifications: mpsc::UnboundedSender<Notification>,
    pub errors: mpsc::Sender<QueueError>,
}

impl FakeGroupConsumer {
    pub fn new() -> (Self, FakeConsumerFeed) {
        let (messages_tx, messages) = mpsc::channel(16);
        let (notifications_tx, notifications) = mpsc::unbounded_channel();
        let (errors_tx, errors) = mpsc::channel(16);
        let consumer = FakeGroupConsumer {
            streams: Mutex::new(Some(ConsumerStreams {
                messages,
                notifications,
                errors,
            })),
            fail_subscribe: false,
            marked: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        let feed = FakeConsumerFeed {
            messages: messages_tx,
            notifications: notifications_tx,
            errors: errors_tx,
        };
        (consumer, feed)
    }

    pub fn marked_offsets(&self) -> Vec<i64> {
        self.marked
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.offset)
            .collect()
    }
}

#[async_trait]
impl GroupConsumer for FakeGroupConsumer {
    async fn subscribe(&self) -> Result<ConsumerStreams, QueueError> {
        if self.fail_subscribe {
            return Err(QueueError::RetryLimitReached);
        }
        self.streams
            .lock()
            .unwrap()
            .take()
            .ok_or(QueueError::AlreadySubscribed)
    }

    fn mark_offset(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.marked.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn queue_message(offset: i64, payload: Vec<u8>) -> QueueMessage {
    QueueMessage {
        topic: "app_logs".to_string(),
        partition: 0,
        offset,
        payload,
    }
}

/// What a [`FakeStore`] does with the next store call
pub enum StoreOutcome {
    Accept,
    Reject(SinkError),
    /// Never completes until the given token is cancelled
    Hang(CancellationToken),
}

/// Store recording accepted timbers; outcomes are scripted per call, accepting by default
#[derive(Default)]
pub struct FakeStore {
    pub outcomes: Mutex<VecDeque<StoreOutcome>>,
    pub stored: Mutex<Vec<Timber>>,
    pub calls: AtomicUsize,
}

impl FakeStore {
    pub fn scripted(outcomes: Vec<StoreOutcome>) -> Self {
        FakeStore {
            outcomes: Mutex::new(outcomes.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn store(&self, timber: Timber) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StoreOutcome::Accept);
        match outcome {
            StoreOutcome::Accept => {
                self.stored.lock().unwrap().push(timber);
                Ok(())
            }
            StoreOutcome::Reject(err) => Err(err),
            StoreOutcome::Hang(token) => {
                token.cancelled().await;
                Err(SinkError::Cancelled)
            }
        }
    }
}
