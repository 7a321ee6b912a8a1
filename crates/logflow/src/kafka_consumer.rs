// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consumer-group side of Kafka.
//!
//! Records, rebalance notifications and consumer errors are delivered on three separate
//! channels. Offsets are stored explicitly through [`GroupConsumer::mark_offset`] and committed
//! in the background, so nothing is acknowledged before the caller is done with a record.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::QueueError;

/// Records are pulled one at a time; a small buffer keeps the consumer from racing ahead of the
/// sink.
const MESSAGE_BUFFER: usize = 1;
const ERROR_BUFFER: usize = 64;

/// A record read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Consumer-group membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Assigned(Vec<(String, i32)>),
    Revoked(Vec<(String, i32)>),
    RebalanceError(String),
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Assigned(partitions) => {
                write!(f, "partitions assigned: {}", format_partitions(partitions))
            }
            Notification::Revoked(partitions) => {
                write!(f, "partitions revoked: {}", format_partitions(partitions))
            }
            Notification::RebalanceError(reason) => write!(f, "rebalance error: {reason}"),
        }
    }
}

fn format_partitions(partitions: &[(String, i32)]) -> String {
    partitions
        .iter()
        .map(|(topic, partition)| format!("{topic}/{partition}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Receiving ends handed out by [`GroupConsumer::subscribe`]. `messages` closes when the
/// consumer is closed.
pub struct ConsumerStreams {
    pub messages: mpsc::Receiver<QueueMessage>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub errors: mpsc::Receiver<QueueError>,
}

#[async_trait]
pub trait GroupConsumer: Send + Sync {
    /// Joins the group and starts delivering. Only one subscription per consumer.
    async fn subscribe(&self) -> Result<ConsumerStreams, QueueError>;

    /// Records `message` as processed; it will be part of the next commit.
    fn mark_offset(&self, message: &QueueMessage) -> Result<(), QueueError>;

    fn close(&self);
}

struct GroupContext {
    notifications: mpsc::UnboundedSender<Notification>,
}

impl GroupContext {
    fn notify(&self, notification: Notification) {
        // The receiver is gone once the forwarder stopped listening.
        let _ = self.notifications.send(notification);
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

fn notification_for(rebalance: &Rebalance<'_>) -> Notification {
    match rebalance {
        Rebalance::Assign(tpl) => Notification::Assigned(partitions_of(tpl)),
        Rebalance::Revoke(tpl) => Notification::Revoked(partitions_of(tpl)),
        Rebalance::Error(err) => Notification::RebalanceError(err.to_string()),
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        self.notify(notification_for(rebalance));
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        _offsets: &TopicPartitionList,
    ) {
        if let Err(err) = result {
            error!("Offset commit failed: {err}");
        }
    }
}

pub struct KafkaGroupConsumer {
    consumer: Arc<StreamConsumer<GroupContext>>,
    topics: Vec<String>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    cancel_token: CancellationToken,
}

impl KafkaGroupConsumer {
    pub fn new(brokers: &[String], group_id: &str, topics: Vec<String>) -> Result<Self, QueueError> {
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            notifications: notifications_tx,
        };
        let consumer: StreamConsumer<GroupContext> =
            client_config(brokers, group_id).create_with_context(context)?;

        Ok(KafkaGroupConsumer {
            consumer: Arc::new(consumer),
            topics,
            notifications: Mutex::new(Some(notifications_rx)),
            cancel_token: CancellationToken::new(),
        })
    }
}

fn client_config(brokers: &[String], group_id: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers.join(","))
        .set("group.id", group_id)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "latest");
    config
}

#[async_trait]
impl GroupConsumer for KafkaGroupConsumer {
    async fn subscribe(&self) -> Result<ConsumerStreams, QueueError> {
        let notifications = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(QueueError::AlreadySubscribed)?;

        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        info!("Subscribed to topics: {:?}", self.topics);

        let (messages_tx, messages) = mpsc::channel(MESSAGE_BUFFER);
        let (errors_tx, errors) = mpsc::channel(ERROR_BUFFER);
        let consumer = Arc::clone(&self.consumer);
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    received = consumer.recv() => received.map(|msg| QueueMessage {
                        topic: msg.topic().to_string(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                        payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    }),
                };
                let delivered = match received {
                    Ok(message) => messages_tx.send(message).await.is_ok(),
                    Err(e) => errors_tx.send(QueueError::Kafka(e)).await.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            debug!("Kafka consumer pump stopped");
        });

        Ok(ConsumerStreams {
            messages,
            notifications,
            errors,
        })
    }

    fn mark_offset(&self, message: &QueueMessage) -> Result<(), QueueError> {
        // Committed offsets point at the next record to read.
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer.store_offsets(&tpl)?;
        Ok(())
    }

    fn close(&self) {
        if self.cancel_token.is_cancelled() {
            return;
        }
        self.cancel_token.cancel();
        self.consumer.unsubscribe();
        debug!("Kafka consumer closed");
    }
}

impl Drop for KafkaGroupConsumer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
