// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consume loop moving timbers from Kafka into the sink.
//!
//! One record is handled at a time: decode, store, then mark its offset. A record whose store was
//! interrupted by [`ForwardingAgent::close`] is left unmarked so it is delivered again after a
//! restart. Records that cannot be decoded or that the sink rejects are reported and marked.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::elastic::Store;
use crate::errors::{AgentError, SinkError};
use crate::kafka_consumer::{ConsumerStreams, GroupConsumer, QueueMessage};
use crate::timber::Timber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Running,
    Stopped,
    Failed,
}

pub type OnError = Arc<dyn Fn(&AgentError) + Send + Sync>;

pub struct ForwardingAgent {
    consumer: Arc<dyn GroupConsumer>,
    store: Arc<dyn Store>,
    on_error: OnError,
    state: Mutex<AgentState>,
    cancel_token: CancellationToken,
}

impl ForwardingAgent {
    pub fn new(consumer: Arc<dyn GroupConsumer>, store: Arc<dyn Store>, on_error: OnError) -> Self {
        ForwardingAgent {
            consumer,
            store,
            on_error,
            state: Mutex::new(AgentState::Created),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: AgentState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Runs the consume loop until the consumer is closed or [`Self::close`] is called.
    pub async fn start(&self) -> Result<(), AgentError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != AgentState::Created {
                return Err(AgentError::AlreadyStarted);
            }
            *state = AgentState::Running;
        }

        let streams = match self.consumer.subscribe().await {
            Ok(streams) => streams,
            Err(e) => {
                self.set_state(AgentState::Failed);
                return Err(e.into());
            }
        };
        info!("Forwarding agent running");

        self.consume(streams).await;

        self.set_state(AgentState::Stopped);
        info!("Forwarding agent stopped");
        Ok(())
    }

    async fn consume(&self, streams: ConsumerStreams) {
        let ConsumerStreams {
            mut messages,
            mut notifications,
            mut errors,
        } = streams;
        let mut notifications_open = true;
        let mut errors_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                notification = notifications.recv(), if notifications_open => match notification {
                    Some(notification) => {
                        info!("Consumer group {notification}");
                        (self.on_error)(&AgentError::Notification(notification.to_string()));
                    }
                    None => notifications_open = false,
                },
                err = errors.recv(), if errors_open => match err {
                    Some(err) => (self.on_error)(&AgentError::Consumer(err)),
                    None => errors_open = false,
                },
                message = messages.recv() => match message {
                    Some(message) => self.forward(message).await,
                    None => break,
                },
            }
        }
    }

    async fn forward(&self, message: QueueMessage) {
        let timber = match Timber::from_bytes(&message.payload) {
            Ok(timber) => timber,
            Err(e) => {
                (self.on_error)(&AgentError::Decode(e));
                self.mark(&message);
                return;
            }
        };

        let stored = tokio::select! {
            stored = self.store.store(timber) => stored,
            _ = self.cancel_token.cancelled() => Err(SinkError::Cancelled),
        };
        match stored {
            Ok(()) => self.mark(&message),
            Err(SinkError::Cancelled) => {
                debug!(
                    "Store of {}/{}@{} interrupted, offset left unmarked",
                    message.topic, message.partition, message.offset
                );
            }
            Err(e) => {
                (self.on_error)(&AgentError::Store(e));
                self.mark(&message);
            }
        }
    }

    fn mark(&self, message: &QueueMessage) {
        if let Err(e) = self.consumer.mark_offset(message) {
            warn!(
                "Failed to mark offset {}/{}@{}: {e}",
                message.topic, message.partition, message.offset
            );
            (self.on_error)(&AgentError::Consumer(e));
        }
    }

    /// Unblocks the consume loop and closes the consumer. Idempotent.
    pub fn close(&self) {
        if self.cancel_token.is_cancelled() {
            return;
        }
        self.cancel_token.cancel();
        self.consumer.close();
    }
}
