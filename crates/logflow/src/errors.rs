// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hyper::StatusCode;
use rdkafka::types::RDKafkaErrorCode;
use serde::Serialize;

/// Failures talking to Kafka, on either the producer or the consumer side.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Error connecting to kafka, retry limit reached")]
    RetryLimitReached,

    /// Broker-side refusal, carrying the code so callers can tell an existing topic apart.
    #[error("Failed to create topic {topic}: {code}")]
    TopicCreation {
        topic: String,
        code: RDKafkaErrorCode,
    },

    #[error("Failed to publish to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Queue client is closed")]
    Closed,

    #[error("Consumer already subscribed")]
    AlreadySubscribed,

    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Failures writing to Elasticsearch.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Connection refused, normalized so alerting does not depend on transport error codes
    #[error("Elasticsearch or network down")]
    BackendDown,

    #[error("Elasticsearch request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Elasticsearch responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Write cancelled before completion")]
    Cancelled,
}

/// Status codes of the RPC surface. Names follow gRPC so clients can keep their classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    ResourceExhausted,
    Internal,
    Unavailable,
    InvalidArgument,
}

impl Code {
    pub fn http_status(self) -> StatusCode {
        match self {
            Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
        }
    }
}

/// Why a produce call was refused.
#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    #[error("Bandwidth Limit Exceeded")]
    RateLimitExceeded,

    #[error("Failed to create topic: {0}")]
    TopicCreation(#[source] QueueError),

    #[error("Failed to store timber: {0}")]
    Store(#[source] QueueError),

    #[error("Invalid request: {0}")]
    InvalidArgument(String),
}

impl ProduceError {
    pub fn code(&self) -> Code {
        match self {
            ProduceError::RateLimitExceeded => Code::ResourceExhausted,
            ProduceError::TopicCreation(_) => Code::Internal,
            ProduceError::Store(_) => Code::Unavailable,
            ProduceError::InvalidArgument(_) => Code::InvalidArgument,
        }
    }
}

/// Fatal producer startup failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Make sync producer failed: {0}")]
    MakeSyncProducer(#[source] QueueError),

    #[error("Make kafka admin failed: {0}")]
    MakeKafkaAdmin(#[source] QueueError),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("Producer server already started")]
    AlreadyStarted,
}

/// Errors surfaced by the forwarding agent, either returned from `start` or handed to the
/// error callback.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Forwarding agent already started")]
    AlreadyStarted,

    #[error("Consumer error: {0}")]
    Consumer(#[from] QueueError),

    #[error("Consumer group notification: {0}")]
    Notification(String),

    #[error("Failed to decode timber: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Failed to store timber: {0}")]
    Store(#[from] SinkError),
}

/// Failures pushing throughput counters to the metrics collector.
#[derive(Debug, thiserror::Error)]
pub enum MetricPushError {
    #[error("Metric push request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Metric collector responded {0}")]
    Status(u16),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
