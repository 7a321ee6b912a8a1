// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log records ("timbers") as they travel from producing clients, through Kafka, into
//! Elasticsearch.
//!
//! A timber is serialized as JSON both on the RPC surface and inside Kafka messages, so the
//! forwarder decodes exactly what the producer published.

use serde::{Deserialize, Serialize};

/// Logical context of a timber. `kafka_topic` is the context identifier the target topic name is
/// derived from; the other fields configure topic creation, rate limiting and indexing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimberContext {
    pub kafka_topic: String,
    /// Partition count for the topic when it has to be created, 0 means use the default
    pub kafka_partition: i32,
    /// Replication factor for the topic when it has to be created, 0 means use the default
    pub kafka_replication_factor: i32,
    pub es_index_prefix: String,
    /// Kept on the wire so Kafka records round-trip unchanged. Indices are typeless, documents
    /// are always written to `_doc`.
    pub es_document_type: String,
    /// Per-application admission ceiling per rate window, 0 means use the default
    pub app_max_tps: u32,
}

/// One log event. Immutable once received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timber {
    pub context: TimberContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub content: serde_json::Value,
}

impl Timber {
    /// Topic this timber is published to: the context identifier followed by `suffix`.
    pub fn topic_name(&self, suffix: &str) -> String {
        format!("{}{}", self.context.kafka_topic, suffix)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Timbers submitted together. Items share nothing beyond co-submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimberCollection {
    pub items: Vec<Timber>,
}

/// Outcome of a successful produce call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResult {
    pub topic: String,
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use serde_json::json;

    pub fn sample_timber(topic: &str) -> Timber {
        Timber {
            context: TimberContext {
                kafka_topic: topic.to_string(),
                kafka_partition: 1,
                kafka_replication_factor: 1,
                es_index_prefix: "some-index".to_string(),
                es_document_type: "some-type".to_string(),
                app_max_tps: 100,
            },
            timestamp: None,
            content: json!({"message": "hello world"}),
        }
    }

    #[test]
    fn topic_name_appends_suffix() {
        assert_eq!(sample_timber("some_topic").topic_name("_logs"), "some_topic_logs");
    }

    #[test]
    fn same_context_same_topic() {
        let mut other = sample_timber("some_topic");
        other.content = json!({"message": "different payload"});
        assert_eq!(
            sample_timber("some_topic").topic_name("_logs"),
            other.topic_name("_logs")
        );
    }

    #[test]
    fn decodes_partial_json_with_defaults() {
        let timber =
            Timber::from_bytes(br#"{"context":{"kafka_topic":"abc"},"content":{"a":1}}"#)
                .expect("timber should decode");
        assert_eq!(timber.context.kafka_topic, "abc");
        assert_eq!(timber.context.kafka_partition, 0);
        assert_eq!(timber.timestamp, None);
        assert_eq!(timber.content, json!({"a": 1}));
    }

    #[test]
    fn bytes_survive_kafka_hop() {
        let timber = sample_timber("abc");
        let bytes = timber.to_bytes().expect("timber should encode");
        assert_eq!(Timber::from_bytes(&bytes).expect("timber should decode"), timber);
    }
}
