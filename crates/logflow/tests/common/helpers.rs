// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use logflow::producer_server::ProducerServer;
use logflow::timber::{Timber, TimberContext};
use serde_json::json;

pub fn create_test_timber(topic: &str) -> Timber {
    Timber {
        context: TimberContext {
            kafka_topic: topic.to_string(),
            kafka_partition: 3,
            kafka_replication_factor: 2,
            es_index_prefix: "app".to_string(),
            es_document_type: "log".to_string(),
            app_max_tps: 10,
        },
        timestamp: None,
        content: json!({"message": "some log line"}),
    }
}

/// Waits until the server has bound its listener.
pub async fn wait_for_listener(server: &ProducerServer) -> SocketAddr {
    for _ in 0..200 {
        if let Some(addr) = server.local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("producer server did not start listening");
}

/// Polls `condition` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
