// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log transport between producing clients, Kafka and Elasticsearch.
//!
//! The producer front end ([`producer_server`], [`producer_service`]) admits timbers through a
//! per-topic [`rate_limiter`], creates missing topics through [`topic_admin`] and publishes them
//! to Kafka. The [`forwarder`] consumes those topics and writes each timber into Elasticsearch
//! ([`elastic`]) under the [`elastic_retrier`] policy.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod elastic;
pub mod elastic_retrier;
pub mod errors;
pub mod forwarder;
pub mod http_utils;
pub mod kafka;
pub mod kafka_consumer;
pub mod metrics;
pub mod producer_server;
pub mod producer_service;
pub mod rate_limiter;
pub mod timber;
pub mod topic_admin;
