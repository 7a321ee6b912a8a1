// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Throughput counters and their optional periodic push to an external collector.
//!
//! Counting is a map increment on the hot path. Pushing happens on its own task and never
//! blocks producing or forwarding; a failed push puts the counts back so the next interval
//! carries them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::PushMetricConfig;
use crate::errors::MetricPushError;

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Log counts per application since the last drain.
#[derive(Debug, Default)]
pub struct ThroughputCounter {
    counts: Mutex<HashMap<String, u64>>,
}

impl ThroughputCounter {
    pub fn incr(&self, name: &str, count: u64) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry(name.to_string()).or_insert(0) += count;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Takes every count, leaving the counter empty.
    pub fn drain(&self) -> Vec<(String, u64)> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut drained: Vec<(String, u64)> = counts.drain().collect();
        drained.sort();
        drained
    }
}

#[derive(Debug, Serialize)]
struct ApplicationMetric<'a> {
    name: &'a str,
    new_log_count: u64,
}

#[derive(Debug, Serialize)]
struct MetricPayload<'a> {
    metrics: Vec<ApplicationMetric<'a>>,
}

pub struct MetricPusher {
    client: reqwest::Client,
    config: PushMetricConfig,
    counter: Arc<ThroughputCounter>,
}

impl MetricPusher {
    pub fn new(
        config: PushMetricConfig,
        counter: Arc<ThroughputCounter>,
    ) -> Result<Self, MetricPushError> {
        config.validate()?;
        let client = reqwest::Client::builder().timeout(PUSH_TIMEOUT).build()?;
        Ok(MetricPusher {
            client,
            config,
            counter,
        })
    }

    /// Pushes and clears the current counts. Nothing is sent when there is nothing to report.
    pub async fn push(&self) -> Result<(), MetricPushError> {
        let drained = self.counter.drain();
        if drained.is_empty() {
            return Ok(());
        }

        let payload = MetricPayload {
            metrics: drained
                .iter()
                .map(|(name, count)| ApplicationMetric {
                    name,
                    new_log_count: *count,
                })
                .collect(),
        };

        let result = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.token)
            .json(&payload)
            .send()
            .await
            .map_err(MetricPushError::from)
            .and_then(|resp| {
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(MetricPushError::Status(resp.status().as_u16()))
                }
            });

        if result.is_err() {
            for (name, count) in &drained {
                self.counter.incr(name, *count);
            }
        } else {
            debug!("Pushed throughput for {} applications", drained.len());
        }
        result
    }

    /// Pushes every interval until cancelled.
    pub async fn run(self, cancel_token: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.push().await {
                        error!("Failed to push metrics: {e}");
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        debug!("Metric pusher stopped");
    }
}
