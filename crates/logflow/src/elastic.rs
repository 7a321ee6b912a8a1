// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Elasticsearch sink of the forwarder.
//!
//! Every request goes through the configured [`Retrier`]. Transport failures and overload
//! statuses (429, 502, 503, 504) are retried; any other non-success status is returned
//! immediately, which abandons the document.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::elastic_retrier::{RetryState, Retrier};
use crate::errors::SinkError;
use crate::metrics::ThroughputCounter;
use crate::timber::Timber;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TIMESTAMP_FIELD: &str = "@timestamp";

/// Destination of decoded timbers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn store(&self, timber: Timber) -> Result<(), SinkError>;
}

pub struct ElasticClient {
    client: reqwest::Client,
    base_url: String,
    retrier: Arc<dyn Retrier>,
    cancel_token: CancellationToken,
}

impl ElasticClient {
    /// Requests in flight or waiting for a retry are abandoned with [`SinkError::Cancelled`]
    /// once `cancel_token` fires.
    pub fn new(
        base_url: &str,
        retrier: Arc<dyn Retrier>,
        cancel_token: CancellationToken,
    ) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(ElasticClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retrier,
            cancel_token,
        })
    }

    pub async fn index_exists(&self, index: &str) -> Result<bool, SinkError> {
        let url = format!("{}/{index}", self.base_url);
        let resp = self.perform(|client| client.head(&url)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(SinkError::Status {
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }

    /// Creating an index that already exists is not an error.
    pub async fn create_index(&self, index: &str) -> Result<(), SinkError> {
        let url = format!("{}/{index}", self.base_url);
        let resp = self.perform(|client| client.put(&url)).await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn index_document(&self, index: &str, document: &Value) -> Result<(), SinkError> {
        let url = format!("{}/{index}/_doc", self.base_url);
        let body = serde_json::to_vec(document)?;
        let resp = self
            .perform(|client| {
                client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(SinkError::Status {
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }

    async fn perform<F>(&self, build: F) -> Result<reqwest::Response, SinkError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut state = RetryState::default();
        loop {
            let sent = tokio::select! {
                sent = build(&self.client).send() => sent,
                _ = self.cancel_token.cancelled() => return Err(SinkError::Cancelled),
            };
            let err = match sent {
                Ok(resp) if is_retryable(resp.status()) => SinkError::Status {
                    status: resp.status().as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                },
                Ok(resp) => {
                    if state.attempt() > 0 {
                        debug!(
                            "Elasticsearch recovered after {} retries, waited {:?}",
                            state.attempt(),
                            state.waited()
                        );
                    }
                    return Ok(resp);
                }
                Err(e) => SinkError::Transport(e),
            };

            let decision = state.next(self.retrier.as_ref(), err);
            if decision.stop {
                return Err(decision.error);
            }
            tokio::select! {
                _ = tokio::time::sleep(decision.wait) => {},
                _ = self.cancel_token.cancelled() => return Err(SinkError::Cancelled),
            }
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Daily index of a timber: `<prefix>-<YYYY.MM.DD>`. Without a prefix the context identifier is
/// used.
pub fn index_name(timber: &Timber, now: DateTime<Utc>) -> String {
    let prefix = if timber.context.es_index_prefix.is_empty() {
        &timber.context.kafka_topic
    } else {
        &timber.context.es_index_prefix
    };
    format!("{prefix}-{}", now.format("%Y.%m.%d"))
}

/// Document body of a timber: its content, with `@timestamp` added when missing. Content that is
/// not a JSON object is kept under `message`.
pub fn document(timber: &Timber, now: DateTime<Utc>) -> Value {
    let mut doc = match &timber.content {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("message".to_string(), other.clone());
            map
        }
    };
    if !doc.contains_key(TIMESTAMP_FIELD) {
        let timestamp = timber
            .timestamp
            .clone()
            .unwrap_or_else(|| now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
        doc.insert(TIMESTAMP_FIELD.to_string(), Value::String(timestamp));
    }
    Value::Object(doc)
}

/// Writes timbers into daily indices, creating each index the first time it is seen.
pub struct ElasticStoreman {
    client: ElasticClient,
    known_indices: Mutex<HashSet<String>>,
    counter: Option<Arc<ThroughputCounter>>,
}

impl ElasticStoreman {
    pub fn new(client: ElasticClient) -> Self {
        ElasticStoreman {
            client,
            known_indices: Mutex::new(HashSet::new()),
            counter: None,
        }
    }

    #[must_use]
    pub fn with_counter(mut self, counter: Arc<ThroughputCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    fn is_known(&self, index: &str) -> bool {
        self.known_indices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(index)
    }

    async fn ensure_index(&self, index: &str) -> Result<(), SinkError> {
        if self.is_known(index) {
            return Ok(());
        }
        if !self.client.index_exists(index).await? {
            self.client.create_index(index).await?;
            info!("Created elasticsearch index {index}");
        }
        self.known_indices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index.to_string());
        Ok(())
    }
}

#[async_trait]
impl Store for ElasticStoreman {
    async fn store(&self, timber: Timber) -> Result<(), SinkError> {
        let now = Utc::now();
        let index = index_name(&timber, now);
        self.ensure_index(&index).await?;
        self.client
            .index_document(&index, &document(&timber, now))
            .await?;
        debug!("Stored timber in {index}");

        if let Some(counter) = &self.counter {
            counter.incr(&timber.context.kafka_topic, 1);
        }
        Ok(())
    }
}
