// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry policy applied by the Elasticsearch client to failed requests.

use std::error::Error as _;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::errors::SinkError;

/// Computes the wait before retry number `attempt` and whether to give up instead.
pub trait Backoff: Send + Sync {
    fn next(&self, attempt: u32) -> (Duration, bool);
}

/// Same wait for every attempt, never gives up on its own.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff {
    interval: Duration,
}

impl ConstantBackoff {
    pub fn new(interval: Duration) -> Self {
        ConstantBackoff { interval }
    }
}

impl Backoff for ConstantBackoff {
    fn next(&self, _attempt: u32) -> (Duration, bool) {
        (self.interval, false)
    }
}

/// Outcome of a failed attempt: how long to wait, whether to stop, and the error to report if
/// stopping.
#[derive(Debug)]
pub struct RetryDecision {
    pub wait: Duration,
    pub stop: bool,
    pub error: SinkError,
}

/// Policy consulted by the sink client after every failed request.
pub trait Retrier: Send + Sync {
    /// `attempt` starts at 1 for the first failure.
    fn retry(&self, attempt: u32, err: SinkError) -> RetryDecision;
}

pub type OnRetry = Arc<dyn Fn(&SinkError) + Send + Sync>;

/// Progress of a single sink write through its retries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
    waited: Duration,
}

impl RetryState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Total wait handed out so far.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Counts the failure and asks `retrier` what to do about it.
    pub fn next(&mut self, retrier: &dyn Retrier, err: SinkError) -> RetryDecision {
        self.attempt = self.attempt.saturating_add(1);
        let decision = retrier.retry(self.attempt, err);
        if !decision.stop {
            self.waited = self.waited.saturating_add(decision.wait);
        }
        decision
    }
}

pub struct ElasticRetrier {
    backoff: Box<dyn Backoff>,
    on_retry: OnRetry,
    max_retry: u32,
}

impl ElasticRetrier {
    /// Constant `interval` between attempts. A `max_retry` of 0 retries forever.
    pub fn new(interval: Duration, max_retry: u32, on_retry: OnRetry) -> Self {
        Self::with_backoff(Box::new(ConstantBackoff::new(interval)), max_retry, on_retry)
    }

    pub fn with_backoff(backoff: Box<dyn Backoff>, max_retry: u32, on_retry: OnRetry) -> Self {
        ElasticRetrier {
            backoff,
            on_retry,
            max_retry,
        }
    }
}

impl Retrier for ElasticRetrier {
    fn retry(&self, attempt: u32, err: SinkError) -> RetryDecision {
        warn!("Elasticsearch retry #{attempt}: {err}");

        let error = classify(err);
        let (wait, mut stop) = self.backoff.next(attempt);
        (self.on_retry)(&error);

        // Past the ceiling the attempt is never stopped.
        if self.max_retry > 0 && attempt >= self.max_retry {
            stop = false;
        }

        RetryDecision { wait, stop, error }
    }
}

/// Folds a refused connection into [`SinkError::BackendDown`], leaving other errors untouched.
/// DNS failures, connect timeouts and TLS errors stay [`SinkError::Transport`].
pub fn classify(err: SinkError) -> SinkError {
    match err {
        SinkError::Transport(e) if is_connection_refused(&e) => SinkError::BackendDown,
        other => other,
    }
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = cause.source();
    }
    false
}
