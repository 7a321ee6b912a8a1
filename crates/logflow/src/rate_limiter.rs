// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Admission control for the producer.
//!
//! Every key (the producer uses the resolved topic name) owns a counter of requests admitted
//! since the last reset. A background ticker zeroes all counters at a fixed interval. Admission
//! is a single check-and-increment under one lock, so concurrent callers can never both take
//! the last slot of a window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub trait RateLimiter: Send + Sync {
    /// Returns true when the window for `key` is exhausted. A false return admits the request
    /// and consumes one slot. `max_tokens` of 0 selects the limiter's default ceiling.
    fn is_hit_limit(&self, key: &str, max_tokens: u32) -> bool;

    /// Starts the reset ticker. Calling it again while running does nothing.
    fn start(&self);

    fn is_start(&self) -> bool;

    /// Stops the reset ticker. Idempotent.
    fn stop(&self);
}

#[derive(Debug, Default)]
struct Windows {
    counts: Mutex<HashMap<String, u32>>,
}

impl Windows {
    fn check_and_increment(&self, key: &str, max_tokens: u32) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(key.to_string()).or_insert(0);
        if *count >= max_tokens {
            return true;
        }
        *count += 1;
        false
    }

    fn reset(&self) {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Fixed-window limiter reset by a tokio ticker.
#[derive(Debug)]
pub struct WindowRateLimiter {
    windows: Arc<Windows>,
    default_max_tokens: u32,
    reset_interval: Duration,
    started: Arc<AtomicBool>,
    cancel_token: CancellationToken,
}

impl WindowRateLimiter {
    pub fn new(default_max_tokens: u32, reset_interval: Duration) -> Self {
        WindowRateLimiter {
            windows: Arc::new(Windows::default()),
            default_max_tokens,
            reset_interval,
            started: Arc::new(AtomicBool::new(false)),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Zeroes every window immediately.
    pub fn reset(&self) {
        self.windows.reset();
    }
}

impl RateLimiter for WindowRateLimiter {
    fn is_hit_limit(&self, key: &str, max_tokens: u32) -> bool {
        let max_tokens = if max_tokens == 0 {
            self.default_max_tokens
        } else {
            max_tokens
        };
        self.windows.check_and_increment(key, max_tokens)
    }

    fn start(&self) {
        if self.cancel_token.is_cancelled() {
            error!("Rate limiter was stopped and cannot be restarted");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("Rate limiter must be started from within a tokio runtime");
            return;
        };
        if self.reset_interval.is_zero() {
            error!("Rate limiter reset interval must be greater than 0");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let windows = Arc::clone(&self.windows);
        let started = Arc::clone(&self.started);
        let cancel_token = self.cancel_token.clone();
        let reset_interval = self.reset_interval;
        let mut ticker = {
            let _guard = runtime.enter();
            interval(reset_interval)
        };
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        runtime.spawn(async move {
            ticker.tick().await; // first tick is instantaneous

            debug!("Rate limiter started, resetting every {reset_interval:?}");
            loop {
                tokio::select! {
                    _ = ticker.tick() => windows.reset(),
                    _ = cancel_token.cancelled() => break,
                }
            }
            started.store(false, Ordering::SeqCst);
            debug!("Rate limiter stopped");
        });
    }

    fn is_start(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.cancel_token.cancel();
        self.started.store(false, Ordering::SeqCst);
    }
}

impl Drop for WindowRateLimiter {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
