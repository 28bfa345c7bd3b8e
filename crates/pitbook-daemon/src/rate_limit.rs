//! Rate limiting for staff manual rewards.
//!
//! Implements an in-memory sliding-window limiter keyed by staff id. Manual
//! rewards are discretionary and individually small, so the damage model is
//! volume; the window caps how many a single staff member can push per
//! minute regardless of which entry point they arrive through.
//!
//! # Configuration
//!
//! - `max_requests`: requests allowed per key within the window
//! - `window_secs`: size of the sliding window in seconds
//! - `max_tracked_keys`: hard cap on distinct keys tracked at once
//!
//! # Thread Safety
//!
//! The limiter is shared across dispatching threads; internal state lives
//! behind an `RwLock`.
//!
//! # Memory Management
//!
//! Two mechanisms bound memory:
//!
//! 1. **Probabilistic cleanup**: every Nth request (default: 100) drops
//!    keys with no requests inside the window.
//! 2. **Hard cap on tracked keys**: when `max_tracked_keys` is reached and
//!    an untracked key arrives, cleanup runs first; if the table is still
//!    full the request is rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Returned when a key exhausts its window, or when the tracked-key cap
/// is reached and the key is not already tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limit exceeded")]
pub struct RateLimitExceeded;

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per key within the window.
    pub max_requests: u32,

    /// Size of the sliding window in seconds.
    pub window_secs: u64,

    /// How often to run cleanup (every N requests).
    pub cleanup_interval: u64,

    /// Maximum number of distinct keys to track. Staff ids come from
    /// verified identities rather than arbitrary input, so this is a
    /// memory bound, not an attack surface.
    pub max_tracked_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            // Matches the [rate_limit] config-section defaults.
            max_requests: 30,
            window_secs: 60,
            cleanup_interval: 100,
            max_tracked_keys: 10_000,
        }
    }
}

/// An in-memory sliding-window rate limiter.
///
/// Tracks request timestamps per key and rejects requests that exceed the
/// configured limit within the window.
pub struct RateLimiter {
    config: RateLimitConfig,
    // Maps keys to their request timestamps
    state: RwLock<HashMap<String, Vec<Instant>>>,
    // Counter driving probabilistic cleanup
    request_count: AtomicU64,
}

impl RateLimiter {
    /// Creates a new rate limiter with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            request_count: AtomicU64::new(0),
        }
    }

    /// Checks whether a request under `key` is allowed, recording it when
    /// it is.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] if the request would exceed the
    /// window limit, or if the tracked-key cap is reached and `key` is
    /// not already tracked.
    pub fn check(&self, key: &str) -> Result<(), RateLimitExceeded> {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_secs);
        let cutoff = now.checked_sub(window).unwrap_or(now);

        // Relaxed ordering: a missed or duplicate cleanup is harmless.
        let count = self.request_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            tracing::debug!(request_count = count, "running periodic rate limiter cleanup");
            self.cleanup();
        }

        // Read-only fast path before taking the write lock.
        {
            let state = self
                .state
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            let key_is_tracked = state.contains_key(key);

            if let Some(timestamps) = state.get(key) {
                let recent_count = timestamps.iter().filter(|&&t| t > cutoff).count();
                if recent_count >= self.config.max_requests as usize {
                    tracing::warn!(
                        key = %key,
                        requests = recent_count,
                        max = self.config.max_requests,
                        "rate limit exceeded"
                    );
                    return Err(RateLimitExceeded);
                }
            }

            if !key_is_tracked && state.len() >= self.config.max_tracked_keys {
                // Drop the read lock before cleanup.
                drop(state);

                tracing::debug!(
                    max_tracked_keys = self.config.max_tracked_keys,
                    "tracked-key cap reached, forcing cleanup"
                );
                self.cleanup();

                let state = self
                    .state
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if !state.contains_key(key) && state.len() >= self.config.max_tracked_keys {
                    tracing::warn!(
                        key = %key,
                        tracked_keys = state.len(),
                        max_tracked_keys = self.config.max_tracked_keys,
                        "rejecting untracked key: tracked-key cap reached"
                    );
                    return Err(RateLimitExceeded);
                }
            }
        }

        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Re-check the cap under the write lock; another thread may have
        // filled the table between the read check and here.
        if !state.contains_key(key) && state.len() >= self.config.max_tracked_keys {
            tracing::warn!(
                key = %key,
                tracked_keys = state.len(),
                max_tracked_keys = self.config.max_tracked_keys,
                "rejecting untracked key: tracked-key cap reached"
            );
            return Err(RateLimitExceeded);
        }

        let timestamps = state.entry(key.to_string()).or_default();

        // Drop timestamps that fell out of the window.
        timestamps.retain(|&t| t > cutoff);

        // Re-check the count under the write lock as well.
        if timestamps.len() >= self.config.max_requests as usize {
            tracing::warn!(
                key = %key,
                requests = timestamps.len(),
                max = self.config.max_requests,
                "rate limit exceeded"
            );
            return Err(RateLimitExceeded);
        }

        timestamps.push(now);

        Ok(())
    }

    /// Drops all keys with no requests inside the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_secs);
        let cutoff = now.checked_sub(window).unwrap_or(now);

        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        state.retain(|_, timestamps| {
            timestamps.retain(|&t| t > cutoff);
            !timestamps.is_empty()
        });
    }

    /// Returns the number of tracked keys.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        let state = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.len()
    }
}
