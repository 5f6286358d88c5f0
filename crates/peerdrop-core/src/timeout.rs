//! Stall detection.
//!
//! [`TimeoutCalculator`] derives the allowed silence window for a transfer
//! from its size tier and observed rate. [`TimerRegistry`] keeps at most one
//! armed stall timer per transfer id; re-arming replaces the previous timer.
//!
//! Timers never touch transfer state. On expiry they invoke a callback
//! (normally an enqueue into the peer's event queue) with the generation
//! they were armed with, and the event loop checks
//! [`TimerRegistry::is_current`] before acting, so a timer that fired just
//! before being replaced is ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::TimeoutConfig;

/// Computes size- and rate-aware stall timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutCalculator {
    config: TimeoutConfig,
}

impl TimeoutCalculator {
    /// Create a calculator.
    pub const fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Silence window for a transfer as of now.
    pub fn calculate(
        &self,
        file_size: u64,
        bytes_received: u64,
        started_at: Instant,
        base_override: Option<Duration>,
    ) -> Duration {
        self.calculate_at(
            file_size,
            bytes_received,
            started_at,
            base_override,
            Instant::now(),
        )
    }

    /// Silence window for a transfer as of `now`.
    #[allow(clippy::cast_precision_loss)]
    pub fn calculate_at(
        &self,
        file_size: u64,
        bytes_received: u64,
        started_at: Instant,
        base_override: Option<Duration>,
        now: Instant,
    ) -> Duration {
        let cfg = &self.config;
        let base = base_override.unwrap_or(if file_size <= cfg.small_file_threshold {
            cfg.small_file_timeout
        } else {
            cfg.large_file_timeout
        });

        let elapsed = now.saturating_duration_since(started_at).as_secs_f64();
        let timeout = if bytes_received > 0 && elapsed > 0.0 {
            let rate = bytes_received as f64 / elapsed;
            if rate >= cfg.fast_rate as f64 {
                base.mul_f64(cfg.fast_multiplier)
            } else if rate < cfg.slow_rate as f64 {
                base.mul_f64(cfg.slow_multiplier)
            } else {
                base
            }
        } else {
            base
        };

        timeout.clamp(cfg.min_timeout, cfg.max_timeout)
    }
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    handle: AbortHandle,
}

/// One live stall timer per transfer id.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: HashMap<String, ArmedTimer>,
    next_generation: u64,
}

impl TimerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer for `transfer_id`.
    ///
    /// Any previous timer for the id is aborted. `on_expiry` runs with the
    /// returned generation once `after` has elapsed. Must be called from
    /// within a tokio runtime.
    pub fn arm<F>(&mut self, transfer_id: &str, after: Duration, on_expiry: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.next_generation += 1;
        let generation = self.next_generation;

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_expiry(generation);
        });

        let previous = self.timers.insert(
            transfer_id.to_string(),
            ArmedTimer {
                generation,
                handle: task.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }

        generation
    }

    /// Whether `generation` is the live timer of `transfer_id`.
    pub fn is_current(&self, transfer_id: &str, generation: u64) -> bool {
        self.timers
            .get(transfer_id)
            .is_some_and(|timer| timer.generation == generation)
    }

    /// Cancel the timer for `transfer_id`. Returns `false` if none was armed.
    pub fn cancel(&mut self, transfer_id: &str) -> bool {
        self.timers.remove(transfer_id).is_some_and(|timer| {
            timer.handle.abort();
            true
        })
    }

    /// Cancel every timer.
    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timer is armed.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
