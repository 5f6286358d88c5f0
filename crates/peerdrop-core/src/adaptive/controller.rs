//! Adaptive chunk-size controller.
//!
//! Maps a [`NetworkMetrics`] snapshot to a recommended outbound chunk size.
//! Each update moves only a fraction (`adaptation_rate`) of the way towards
//! the computed target, and small or low-confidence changes are discarded.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::monitor::{NetworkMetrics, NetworkQuality};
use crate::config::ChunkConfig;

/// Confidence before any adjustment.
const BASE_CONFIDENCE: f64 = 0.8;

/// RTT floor used by the latency correction, in milliseconds.
const RTT_FLOOR_MS: f64 = 50.0;

/// Exponent of the latency correction.
const RTT_EXPONENT: f64 = 0.3;

/// Largest boost applied for an under-used link.
const MAX_UTILIZATION_BOOST: f64 = 1.5;

/// Direction recent transfers are heading in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    /// High success rate with RTT on target
    Increasing,
    /// Failures or RTT well above target
    Decreasing,
    /// Neither
    Stable,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Increasing => "increasing",
            Self::Decreasing => "decreasing",
            Self::Stable => "stable",
        };
        f.write_str(name)
    }
}

/// Outcome of sending one chunk, fed to [`ChunkSizeController::record_performance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    /// When the chunk was sent
    pub at: Instant,
    /// Size of the chunk in bytes
    pub chunk_size: usize,
    /// RTT observed around the send, if any
    pub rtt: Option<Duration>,
    /// Whether the send succeeded
    pub success: bool,
}

/// A computed chunk size with its rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSizeRecommendation {
    /// Recommended chunk size in bytes
    pub chunk_size: usize,
    /// Human-readable notes on each adjustment
    pub reasoning: Vec<String>,
    /// How much the metrics support the recommendation (0-1)
    pub confidence: f64,
    /// Quality the recommendation was based on
    pub quality: NetworkQuality,
    /// Combined multiplier applied to the current size
    pub adaptation_factor: f64,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSizeStats {
    /// Current chunk size in bytes
    pub current_chunk_size: usize,
    /// Committed size changes
    pub adaptations: u64,
    /// Recommendations discarded as insignificant or low-confidence
    pub rejected_adaptations: u64,
    /// Latest trend classification
    pub trend: Trend,
}

/// Owns the current outbound chunk size of one sender.
#[derive(Debug)]
pub struct ChunkSizeController {
    config: ChunkConfig,
    current: usize,
    adaptations: u64,
    rejected_adaptations: u64,
    history: VecDeque<PerformanceSample>,
    trend: Trend,
}

impl ChunkSizeController {
    /// Create a controller starting at the configured initial size.
    pub fn new(config: ChunkConfig) -> Self {
        let current = config
            .initial_chunk_size
            .clamp(config.min_chunk_size, config.max_chunk_size);
        Self {
            config,
            current,
            adaptations: 0,
            rejected_adaptations: 0,
            history: VecDeque::new(),
            trend: Trend::Stable,
        }
    }

    /// Current chunk size in bytes.
    pub const fn current_chunk_size(&self) -> usize {
        self.current
    }

    /// Latest trend classification.
    pub const fn trend(&self) -> Trend {
        self.trend
    }

    /// Diagnostic counters.
    pub const fn stats(&self) -> ChunkSizeStats {
        ChunkSizeStats {
            current_chunk_size: self.current,
            adaptations: self.adaptations,
            rejected_adaptations: self.rejected_adaptations,
            trend: self.trend,
        }
    }

    /// Compute a recommendation without committing it.
    pub fn calculate_optimal_chunk_size(&self, metrics: &NetworkMetrics) -> ChunkSizeRecommendation {
        let cfg = &self.config;
        let target_rtt_ms = cfg.target_rtt.as_secs_f64() * 1000.0;
        let mut reasoning = Vec::new();
        let mut confidence = BASE_CONFIDENCE;

        let mut factor = match metrics.quality {
            NetworkQuality::Excellent => 1.5,
            NetworkQuality::Good => 1.2,
            NetworkQuality::Fair => {
                if metrics.rtt_ms.is_some_and(|rtt| rtt > target_rtt_ms) {
                    0.9
                } else {
                    1.1
                }
            }
            NetworkQuality::Poor => 0.7,
        };
        reasoning.push(format!("{} network: base factor {factor:.2}", metrics.quality));

        match metrics.rtt_ms {
            Some(rtt) => {
                let correction = (target_rtt_ms / rtt.max(RTT_FLOOR_MS)).powf(RTT_EXPONENT);
                factor *= correction;
                reasoning.push(format!("RTT {rtt:.0}ms: correction x{correction:.2}"));
            }
            None => {
                confidence -= 0.3;
                reasoning.push("no RTT samples yet".to_string());
            }
        }

        if let Some(utilization) = metrics.utilization() {
            if utilization < cfg.target_bandwidth_utilization {
                let boost = (cfg.target_bandwidth_utilization / utilization.max(f64::EPSILON))
                    .min(MAX_UTILIZATION_BOOST);
                factor *= boost;
                reasoning.push(format!(
                    "bandwidth utilization {:.0}%: boost x{boost:.2}",
                    utilization * 100.0
                ));
            } else if utilization > cfg.saturation_utilization {
                factor *= 0.9;
                reasoning.push(format!(
                    "bandwidth utilization {:.0}%: saturated",
                    utilization * 100.0
                ));
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let buffer_limit = cfg.target_buffer_utilization * cfg.buffer_reference as f64;
        if metrics.average_buffered > buffer_limit {
            factor *= 0.8;
            confidence -= 0.2;
            reasoning.push(format!(
                "send buffer backed up ({:.0} bytes)",
                metrics.average_buffered
            ));
        }

        let stability_ms = cfg.stability_threshold.as_secs_f64() * 1000.0;
        if metrics.jitter_ms > stability_ms {
            factor *= 0.9;
            confidence -= 0.2;
            reasoning.push(format!("jitter {:.1}ms: unstable link", metrics.jitter_ms));
        } else {
            confidence += 0.1;
        }

        let confidence = confidence.clamp(0.0, 1.0);
        let chunk_size = self.step_towards(factor);

        ChunkSizeRecommendation {
            chunk_size,
            reasoning,
            confidence,
            quality: metrics.quality,
            adaptation_factor: factor,
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn step_towards(&self, factor: f64) -> usize {
        let min = self.config.min_chunk_size as f64;
        let max = self.config.max_chunk_size as f64;
        let current = self.current as f64;

        let target = (current * factor).clamp(min, max);
        // Truncation keeps every step within `adaptation_rate` of the gap.
        let delta = (self.config.adaptation_rate * (target - current)).trunc();
        (current + delta).clamp(min, max) as usize
    }

    /// Recompute and commit the chunk size if the change is worth it.
    ///
    /// Returns the new size when it was committed.
    pub fn update_chunk_size(&mut self, metrics: &NetworkMetrics) -> Option<usize> {
        let recommendation = self.calculate_optimal_chunk_size(metrics);
        let previous = self.current;

        #[allow(clippy::cast_precision_loss)]
        let change = (recommendation.chunk_size as f64 - previous as f64).abs() / previous as f64;

        if change > self.config.significance_threshold
            && recommendation.confidence > self.config.confidence_threshold
        {
            self.current = recommendation.chunk_size;
            self.adaptations += 1;
            tracing::debug!(
                previous,
                chunk_size = self.current,
                confidence = recommendation.confidence,
                quality = %recommendation.quality,
                "Chunk size adapted"
            );
            Some(self.current)
        } else {
            self.rejected_adaptations += 1;
            None
        }
    }

    /// Append a sample to the rolling history and reclassify the trend.
    ///
    /// The trend is diagnostic only and never feeds into sizing.
    pub fn record_performance(&mut self, sample: PerformanceSample) {
        self.history.push_back(sample);
        while let Some(oldest) = self.history.front() {
            if sample.at.saturating_duration_since(oldest.at) > self.config.history_window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        let recent: Vec<&PerformanceSample> = self
            .history
            .iter()
            .rev()
            .take(self.config.trend_window)
            .collect();

        #[allow(clippy::cast_precision_loss)]
        let success_rate =
            recent.iter().filter(|s| s.success).count() as f64 / recent.len() as f64;

        let rtts: Vec<Duration> = recent.iter().filter_map(|s| s.rtt).collect();
        #[allow(clippy::cast_possible_truncation)]
        let average_rtt = (!rtts.is_empty())
            .then(|| rtts.iter().sum::<Duration>() / rtts.len() as u32);

        let target = self.config.target_rtt;
        let trend = if success_rate > 0.95 && average_rtt.is_none_or(|rtt| rtt <= target) {
            Trend::Increasing
        } else if success_rate < 0.9 || average_rtt.is_some_and(|rtt| rtt > target.mul_f64(1.5))
        {
            Trend::Decreasing
        } else {
            Trend::Stable
        };

        if trend != self.trend {
            tracing::debug!(from = %self.trend, to = %trend, "Transfer trend changed");
            self.trend = trend;
        }
    }

    /// Return to the initial size and forget history.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn excellent() -> NetworkMetrics {
        NetworkMetrics {
            rtt_ms: Some(40.0),
            latest_rtt_ms: Some(40.0),
            jitter_ms: 2.0,
            bandwidth: 2_000_000.0,
            average_bandwidth: 2_000_000.0,
            peak_bandwidth: 2_000_000.0,
            average_buffered: 0.0,
            rtt_samples: 10,
            quality: NetworkQuality::Excellent,
        }
    }

    #[test]
    fn test_converges_upward_without_overshoot() {
        let config = ChunkConfig::default();
        let max = config.max_chunk_size;
        let rate = config.adaptation_rate;
        let mut controller = ChunkSizeController::new(config);
        let metrics = excellent();

        let mut previous = controller.current_chunk_size();
        for _ in 0..60 {
            controller.update_chunk_size(&metrics);
            let now = controller.current_chunk_size();

            assert!(now >= previous, "size must not decrease");
            assert!(now <= max, "size must not exceed max");
            #[allow(clippy::cast_precision_loss)]
            let limit = rate * (max - previous) as f64;
            #[allow(clippy::cast_precision_loss)]
            let step = (now - previous) as f64;
            assert!(step <= limit, "step {step} exceeds {limit}");
            previous = now;
        }

        assert!(controller.current_chunk_size() >= max * 3 / 4);
        assert!(controller.stats().adaptations > 0);
    }

    #[test]
    fn test_poor_network_shrinks() {
        let mut controller = ChunkSizeController::new(ChunkConfig::default());
        let metrics = NetworkMetrics {
            rtt_ms: Some(400.0),
            quality: NetworkQuality::Poor,
            ..excellent()
        };

        let before = controller.current_chunk_size();
        let after = controller.update_chunk_size(&metrics).expect("committed");
        assert!(after < before);
    }

    #[test]
    fn test_low_confidence_rejected() {
        let mut controller = ChunkSizeController::new(ChunkConfig::default());
        // No RTT evidence and an unstable link.
        let metrics = NetworkMetrics {
            rtt_ms: None,
            jitter_ms: 50.0,
            quality: NetworkQuality::Good,
            ..excellent()
        };

        let recommendation = controller.calculate_optimal_chunk_size(&metrics);
        assert!(recommendation.confidence <= 0.6);
        assert!(controller.update_chunk_size(&metrics).is_none());
        assert_eq!(controller.stats().rejected_adaptations, 1);
    }

    #[test]
    fn test_bounds_respected() {
        let config = ChunkConfig {
            initial_chunk_size: 8 * 1024,
            adaptation_rate: 1.0,
            ..ChunkConfig::default()
        };
        let controller = ChunkSizeController::new(config);
        let metrics = NetworkMetrics {
            rtt_ms: Some(900.0),
            average_buffered: 10_000_000.0,
            jitter_ms: 100.0,
            quality: NetworkQuality::Poor,
            ..excellent()
        };

        let recommendation = controller.calculate_optimal_chunk_size(&metrics);
        assert_eq!(recommendation.chunk_size, 8 * 1024);
        assert!(recommendation.adaptation_factor < 1.0);
        assert!(!recommendation.reasoning.is_empty());
    }

    #[test]
    fn test_trend_classification() {
        let mut controller = ChunkSizeController::new(ChunkConfig::default());
        let start = Instant::now();
        let sample = |i: u64, success: bool, rtt_ms: u64| PerformanceSample {
            at: start + Duration::from_millis(i * 100),
            chunk_size: 64 * 1024,
            rtt: Some(Duration::from_millis(rtt_ms)),
            success,
        };

        for i in 0..10 {
            controller.record_performance(sample(i, true, 50));
        }
        assert_eq!(controller.trend(), Trend::Increasing);

        for i in 10..12 {
            controller.record_performance(sample(i, false, 50));
        }
        assert_eq!(controller.trend(), Trend::Decreasing);

        for i in 12..22 {
            controller.record_performance(sample(i, true, 120));
        }
        assert_eq!(controller.trend(), Trend::Stable);

        // Trend never changes the size on its own.
        assert_eq!(controller.current_chunk_size(), crate::DEFAULT_CHUNK_SIZE);
    }
}
