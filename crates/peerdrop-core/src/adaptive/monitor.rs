//! Rolling network performance statistics.
//!
//! The monitor keeps a ring of RTT samples, a time-windowed series of
//! delivered chunk sizes (for bandwidth), and a time-windowed series of
//! send-buffer levels. [`NetworkMonitor::metrics`] condenses them into a
//! [`NetworkMetrics`] snapshot that the chunk-size controller consumes.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::channel::Channel;
use crate::config::MonitorConfig;
use crate::protocol::{ControlMessage, PingPayload};

/// Coarse link quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    /// Low latency and high bandwidth
    Excellent,
    /// Comfortable for bulk transfer
    Good,
    /// Usable; also reported when there is no evidence yet
    Fair,
    /// High latency or low bandwidth
    Poor,
}

impl NetworkQuality {
    /// Classify a link.
    ///
    /// Each tier requires both the RTT and the bandwidth threshold to be met;
    /// failing either demotes the link to the next tier. Without an RTT or a
    /// bandwidth sample the link is rated [`NetworkQuality::Fair`].
    pub fn classify(
        rtt: Option<Duration>,
        bandwidth_mbps: Option<f64>,
        config: &MonitorConfig,
    ) -> Self {
        let (Some(rtt), Some(mbps)) = (rtt, bandwidth_mbps) else {
            return Self::Fair;
        };

        let meets = |tier: &crate::config::QualityTier| {
            rtt <= tier.max_rtt && mbps >= tier.min_bandwidth_mbps
        };

        if meets(&config.excellent) {
            Self::Excellent
        } else if meets(&config.good) {
            Self::Good
        } else if meets(&config.fair) {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    /// Mean of the RTT ring, in milliseconds
    pub rtt_ms: Option<f64>,
    /// Most recent RTT sample, in milliseconds
    pub latest_rtt_ms: Option<f64>,
    /// Population standard deviation of the RTT ring, in milliseconds
    pub jitter_ms: f64,
    /// Throughput over the trailing window, bytes per second
    pub bandwidth: f64,
    /// Exponential moving average of the throughput, bytes per second
    pub average_bandwidth: f64,
    /// Highest throughput ever observed, bytes per second
    pub peak_bandwidth: f64,
    /// Mean buffered-but-unsent bytes over the buffer window
    pub average_buffered: f64,
    /// Number of RTT samples in the ring
    pub rtt_samples: usize,
    /// Derived link quality
    pub quality: NetworkQuality,
}

impl NetworkMetrics {
    /// Smoothed bandwidth in megabits per second.
    pub fn bandwidth_mbps(&self) -> f64 {
        self.average_bandwidth * 8.0 / 1_000_000.0
    }

    /// Current throughput relative to the best observed throughput.
    pub fn utilization(&self) -> Option<f64> {
        (self.peak_bandwidth > 0.0).then(|| self.bandwidth / self.peak_bandwidth)
    }
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self {
            rtt_ms: None,
            latest_rtt_ms: None,
            jitter_ms: 0.0,
            bandwidth: 0.0,
            average_bandwidth: 0.0,
            peak_bandwidth: 0.0,
            average_buffered: 0.0,
            rtt_samples: 0,
            quality: NetworkQuality::Fair,
        }
    }
}

const BANDWIDTH_EMA_ALPHA: f64 = 0.1;

/// Rolling RTT, bandwidth and buffer statistics for one peer.
#[derive(Debug)]
pub struct NetworkMonitor {
    config: MonitorConfig,
    rtt_samples: VecDeque<Duration>,
    chunk_samples: VecDeque<(Instant, u64)>,
    buffer_samples: VecDeque<(Instant, usize)>,
    bandwidth: f64,
    average_bandwidth: Option<f64>,
    peak_bandwidth: f64,
}

impl NetworkMonitor {
    /// Create an empty monitor.
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            rtt_samples: VecDeque::with_capacity(config.rtt_samples),
            config,
            chunk_samples: VecDeque::new(),
            buffer_samples: VecDeque::new(),
            bandwidth: 0.0,
            average_bandwidth: None,
            peak_bandwidth: 0.0,
        }
    }

    /// Record a successful RTT measurement. Zero durations are ignored.
    pub fn record_rtt(&mut self, rtt: Duration) {
        if rtt.is_zero() {
            return;
        }
        if self.rtt_samples.len() == self.config.rtt_samples {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);
    }

    /// Record a chunk handed to the channel.
    pub fn record_chunk(&mut self, bytes: u64) {
        self.record_chunk_at(bytes, Instant::now());
    }

    /// Record a chunk delivered at `now`.
    pub fn record_chunk_at(&mut self, bytes: u64, now: Instant) {
        self.chunk_samples.push_back((now, bytes));
        prune(&mut self.chunk_samples, now, self.config.bandwidth_window);

        let Some(&(oldest, _)) = self.chunk_samples.front() else {
            return;
        };
        let elapsed = now.saturating_duration_since(oldest).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        // The oldest sample marks the start of the window; only bytes
        // delivered after it count towards the rate.
        let bytes: u64 = self.chunk_samples.iter().skip(1).map(|(_, b)| b).sum();
        #[allow(clippy::cast_precision_loss)]
        let rate = bytes as f64 / elapsed;

        self.bandwidth = rate;
        self.peak_bandwidth = self.peak_bandwidth.max(rate);
        self.average_bandwidth = Some(match self.average_bandwidth {
            Some(avg) => BANDWIDTH_EMA_ALPHA.mul_add(rate, (1.0 - BANDWIDTH_EMA_ALPHA) * avg),
            None => rate,
        });
    }

    /// Record the channel's buffered-but-unsent byte count.
    pub fn record_buffer_level(&mut self, buffered: usize) {
        self.record_buffer_level_at(buffered, Instant::now());
    }

    /// Record a buffer level observed at `now`.
    pub fn record_buffer_level_at(&mut self, buffered: usize, now: Instant) {
        self.buffer_samples.push_back((now, buffered));
        prune(&mut self.buffer_samples, now, self.config.buffer_window);
    }

    /// Mean of the RTT ring.
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let total: Duration = self.rtt_samples.iter().sum();
        #[allow(clippy::cast_possible_truncation)]
        let count = self.rtt_samples.len() as u32;
        Some(total / count)
    }

    /// Population standard deviation of the RTT ring.
    pub fn jitter(&self) -> Duration {
        let n = self.rtt_samples.len();
        if n < 2 {
            return Duration::ZERO;
        }
        let samples: Vec<f64> = self.rtt_samples.iter().map(Duration::as_secs_f64).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        Duration::from_secs_f64(variance.sqrt())
    }

    /// Current link quality.
    pub fn quality(&self) -> NetworkQuality {
        let mbps = self
            .average_bandwidth
            .map(|bytes_per_sec| bytes_per_sec * 8.0 / 1_000_000.0);
        NetworkQuality::classify(self.average_rtt(), mbps, &self.config)
    }

    /// Snapshot of all statistics.
    pub fn metrics(&self) -> NetworkMetrics {
        let buffered = if self.buffer_samples.is_empty() {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let total = self.buffer_samples.iter().map(|(_, b)| *b as f64).sum::<f64>();
            total / self.buffer_samples.len() as f64
        };

        NetworkMetrics {
            rtt_ms: self.average_rtt().map(as_millis_f64),
            latest_rtt_ms: self.rtt_samples.back().copied().map(as_millis_f64),
            jitter_ms: as_millis_f64(self.jitter()),
            bandwidth: self.bandwidth,
            average_bandwidth: self.average_bandwidth.unwrap_or(0.0),
            peak_bandwidth: self.peak_bandwidth,
            average_buffered: buffered,
            rtt_samples: self.rtt_samples.len(),
            quality: self.quality(),
        }
    }

    /// Forget every sample.
    pub fn reset(&mut self) {
        self.rtt_samples.clear();
        self.chunk_samples.clear();
        self.buffer_samples.clear();
        self.bandwidth = 0.0;
        self.average_bandwidth = None;
        self.peak_bandwidth = 0.0;
    }

    /// Configured ping timeout.
    pub const fn ping_timeout(&self) -> Duration {
        self.config.ping_timeout
    }
}

fn prune<T>(samples: &mut VecDeque<(Instant, T)>, now: Instant, window: Duration) {
    while let Some(&(at, _)) = samples.front() {
        if now.saturating_duration_since(at) > window {
            samples.pop_front();
        } else {
            break;
        }
    }
}

fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Correlates `PING` frames with their `PONG` replies.
#[derive(Debug, Default)]
pub struct RttProbe {
    pending: Mutex<HashMap<String, oneshot::Sender<Instant>>>,
}

impl RttProbe {
    /// Create a probe with no outstanding pings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a `PING` and wait for the matching `PONG`.
    ///
    /// Never fails: a send error or a missing reply within `timeout`
    /// yields [`Duration::ZERO`].
    pub async fn measure(&self, channel: &dyn Channel, timeout: Duration) -> Duration {
        let id = format!("{:016x}", rand::random::<u64>());
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.clone(), tx);
        }

        let started = Instant::now();
        let ping = ControlMessage::Ping(PingPayload { id: id.clone() });
        let sent = match ping.to_frame() {
            Ok(frame) => channel.send(frame).await,
            Err(e) => Err(e),
        };

        let rtt = match sent {
            Ok(()) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(received_at)) => received_at.saturating_duration_since(started),
                _ => {
                    tracing::debug!(ping_id = %id, "RTT probe timed out");
                    Duration::ZERO
                }
            },
            Err(e) => {
                tracing::debug!(ping_id = %id, error = %e, "RTT probe could not be sent");
                Duration::ZERO
            }
        };

        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
        rtt
    }

    /// Resolve an outstanding ping. Returns `false` for unknown ids.
    pub fn resolve(&self, id: &str) -> bool {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(id));
        sender.is_some_and(|tx| tx.send(Instant::now()).is_ok())
    }

    /// Number of pings awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().map_or(0, |pending| pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> NetworkMonitor {
        NetworkMonitor::new(MonitorConfig::default())
    }

    fn feed_bandwidth(monitor: &mut NetworkMonitor, bytes_per_sec: u64) {
        let start = Instant::now();
        monitor.record_chunk_at(1, start);
        monitor.record_chunk_at(bytes_per_sec, start + Duration::from_secs(1));
    }

    #[test]
    fn test_excellent_requires_bandwidth() {
        let mut m = monitor();
        m.record_rtt(Duration::from_millis(40));
        feed_bandwidth(&mut m, 1_500_000); // 12 Mbps
        assert_eq!(m.quality(), NetworkQuality::Excellent);

        let mut m = monitor();
        m.record_rtt(Duration::from_millis(40));
        feed_bandwidth(&mut m, 250_000); // 2 Mbps
        assert_eq!(m.quality(), NetworkQuality::Fair);
    }

    #[test]
    fn test_quality_ladder() {
        let config = MonitorConfig::default();
        let classify = |ms, mbps| {
            NetworkQuality::classify(Some(Duration::from_millis(ms)), Some(mbps), &config)
        };

        assert_eq!(classify(80, 6.0), NetworkQuality::Good);
        assert_eq!(classify(150, 50.0), NetworkQuality::Fair);
        assert_eq!(classify(250, 50.0), NetworkQuality::Poor);
        assert_eq!(classify(20, 0.5), NetworkQuality::Poor);
        assert_eq!(
            NetworkQuality::classify(None, Some(50.0), &config),
            NetworkQuality::Fair
        );
    }

    #[test]
    fn test_rtt_ring_and_jitter() {
        let mut m = NetworkMonitor::new(MonitorConfig {
            rtt_samples: 3,
            ..MonitorConfig::default()
        });
        for ms in [100, 10, 20, 30] {
            m.record_rtt(Duration::from_millis(ms));
        }
        m.record_rtt(Duration::ZERO);

        let metrics = m.metrics();
        assert_eq!(metrics.rtt_samples, 3);
        assert!((metrics.rtt_ms.unwrap() - 20.0).abs() < 0.01);
        assert!((metrics.latest_rtt_ms.unwrap() - 30.0).abs() < 0.01);
        // population stddev of 10, 20, 30
        assert!((metrics.jitter_ms - 8.165).abs() < 0.01);
    }

    #[test]
    fn test_bandwidth_window_peak_and_average() {
        let mut m = monitor();
        let start = Instant::now();
        m.record_chunk_at(0, start);
        m.record_chunk_at(1_000_000, start + Duration::from_secs(1));
        assert!((m.metrics().bandwidth - 1_000_000.0).abs() < 1.0);

        m.record_chunk_at(0, start + Duration::from_secs(2));
        let metrics = m.metrics();
        assert!((metrics.bandwidth - 500_000.0).abs() < 1.0);
        assert!((metrics.peak_bandwidth - 1_000_000.0).abs() < 1.0);
        // EMA: 0.1 * 500k + 0.9 * 1M
        assert!((metrics.average_bandwidth - 950_000.0).abs() < 1.0);
        assert!((metrics.utilization().unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_old_chunks_leave_window() {
        let mut m = monitor();
        let start = Instant::now();
        m.record_chunk_at(5_000_000, start);
        m.record_chunk_at(0, start + Duration::from_secs(11));
        m.record_chunk_at(100_000, start + Duration::from_secs(12));
        assert!((m.metrics().bandwidth - 100_000.0).abs() < 1.0);
    }

    #[test]
    fn test_same_instant_burst_counts_once_time_moves() {
        let mut m = monitor();
        let start = Instant::now();
        for _ in 0..4 {
            m.record_chunk_at(100_000, start);
        }
        assert!(m.metrics().peak_bandwidth.abs() < f64::EPSILON);

        // Everything after the window's first sample counts.
        m.record_chunk_at(100_000, start + Duration::from_secs(1));
        assert!((m.metrics().bandwidth - 400_000.0).abs() < 1.0);
        assert!(m.metrics().peak_bandwidth > 0.0);
    }

    #[test]
    fn test_buffer_average_and_reset() {
        let mut m = monitor();
        let start = Instant::now();
        m.record_buffer_level_at(100, start);
        m.record_buffer_level_at(300, start + Duration::from_secs(1));
        assert!((m.metrics().average_buffered - 200.0).abs() < f64::EPSILON);

        m.record_rtt(Duration::from_millis(10));
        m.reset();
        assert_eq!(m.metrics(), NetworkMetrics::default());
    }

    #[test]
    fn test_resolve_unknown_ping() {
        let probe = RttProbe::new();
        assert!(!probe.resolve("missing"));
        assert_eq!(probe.outstanding(), 0);
    }
}
