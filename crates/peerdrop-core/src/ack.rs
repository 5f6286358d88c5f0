//! Receiver acknowledgment policy.
//!
//! [`AckStrategy::should_send_ack`] decides from the transfer's size tier
//! and progress whether a `FILE_ACK` is due. [`AckStrategy::evaluate`] adds
//! the hard minimum-spacing floor on top; only the final 100% ack bypasses
//! it.

use std::fmt;

use tokio::time::Instant;

use crate::config::AckConfig;

/// Progress of one incoming transfer, as seen by the ack policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    /// Declared file size
    pub file_size: u64,
    /// Bytes received so far
    pub bytes_received: u64,
    /// Percentage carried by the last ack sent
    pub last_acked_percentage: Option<u8>,
    /// When the last ack was sent
    pub last_ack_time: Option<Instant>,
    /// When the transfer started
    pub start_time: Instant,
}

/// Why an ack was or was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReason {
    /// Small file: the percentage went up
    PercentageIncrease,
    /// Medium file: an even percentage was reached
    EvenPercentage,
    /// Large file: the ack interval elapsed
    Interval,
    /// Large file: a milestone percentage was crossed
    Milestone,
    /// The transfer reached 100%
    Final,
    /// Nothing new to report
    NotDue,
    /// 100% was already acknowledged
    AlreadyFinal,
    /// Due, but too soon after the previous ack
    Throttled,
}

impl fmt::Display for AckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PercentageIncrease => "percentage increased",
            Self::EvenPercentage => "even percentage reached",
            Self::Interval => "ack interval elapsed",
            Self::Milestone => "milestone crossed",
            Self::Final => "transfer complete",
            Self::NotDue => "not due",
            Self::AlreadyFinal => "already acknowledged at 100%",
            Self::Throttled => "minimum spacing not met",
        };
        f.write_str(text)
    }
}

/// Result of an ack decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckDecision {
    /// Whether to send a `FILE_ACK`
    pub send: bool,
    /// Reason for the decision
    pub reason: AckReason,
    /// Rounded percentage received
    pub current_percentage: u8,
}

impl AckDecision {
    const fn send(reason: AckReason, current_percentage: u8) -> Self {
        Self {
            send: true,
            reason,
            current_percentage,
        }
    }

    const fn skip(reason: AckReason, current_percentage: u8) -> Self {
        Self {
            send: false,
            reason,
            current_percentage,
        }
    }
}

/// Size-tiered acknowledgment policy.
#[derive(Debug, Clone)]
pub struct AckStrategy {
    config: AckConfig,
}

impl AckStrategy {
    /// Create a strategy.
    pub const fn new(config: AckConfig) -> Self {
        Self { config }
    }

    /// Rounded percentage of `bytes_received` over `file_size`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn percentage(bytes_received: u64, file_size: u64) -> u8 {
        if file_size == 0 {
            return 100;
        }
        let pct = (bytes_received as f64 / file_size as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }

    /// Tiered decision, without the spacing floor.
    pub fn should_send_ack(&self, info: &AckInfo, now: Instant) -> AckDecision {
        let pct = Self::percentage(info.bytes_received, info.file_size);
        let last = info.last_acked_percentage;

        if pct == 100 {
            return if last == Some(100) {
                AckDecision::skip(AckReason::AlreadyFinal, pct)
            } else {
                AckDecision::send(AckReason::Final, pct)
            };
        }

        let increased = last.map_or(pct > 0, |last| pct > last);

        if info.file_size < self.config.small_file_threshold {
            if increased {
                return AckDecision::send(AckReason::PercentageIncrease, pct);
            }
        } else if info.file_size <= self.config.medium_file_threshold {
            if increased && pct % 2 == 0 {
                return AckDecision::send(AckReason::EvenPercentage, pct);
            }
        } else {
            let since = info.last_ack_time.unwrap_or(info.start_time);
            if now.saturating_duration_since(since) >= self.config.large_file_interval {
                return AckDecision::send(AckReason::Interval, pct);
            }
            let step = self.config.large_file_step;
            if pct / step > last.unwrap_or(0) / step {
                return AckDecision::send(AckReason::Milestone, pct);
            }
        }

        AckDecision::skip(AckReason::NotDue, pct)
    }

    /// Tiered decision plus the minimum-spacing floor.
    pub fn evaluate(&self, info: &AckInfo, now: Instant) -> AckDecision {
        let decision = self.should_send_ack(info, now);
        if !decision.send || decision.reason == AckReason::Final {
            return decision;
        }

        let too_soon = info
            .last_ack_time
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.min_spacing);
        if too_soon {
            AckDecision::skip(AckReason::Throttled, decision.current_percentage)
        } else {
            decision
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn strategy() -> AckStrategy {
        AckStrategy::new(AckConfig::default())
    }

    fn info(file_size: u64, bytes_received: u64, last: Option<u8>, start: Instant) -> AckInfo {
        AckInfo {
            file_size,
            bytes_received,
            last_acked_percentage: last,
            last_ack_time: last.map(|_| start),
            start_time: start,
        }
    }

    #[test]
    fn test_small_file_every_point() {
        let s = strategy();
        let now = Instant::now();

        let d = s.should_send_ack(&info(1000, 600, None, now), now);
        assert!(d.send);
        assert_eq!(d.reason, AckReason::PercentageIncrease);
        assert_eq!(d.current_percentage, 60);

        let d = s.should_send_ack(&info(1000, 604, Some(60), now), now);
        assert!(!d.send);
        assert_eq!(d.reason, AckReason::NotDue);

        let d = s.should_send_ack(&info(1000, 0, None, now), now);
        assert!(!d.send);
    }

    #[test]
    fn test_medium_file_even_points() {
        let s = strategy();
        let now = Instant::now();
        let size = 50 * MIB;

        let odd = s.should_send_ack(&info(size, size * 31 / 100, Some(30), now), now);
        assert!(!odd.send);

        let even = s.should_send_ack(&info(size, size * 32 / 100, Some(30), now), now);
        assert!(even.send);
        assert_eq!(even.reason, AckReason::EvenPercentage);
    }

    #[test]
    fn test_large_file_interval_or_milestone() {
        let s = strategy();
        let start = Instant::now();
        let size = 1000 * MIB;

        let quick = s.should_send_ack(&info(size, size * 12 / 100, Some(11), start), start);
        assert!(!quick.send);

        let later = start + Duration::from_millis(500);
        let timed = s.should_send_ack(&info(size, size * 12 / 100, Some(11), start), later);
        assert!(timed.send);
        assert_eq!(timed.reason, AckReason::Interval);

        let milestone = s.should_send_ack(&info(size, size * 15 / 100, Some(14), start), start);
        assert!(milestone.send);
        assert_eq!(milestone.reason, AckReason::Milestone);
    }

    #[test]
    fn test_final_once() {
        let s = strategy();
        let now = Instant::now();

        let d = s.should_send_ack(&info(2000 * MIB, 2000 * MIB, Some(99), now), now);
        assert!(d.send);
        assert_eq!(d.reason, AckReason::Final);

        let d = s.should_send_ack(&info(1000, 1000, Some(100), now), now);
        assert!(!d.send);
        assert_eq!(d.reason, AckReason::AlreadyFinal);
    }

    #[test]
    fn test_spacing_floor() {
        let s = strategy();
        let start = Instant::now();
        let soon = start + Duration::from_millis(100);

        let d = s.evaluate(&info(1000, 700, Some(60), start), soon);
        assert!(!d.send);
        assert_eq!(d.reason, AckReason::Throttled);

        let d = s.evaluate(&info(1000, 700, Some(60), start), start + Duration::from_millis(200));
        assert!(d.send);

        // 100% ignores the floor.
        let d = s.evaluate(&info(1000, 1000, Some(60), start), soon);
        assert!(d.send);
        assert_eq!(d.reason, AckReason::Final);
    }

    #[test]
    fn test_percentage_rounding() {
        assert_eq!(AckStrategy::percentage(5, 1000), 1);
        assert_eq!(AckStrategy::percentage(4, 1000), 0);
        assert_eq!(AckStrategy::percentage(995, 1000), 100);
        assert_eq!(AckStrategy::percentage(0, 0), 100);
    }
}
