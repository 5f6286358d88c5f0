//! Observable transfer progress.
//!
//! The [`ProgressManager`] publishes two view-models through
//! `tokio::sync::watch` channels:
//!
//! - [`TransferProgress`]: bytes moved by the local side for the current
//!   transfer (sent or received).
//! - [`AckProgress`]: the sender's view of what the peer has acknowledged.
//!   It is written only from received `FILE_ACK`, `FILE_END_ACK` and
//!   `FILE_ERROR` frames, never from the send loop.
//!
//! Both views follow the most recently started transfer. Updates for other
//! transfer ids are ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

/// Direction of a transfer relative to this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// This peer sends the file
    Send,
    /// This peer receives the file
    Receive,
}

/// Transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    /// No transfer yet, or cleared
    Idle,
    /// `FILE_START` sent or received, no data yet
    Started,
    /// Data is flowing
    Transferring,
    /// Transfer completed successfully
    Completed,
    /// Transfer was cancelled
    Cancelled,
    /// Transfer failed
    Failed,
}

impl TransferState {
    /// Whether the transfer is still in flight.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Started | Self::Transferring)
    }
}

/// Progress information for the current transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Transfer id
    pub transfer_id: Option<String>,
    /// Send or receive
    pub direction: Option<TransferDirection>,
    /// Current state
    pub state: TransferState,
    /// File name
    pub file_name: String,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// Declared file size
    pub total_bytes: u64,
    /// Average speed in bytes per second
    pub speed_bps: u64,
    /// Estimated time remaining
    pub eta: Option<Duration>,
    /// When the transfer started
    pub started_at: Instant,
    /// Failure reason, if any
    pub error: Option<String>,
}

impl TransferProgress {
    fn idle() -> Self {
        Self {
            transfer_id: None,
            direction: None,
            state: TransferState::Idle,
            file_name: String::new(),
            bytes_transferred: 0,
            total_bytes: 0,
            speed_bps: 0,
            eta: None,
            started_at: Instant::now(),
            error: None,
        }
    }

    /// Progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.state == TransferState::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }

    fn is_for(&self, transfer_id: &str) -> bool {
        self.transfer_id.as_deref() == Some(transfer_id)
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::idle()
    }
}

/// Acknowledgment status seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// No acknowledgment received yet
    Waiting,
    /// The peer is acknowledging data
    Acknowledging,
    /// The peer confirmed the end of the transfer
    Completed,
    /// The transfer failed
    Error,
}

/// Sender's view of the receiver's acknowledgments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckProgress {
    /// Transfer id
    pub transfer_id: Option<String>,
    /// Bytes the peer has acknowledged
    pub bytes_acknowledged: u64,
    /// Percentage the peer has acknowledged
    pub percentage: u8,
    /// Status
    pub status: AckStatus,
}

impl Default for AckProgress {
    fn default() -> Self {
        Self {
            transfer_id: None,
            bytes_acknowledged: 0,
            percentage: 0,
            status: AckStatus::Waiting,
        }
    }
}

/// Publishes progress view-models for one peer.
#[derive(Debug)]
pub struct ProgressManager {
    progress_tx: watch::Sender<TransferProgress>,
    ack_tx: watch::Sender<AckProgress>,
    ack_total: AtomicU64,
}

impl ProgressManager {
    /// Create a manager with idle views.
    pub fn new() -> Self {
        let (progress_tx, _) = watch::channel(TransferProgress::idle());
        let (ack_tx, _) = watch::channel(AckProgress::default());
        Self {
            progress_tx,
            ack_tx,
            ack_total: AtomicU64::new(0),
        }
    }

    /// Subscribe to transfer progress.
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress_tx.subscribe()
    }

    /// Subscribe to acknowledgment progress.
    pub fn ack_progress(&self) -> watch::Receiver<AckProgress> {
        self.ack_tx.subscribe()
    }

    /// Current transfer progress.
    pub fn snapshot(&self) -> TransferProgress {
        self.progress_tx.borrow().clone()
    }

    /// Current acknowledgment progress.
    pub fn ack_snapshot(&self) -> AckProgress {
        self.ack_tx.borrow().clone()
    }

    /// Whether the current transfer is in flight.
    pub fn is_transferring(&self) -> bool {
        self.progress_tx.borrow().state.is_active()
    }

    /// Begin tracking a transfer.
    pub fn start(
        &self,
        transfer_id: &str,
        file_name: &str,
        total_bytes: u64,
        direction: TransferDirection,
    ) {
        self.progress_tx.send_replace(TransferProgress {
            transfer_id: Some(transfer_id.to_string()),
            direction: Some(direction),
            state: TransferState::Started,
            file_name: file_name.to_string(),
            total_bytes,
            ..TransferProgress::idle()
        });
    }

    /// Report the cumulative byte count. Never moves backwards.
    pub fn update(&self, transfer_id: &str, bytes_transferred: u64) {
        self.progress_tx.send_if_modified(|progress| {
            if !progress.is_for(transfer_id) || !progress.state.is_active() {
                return false;
            }

            progress.state = TransferState::Transferring;
            progress.bytes_transferred = progress.bytes_transferred.max(bytes_transferred);

            let elapsed = progress.started_at.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                #[allow(
                    clippy::cast_precision_loss,
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss
                )]
                let speed = (progress.bytes_transferred as f64 / elapsed) as u64;
                progress.speed_bps = speed;
                let remaining = progress.total_bytes.saturating_sub(progress.bytes_transferred);
                progress.eta = (speed > 0)
                    .then(|| Duration::from_secs_f64(remaining as f64 / speed as f64));
            }
            true
        });
    }

    /// Mark the transfer as completed.
    pub fn complete(&self, transfer_id: &str) {
        self.finish(transfer_id, TransferState::Completed, None);
    }

    /// Mark the transfer as failed.
    pub fn fail(&self, transfer_id: &str, reason: &str) {
        self.finish(transfer_id, TransferState::Failed, Some(reason));
        self.ack_error(transfer_id);
    }

    /// Mark the transfer as cancelled.
    pub fn cancel(&self, transfer_id: &str) {
        self.finish(transfer_id, TransferState::Cancelled, Some("cancelled"));
        self.ack_error(transfer_id);
    }

    fn finish(&self, transfer_id: &str, state: TransferState, reason: Option<&str>) {
        self.progress_tx.send_if_modified(|progress| {
            if !progress.is_for(transfer_id) || !progress.state.is_active() {
                return false;
            }
            progress.state = state;
            progress.eta = None;
            if state == TransferState::Completed {
                progress.bytes_transferred = progress.bytes_transferred.max(progress.total_bytes);
            }
            progress.error = reason.map(str::to_string);
            true
        });
    }

    /// Reset both views to idle.
    pub fn clear(&self) {
        self.progress_tx.send_replace(TransferProgress::idle());
        self.ack_tx.send_replace(AckProgress::default());
        self.ack_total.store(0, Ordering::Release);
    }

    /// Begin tracking acknowledgments for an outgoing transfer.
    pub fn ack_start(&self, transfer_id: &str, total_bytes: u64) {
        self.ack_total.store(total_bytes, Ordering::Release);
        self.ack_tx.send_replace(AckProgress {
            transfer_id: Some(transfer_id.to_string()),
            ..AckProgress::default()
        });
    }

    /// Apply a received `FILE_ACK`. Never moves backwards.
    pub fn ack_update(&self, transfer_id: &str, percentage: u8, bytes_received: Option<u64>) {
        let total = self.ack_total.load(Ordering::Acquire);
        self.ack_tx.send_if_modified(|ack| {
            if ack.transfer_id.as_deref() != Some(transfer_id)
                || matches!(ack.status, AckStatus::Completed | AckStatus::Error)
            {
                return false;
            }
            let percentage = percentage.min(100);
            let bytes = bytes_received
                .unwrap_or_else(|| total * u64::from(percentage) / 100)
                .min(total);
            ack.percentage = ack.percentage.max(percentage);
            ack.bytes_acknowledged = ack.bytes_acknowledged.max(bytes);
            ack.status = AckStatus::Acknowledging;
            true
        });
    }

    /// Apply a received `FILE_END_ACK`.
    pub fn ack_complete(&self, transfer_id: &str) {
        let total = self.ack_total.load(Ordering::Acquire);
        self.ack_tx.send_if_modified(|ack| {
            if ack.transfer_id.as_deref() != Some(transfer_id) || ack.status == AckStatus::Error {
                return false;
            }
            ack.percentage = 100;
            ack.bytes_acknowledged = total;
            ack.status = AckStatus::Completed;
            true
        });
    }

    /// Tag acknowledgment progress as failed.
    pub fn ack_error(&self, transfer_id: &str) {
        self.ack_tx.send_if_modified(|ack| {
            if ack.transfer_id.as_deref() != Some(transfer_id) || ack.status == AckStatus::Completed
            {
                return false;
            }
            ack.status = AckStatus::Error;
            true
        });
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_progress_lifecycle() {
        let manager = ProgressManager::new();
        let rx = manager.progress();

        manager.start("t1", "a.bin", 1000, TransferDirection::Receive);
        assert!(manager.is_transferring());
        assert_eq!(rx.borrow().state, TransferState::Started);

        tokio::time::advance(Duration::from_secs(1)).await;
        manager.update("t1", 600);
        manager.update("t1", 400);
        {
            let progress = rx.borrow();
            assert_eq!(progress.state, TransferState::Transferring);
            assert_eq!(progress.bytes_transferred, 600);
            assert_eq!(progress.speed_bps, 600);
            assert!(progress.eta.is_some());
        }

        manager.complete("t1");
        assert_eq!(rx.borrow().state, TransferState::Completed);
        assert!((rx.borrow().percentage() - 100.0).abs() < f64::EPSILON);
        assert!(!manager.is_transferring());

        manager.fail("t1", "late error");
        assert_eq!(rx.borrow().state, TransferState::Completed);
    }

    #[test]
    fn test_updates_for_other_transfer_ignored() {
        let manager = ProgressManager::new();
        manager.start("t1", "a.bin", 1000, TransferDirection::Receive);
        manager.update("t2", 900);
        manager.fail("t2", "boom");

        let progress = manager.snapshot();
        assert_eq!(progress.bytes_transferred, 0);
        assert_eq!(progress.state, TransferState::Started);
    }

    #[test]
    fn test_fail_marks_ack_error() {
        let manager = ProgressManager::new();
        manager.start("t1", "a.bin", 1000, TransferDirection::Send);
        manager.ack_start("t1", 1000);

        manager.fail("t1", "stalled");

        assert_eq!(manager.snapshot().state, TransferState::Failed);
        assert_eq!(manager.snapshot().error.as_deref(), Some("stalled"));
        assert_eq!(manager.ack_snapshot().status, AckStatus::Error);
    }

    #[test]
    fn test_ack_progress() {
        let manager = ProgressManager::new();
        manager.ack_start("t1", 2000);
        assert_eq!(manager.ack_snapshot().status, AckStatus::Waiting);

        manager.ack_update("t1", 50, None);
        manager.ack_update("t1", 30, None);
        let ack = manager.ack_snapshot();
        assert_eq!(ack.status, AckStatus::Acknowledging);
        assert_eq!(ack.percentage, 50);
        assert_eq!(ack.bytes_acknowledged, 1000);

        manager.ack_complete("t1");
        let ack = manager.ack_snapshot();
        assert_eq!(ack.status, AckStatus::Completed);
        assert_eq!(ack.bytes_acknowledged, 2000);

        manager.ack_error("t1");
        assert_eq!(manager.ack_snapshot().status, AckStatus::Completed);
    }

    #[test]
    fn test_clear() {
        let manager = ProgressManager::new();
        manager.start("t1", "a.bin", 10, TransferDirection::Send);
        manager.clear();
        assert_eq!(manager.snapshot().state, TransferState::Idle);
        assert_eq!(manager.ack_snapshot(), AckProgress::default());
    }
}
