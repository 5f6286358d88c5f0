//! UI utilities for the PeerDrop CLI.

use std::io::{self, Write};
use std::time::Duration;

use tokio::sync::watch;

use peerdrop_core::progress::{TransferProgress, TransferState};

/// Format a byte count with binary units.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a throughput in bytes per second.
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_size(bytes_per_second))
}

/// Format a duration as "M:SS", or "--" when unknown.
pub fn format_eta(eta: Option<Duration>) -> String {
    eta.map_or_else(
        || "--".to_string(),
        |d| {
            let total_secs = d.as_secs();
            format!("{}:{:02}", total_secs / 60, total_secs % 60)
        },
    )
}

/// One-line rendering of a progress snapshot.
pub fn progress_line(progress: &TransferProgress) -> String {
    format!(
        "[{:>6.2}%] {} - {} / {} - {} - ETA: {}",
        progress.percentage(),
        progress.file_name,
        format_size(progress.bytes_transferred),
        format_size(progress.total_bytes),
        format_speed(progress.speed_bps),
        format_eta(progress.eta),
    )
}

/// Redraw the progress line whenever the transfer advances.
///
/// Runs until the progress channel closes; callers abort it once the
/// transfer they are watching has finished.
pub async fn display_progress(mut rx: watch::Receiver<TransferProgress>) {
    loop {
        let progress = rx.borrow_and_update().clone();
        if progress.state == TransferState::Transferring {
            print!("\r  {}    ", progress_line(&progress));
            let _ = io::stdout().flush();
        }

        if rx.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0), "0 B/s");
        assert_eq!(format_speed(2048), "2.0 KB/s");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "--");
        assert_eq!(format_eta(Some(Duration::from_secs(65))), "1:05");
        assert_eq!(format_eta(Some(Duration::from_secs(0))), "0:00");
    }

    #[test]
    fn test_progress_line() {
        let progress = TransferProgress {
            state: TransferState::Transferring,
            file_name: "a.bin".to_string(),
            bytes_transferred: 512,
            total_bytes: 1024,
            speed_bps: 1024,
            eta: Some(Duration::from_secs(1)),
            ..TransferProgress::default()
        };

        assert_eq!(
            progress_line(&progress),
            "[ 50.00%] a.bin - 512 B / 1.0 KB - 1.0 KB/s - ETA: 0:01"
        );
    }
}
