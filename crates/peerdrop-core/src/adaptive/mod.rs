//! Network measurement and adaptive chunk sizing.
//!
//! Each [`crate::session::TransferSession`] owns one [`NetworkMonitor`] and
//! one [`ChunkSizeController`]. The sender pipeline feeds the monitor with
//! every chunk it hands to the channel and periodically asks the controller
//! to re-evaluate the chunk size from the monitor's snapshot.

mod controller;
mod monitor;

pub use controller::{
    ChunkSizeController, ChunkSizeRecommendation, ChunkSizeStats, PerformanceSample, Trend,
};
pub use monitor::{NetworkMetrics, NetworkMonitor, NetworkQuality, RttProbe};
