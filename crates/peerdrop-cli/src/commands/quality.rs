//! Quality command implementation.
//!
//! Shows how the adaptive chunking and stall detection would treat a link
//! with the given characteristics, using the active configuration.

use std::time::Duration;

use anyhow::{anyhow, Result};

use peerdrop_core::adaptive::{
    ChunkSizeController, ChunkSizeRecommendation, NetworkMetrics, NetworkQuality,
};
use peerdrop_core::config::parse_duration;
use peerdrop_core::timeout::TimeoutCalculator;
use peerdrop_core::Config;

use super::QualityArgs;
use crate::ui::format_size;

/// Window over which the stall timeout estimate assumes data has flowed.
const SAMPLE_WINDOW: Duration = Duration::from_secs(10);

/// Run the quality command.
pub async fn run(args: QualityArgs) -> Result<()> {
    let config = super::load_config();

    let rtt = args
        .rtt
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|e| anyhow!("Invalid --rtt: {}", e))?;
    if let Some(mbps) = args.bandwidth {
        if !mbps.is_finite() || mbps < 0.0 {
            return Err(anyhow!("Invalid --bandwidth: {}", mbps));
        }
    }

    let metrics = link_metrics(rtt, args.bandwidth, &config);
    let recommendation =
        ChunkSizeController::new(config.chunk.clone()).calculate_optimal_chunk_size(&metrics);
    let timeout = args
        .size
        .map(|size| stall_timeout(size, args.bandwidth, &config));

    if args.json {
        output_json(&metrics, &recommendation, args.size, timeout)?;
    } else {
        output_text(&metrics, &recommendation, args.size, timeout);
    }
    Ok(())
}

/// Metrics as the monitor would report them after observing this link.
fn link_metrics(rtt: Option<Duration>, mbps: Option<f64>, config: &Config) -> NetworkMetrics {
    let rtt_ms = rtt.map(|d| d.as_secs_f64() * 1000.0);
    let bytes_per_sec = mbps.map_or(0.0, |m| m * 1_000_000.0 / 8.0);

    NetworkMetrics {
        rtt_ms,
        latest_rtt_ms: rtt_ms,
        bandwidth: bytes_per_sec,
        average_bandwidth: bytes_per_sec,
        rtt_samples: usize::from(rtt.is_some()),
        quality: NetworkQuality::classify(rtt, mbps, &config.monitor),
        ..NetworkMetrics::default()
    }
}

/// Stall timeout for a file of `size` bytes once data has flowed for a while.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn stall_timeout(size: u64, mbps: Option<f64>, config: &Config) -> Duration {
    let calculator = TimeoutCalculator::new(config.timeout.clone());
    let received = mbps.map_or(0, |m| {
        let bytes = m * 1_000_000.0 / 8.0 * SAMPLE_WINDOW.as_secs_f64();
        (bytes as u64).min(size)
    });

    let started = tokio::time::Instant::now();
    calculator.calculate_at(size, received, started, None, started + SAMPLE_WINDOW)
}

fn output_json(
    metrics: &NetworkMetrics,
    recommendation: &ChunkSizeRecommendation,
    size: Option<u64>,
    timeout: Option<Duration>,
) -> Result<()> {
    let output = serde_json::json!({
        "quality": metrics.quality,
        "rtt_ms": metrics.rtt_ms,
        "bandwidth_mbps": metrics.bandwidth_mbps(),
        "recommendation": recommendation,
        "file_size": size,
        "stall_timeout_ms": timeout.map(|t| t.as_millis()),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn output_text(
    metrics: &NetworkMetrics,
    recommendation: &ChunkSizeRecommendation,
    size: Option<u64>,
    timeout: Option<Duration>,
) {
    println!();
    println!("PeerDrop Link Quality");
    println!("{}", "─".repeat(50));
    println!();
    println!("  Quality:     {}", metrics.quality);
    match metrics.rtt_ms {
        Some(rtt) => println!("  RTT:         {:.1} ms", rtt),
        None => println!("  RTT:         unknown"),
    }
    println!("  Bandwidth:   {:.2} Mbps", metrics.bandwidth_mbps());
    println!();
    println!(
        "  Chunk size:  {} (x{:.2}, confidence {:.0}%)",
        format_size(recommendation.chunk_size as u64),
        recommendation.adaptation_factor,
        recommendation.confidence * 100.0
    );
    for reason in &recommendation.reasoning {
        println!("    - {}", reason);
    }

    if let (Some(size), Some(timeout)) = (size, timeout) {
        println!();
        println!(
            "  Stall timeout for {}: {:.1}s",
            format_size(size),
            timeout.as_secs_f64()
        );
    }
    println!();
}
