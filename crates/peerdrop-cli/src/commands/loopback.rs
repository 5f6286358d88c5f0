//! Loopback command implementation.
//!
//! Runs a host and a client session in one process, joined by an in-memory
//! data channel, and sends each file from the host to the client through
//! the full protocol: start, chunked data with acknowledgments, end
//! handshake and completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::broadcast;

use peerdrop_core::channel::MemoryChannelOptions;
use peerdrop_core::config::parse_duration;
use peerdrop_core::{
    memory_pair_with, PeerRole, ReceivedFile, SentFile, TransferEvent, TransferSession,
};

use super::LoopbackArgs;
use crate::ui;

/// How long to wait for the client to surface a file the host saw acknowledged.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one file.
struct Delivery {
    sent: SentFile,
    received: ReceivedFile,
    saved_to: Option<PathBuf>,
}

/// Run the loopback command.
pub async fn run(args: LoopbackArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(mode) = args.compress {
        config.transfer.compression = mode.into();
    }

    let latency =
        parse_duration(&args.latency).map_err(|e| anyhow!("Invalid --latency: {}", e))?;
    let options = MemoryChannelOptions {
        latency,
        binary_as_blob: args.blob,
    };

    if let Some(dir) = &args.output {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let (host_end, client_end) = memory_pair_with(options);
    let host = TransferSession::new(PeerRole::Host, Arc::new(host_end), config.clone())?;
    let client = TransferSession::new(PeerRole::Client, Arc::new(client_end), config)?;
    let mut client_events = client.subscribe();

    let rtt = host.measure_rtt().await;
    if !args.json {
        println!();
        println!("  Loopback link: {:?} RTT", rtt);
        println!();
    }

    let mut deliveries = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        let delivery =
            transfer_one(&host, &mut client_events, path, args.output.as_deref(), args.json)
                .await;
        match delivery {
            Ok(delivery) => deliveries.push(delivery),
            Err(e) => {
                host.shutdown().await;
                client.shutdown().await;
                return Err(e.context(format!("Transfer of {} failed", path.display())));
            }
        }
    }

    let metrics = host.network_metrics().await;
    let stats = host.chunk_size_stats().await;
    host.shutdown().await;
    client.shutdown().await;

    if args.json {
        let files: Vec<_> = deliveries
            .iter()
            .map(|d| {
                serde_json::json!({
                    "transfer_id": d.sent.transfer_id,
                    "file_name": d.sent.file_name,
                    "bytes": d.sent.total_bytes,
                    "checksum": d.sent.checksum,
                    "verified": d.received.checksum == d.sent.checksum,
                    "elapsed_ms": d.sent.elapsed.as_millis(),
                    "chunks": d.sent.chunks,
                    "skipped_chunks": d.sent.skipped_chunks,
                    "saved_to": d.saved_to,
                })
            })
            .collect();
        let output = serde_json::json!({
            "rtt_ms": rtt.as_secs_f64() * 1000.0,
            "files": files,
            "network": metrics,
            "chunking": stats,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!();
    println!("  Summary");
    println!("  {}", "─".repeat(48));
    for d in &deliveries {
        let verified = if d.received.checksum == d.sent.checksum {
            "ok"
        } else {
            "MISMATCH"
        };
        println!(
            "  {} - {} in {:.2}s ({} chunks, checksum {})",
            d.sent.file_name,
            ui::format_size(d.sent.total_bytes),
            d.sent.elapsed.as_secs_f64(),
            d.sent.chunks,
            verified
        );
        if d.sent.skipped_chunks > 0 {
            println!("    {} chunk(s) were abandoned", d.sent.skipped_chunks);
        }
        if let Some(saved) = &d.saved_to {
            println!("    saved to {}", saved.display());
        }
    }
    println!();
    println!(
        "  Link: {} - final chunk size {} after {} adaptation(s)",
        metrics.quality,
        ui::format_size(stats.current_chunk_size as u64),
        stats.adaptations
    );
    println!();

    Ok(())
}

async fn transfer_one(
    host: &TransferSession,
    client_events: &mut broadcast::Receiver<TransferEvent>,
    path: &Path,
    output: Option<&Path>,
    quiet: bool,
) -> Result<Delivery> {
    let display = (!quiet).then(|| tokio::spawn(ui::display_progress(host.transfer_progress())));
    let sent = host.send_file(path).await;
    if let Some(display) = display {
        display.abort();
        println!();
    }
    let sent = sent.map_err(|e| describe(&e))?;

    let received = tokio::time::timeout(
        DELIVERY_TIMEOUT,
        wait_for_delivery(client_events, &sent.transfer_id),
    )
    .await
    .context("Receiver never delivered the file")??;

    let saved_to = match output {
        Some(dir) => Some(save(dir, &received).await?),
        None => None,
    };

    Ok(Delivery {
        sent,
        received,
        saved_to,
    })
}

async fn wait_for_delivery(
    events: &mut broadcast::Receiver<TransferEvent>,
    transfer_id: &str,
) -> Result<ReceivedFile> {
    loop {
        match events.recv().await {
            Ok(TransferEvent::Complete(file)) if file.transfer_id == transfer_id => {
                return Ok(file)
            }
            Ok(TransferEvent::Error {
                transfer_id: id,
                message,
            }) if id == transfer_id => bail!("Receiver failed: {}", message),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => bail!("Receiver session closed"),
        }
    }
}

/// Write a received file under `dir`, keeping only the final path component
/// of the announced name.
async fn save(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    let name = Path::new(&file.file_name)
        .file_name()
        .ok_or_else(|| anyhow!("Refusing to save file with name {:?}", file.file_name))?;
    let target = dir.join(name);
    tokio::fs::write(&target, &file.data)
        .await
        .with_context(|| format!("Failed to write {}", target.display()))?;
    Ok(target)
}

/// Attach the error's code and suggestion, when it has them.
fn describe(error: &peerdrop_core::Error) -> anyhow::Error {
    let mut message = error.to_string();
    if let Some(code) = error.code() {
        message = format!("[{}] {}", code, message);
    }
    if let Some(suggestion) = error.suggestion() {
        message = format!("{}\n\n{}", message, suggestion);
    }
    anyhow!(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(name: &str, data: &'static [u8]) -> ReceivedFile {
        ReceivedFile {
            transfer_id: "t1".to_string(),
            file_name: name.to_string(),
            data: data.into(),
            declared_size: data.len() as u64,
            checksum: String::new(),
        }
    }

    #[tokio::test]
    async fn test_save_strips_directories() {
        let dir = tempfile::tempdir().unwrap();

        let path = save(dir.path(), &received("../../etc/evil.txt", b"x"))
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("evil.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_save_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        assert!(save(dir.path(), &received("..", b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_transfer_one_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("hello.txt");
        std::fs::write(&source, b"hello loopback").unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let (a, b) = peerdrop_core::memory_pair();
        let config = peerdrop_core::Config::default();
        let host = TransferSession::new(PeerRole::Host, Arc::new(a), config.clone()).unwrap();
        let client = TransferSession::new(PeerRole::Client, Arc::new(b), config).unwrap();
        let mut events = client.subscribe();

        let delivery = transfer_one(&host, &mut events, &source, Some(&out), true)
            .await
            .unwrap();

        assert_eq!(&delivery.received.data[..], b"hello loopback");
        assert_eq!(delivery.received.checksum, delivery.sent.checksum);
        assert_eq!(
            std::fs::read(out.join("hello.txt")).unwrap(),
            b"hello loopback"
        );
    }

    #[test]
    fn test_describe_includes_code() {
        let message = describe(&peerdrop_core::Error::ProtocolError("bad frame".into())).to_string();
        assert!(message.starts_with("[PD001] "));
        assert!(message.contains("bad frame"));

        let message = describe(&peerdrop_core::Error::FileNotFound("a.bin".into())).to_string();
        assert!(!message.starts_with('['));
    }
}
