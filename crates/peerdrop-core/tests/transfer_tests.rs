//! End-to-end transfer tests over an in-memory channel pair.

mod common;

use std::time::Duration;

use bytes::Bytes;

use peerdrop_core::channel::{Channel, MemoryChannelOptions};
use peerdrop_core::codec::{self, CompressionAlgorithm, CompressionMode};
use peerdrop_core::progress::{AckStatus, TransferState};
use peerdrop_core::protocol::{ControlMessage, DataFrame, FileStartPayload, Frame};
use peerdrop_core::{Config, Error, TransferEvent};

use common::{
    create_temp_dir, create_test_file, next_error, next_received, random_bytes, session_pair,
    session_pair_with,
};

/// Send raw frames from the host end, bypassing the host session.
async fn send_raw(channel: &dyn Channel, frames: Vec<Frame>) {
    for frame in frames {
        channel.send(frame).await.expect("raw send");
    }
}

fn start_frame(transfer_id: &str, file_name: &str, file_size: u64) -> Frame {
    ControlMessage::FileStart(FileStartPayload {
        transfer_id: transfer_id.to_string(),
        file_name: file_name.to_string(),
        file_size,
        compression: CompressionAlgorithm::None,
    })
    .to_frame()
    .expect("encode FILE_START")
}

fn data_frame(transfer_id: &str, offset: u32, payload: &[u8]) -> Frame {
    DataFrame::new(transfer_id, offset, Bytes::copy_from_slice(payload))
        .to_frame()
        .expect("encode FILE_DATA")
}

#[tokio::test]
async fn test_small_transfer_handshake() {
    let pair = session_pair();
    let mut client_events = pair.client.subscribe();
    let mut host_events = pair.host.subscribe();
    let data = random_bytes(1000);

    let sent = pair.host.send_bytes("a.bin", data.clone()).await.unwrap();
    let received = next_received(&mut client_events).await;

    assert_eq!(received.file_name, "a.bin");
    assert_eq!(received.declared_size, 1000);
    assert_eq!(&received.data[..], &data[..]);
    assert_eq!(received.checksum, sent.checksum);
    assert_eq!(sent.chunks, 1);

    let ack = pair.host.ack_progress().borrow().clone();
    assert_eq!(ack.status, AckStatus::Completed);
    assert_eq!(ack.bytes_acknowledged, 1000);
    assert!(!pair.host.is_transferring());

    let mut saw_sent = false;
    while let Ok(event) = host_events.try_recv() {
        if let TransferEvent::Sent(summary) = event {
            assert_eq!(summary.transfer_id, sent.transfer_id);
            saw_sent = true;
        }
    }
    assert!(saw_sent);
}

#[tokio::test]
async fn test_multi_chunk_transfer_from_file() {
    let dir = create_temp_dir();
    let content = random_bytes(300 * 1024);
    let path = create_test_file(dir.path(), "photo.raw", &content);

    let pair = session_pair();
    let mut client_events = pair.client.subscribe();

    let sent = pair.host.send_file(&path).await.unwrap();
    let received = next_received(&mut client_events).await;

    assert_eq!(received.file_name, "photo.raw");
    assert_eq!(received.data.len(), content.len());
    assert_eq!(&received.data[..], &content[..]);
    assert_eq!(sent.checksum, codec::checksum(&content));
    assert!(sent.chunks >= 5);
    assert_eq!(sent.skipped_chunks, 0);
    assert_eq!(
        pair.client.transfer_progress().borrow().state,
        TransferState::Completed
    );
}

#[tokio::test]
async fn test_missing_file() {
    let dir = create_temp_dir();
    let pair = session_pair();

    let result = pair.host.send_file(dir.path().join("nope.bin")).await;
    assert!(matches!(result, Err(Error::FileNotFound(_))));
}

#[tokio::test]
async fn test_compressed_transfer() {
    let mut config = Config::default();
    config.transfer.compression = CompressionMode::Always;
    let pair = session_pair_with(config, MemoryChannelOptions::default());
    let mut client_events = pair.client.subscribe();

    let text = "the quick brown fox jumps over the lazy dog\n".repeat(10_000);
    pair.host
        .send_bytes("notes.txt", text.clone().into_bytes())
        .await
        .unwrap();
    let received = next_received(&mut client_events).await;

    assert_eq!(&received.data[..], text.as_bytes());
}

#[tokio::test]
async fn test_auto_compression_skips_archives() {
    let pair = session_pair();
    let mut client_events = pair.client.subscribe();
    let data = random_bytes(70_000);

    pair.host.send_bytes("bundle.zip", data.clone()).await.unwrap();
    let received = next_received(&mut client_events).await;

    assert_eq!(&received.data[..], &data[..]);
}

#[tokio::test(start_paused = true)]
async fn test_latency_and_blob_frames() {
    let options = MemoryChannelOptions {
        latency: Duration::from_millis(5),
        binary_as_blob: true,
    };
    // A low high-water mark paces chunks onto distinct instants, which the
    // bandwidth estimate needs under a paused clock.
    let mut config = Config::default();
    config.chunk.buffer_high_water = 64 * 1024;
    let pair = session_pair_with(config, options);
    let mut client_events = pair.client.subscribe();
    let data = random_bytes(512 * 1024);

    let rtt = pair.host.measure_rtt().await;
    assert_eq!(rtt, Duration::from_millis(10));

    pair.host.send_bytes("video.mp4", data.clone()).await.unwrap();
    let received = next_received(&mut client_events).await;

    assert_eq!(&received.data[..], &data[..]);
    let metrics = pair.host.network_metrics().await;
    let rtt_ms = metrics.rtt_ms.expect("rtt recorded");
    assert!((rtt_ms - 10.0).abs() < 0.001);
    assert!(metrics.peak_bandwidth > 0.0);
}

#[tokio::test]
async fn test_chunk_size_adapts_without_explicit_rtt() {
    let pair = session_pair();
    let mut client_events = pair.client.subscribe();
    let data = random_bytes(8 * 1024 * 1024);

    pair.host.send_bytes("big.bin", data.clone()).await.unwrap();
    let received = next_received(&mut client_events).await;
    assert_eq!(received.data.len(), data.len());

    let metrics = pair.host.network_metrics().await;
    assert!(metrics.rtt_samples > 0);
    let stats = pair.host.chunk_size_stats().await;
    assert!(stats.adaptations > 0);
}

#[tokio::test]
async fn test_file_info_announcement() {
    let pair = session_pair();
    let mut client_events = pair.client.subscribe();

    let id = pair.host.send_file_info("report.pdf", 2048).await.unwrap();

    loop {
        if let TransferEvent::FileInfoReceived {
            transfer_id,
            file_name,
            file_size,
        } = client_events.recv().await.unwrap()
        {
            assert_eq!(transfer_id, id);
            assert_eq!(file_name, "report.pdf");
            assert_eq!(file_size, 2048);
            break;
        }
    }
    assert!(pair.client.received_file().is_none());
}

#[tokio::test]
async fn test_garbage_frames_ignored() {
    let pair = session_pair();
    let mut client_events = pair.client.subscribe();

    send_raw(
        pair.host_channel.as_ref(),
        vec![
            Frame::Text("not json".to_string()),
            Frame::Text(r#"{"type":42,"transferId":"x"}"#.to_string()),
            Frame::Text(r#"{"type":2,"transferId":"x"}"#.to_string()),
            Frame::Binary(Bytes::from_static(b"short")),
            data_frame("unknown", 0, b"orphan"),
        ],
    )
    .await;

    pair.host.send_bytes("after.txt", "still works").await.unwrap();
    let received = next_received(&mut client_events).await;
    assert_eq!(&received.data[..], b"still works");
}

#[tokio::test]
async fn test_duplicate_start_restarts_transfer() {
    let pair = session_pair();
    let mut client_events = pair.client.subscribe();

    send_raw(
        pair.host_channel.as_ref(),
        vec![
            start_frame("t1", "a.bin", 10),
            data_frame("t1", 0, b"01234"),
            start_frame("t1", "b.bin", 3),
            data_frame("t1", 0, b"abc"),
            ControlMessage::file_end("t1").to_frame().unwrap(),
        ],
    )
    .await;

    let (id, message) = next_error(&mut client_events).await;
    assert_eq!(id, "t1");
    assert!(message.contains("superseded"));

    let received = next_received(&mut client_events).await;
    assert_eq!(received.file_name, "b.bin");
    assert_eq!(&received.data[..], b"abc");
}

#[tokio::test]
async fn test_overflowing_chunk_fails_transfer() {
    let pair = session_pair();
    let mut client_events = pair.client.subscribe();

    send_raw(
        pair.host_channel.as_ref(),
        vec![
            start_frame("t1", "a.bin", 1000),
            data_frame("t1", 900, &[0u8; 200]),
        ],
    )
    .await;

    let (id, message) = next_error(&mut client_events).await;
    assert_eq!(id, "t1");
    assert!(message.contains("exceeds buffer"));
    assert_eq!(
        pair.client.transfer_progress().borrow().state,
        TransferState::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn test_stalled_transfer_times_out() {
    let pair = session_pair();
    let mut client_events = pair.client.subscribe();

    send_raw(
        pair.host_channel.as_ref(),
        vec![start_frame("t1", "a.bin", 1000), data_frame("t1", 0, &[1u8; 100])],
    )
    .await;

    let (id, message) = next_error(&mut client_events).await;
    assert_eq!(id, "t1");
    assert!(message.contains("no progress detected"));
    assert!(!pair.client.is_transferring());
}
