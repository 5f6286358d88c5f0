//! Common test utilities for `PeerDrop` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

use peerdrop_core::channel::{memory_pair_with, MemoryChannel, MemoryChannelOptions};
use peerdrop_core::{Config, PeerRole, ReceivedFile, TransferEvent, TransferSession};

/// Two sessions joined by an in-memory channel, plus the raw channel ends.
pub struct SessionPair {
    pub host: TransferSession,
    pub client: TransferSession,
    pub host_channel: Arc<MemoryChannel>,
    pub client_channel: Arc<MemoryChannel>,
}

/// Build a connected host/client pair with default configuration.
pub fn session_pair() -> SessionPair {
    session_pair_with(Config::default(), MemoryChannelOptions::default())
}

/// Build a connected host/client pair.
pub fn session_pair_with(config: Config, options: MemoryChannelOptions) -> SessionPair {
    let (a, b) = memory_pair_with(options);
    let host_channel = Arc::new(a);
    let client_channel = Arc::new(b);

    let host = TransferSession::new(PeerRole::Host, host_channel.clone(), config.clone())
        .expect("Failed to create host session");
    let client = TransferSession::new(PeerRole::Client, client_channel.clone(), config)
        .expect("Failed to create client session");

    SessionPair {
        host,
        client,
        host_channel,
        client_channel,
    }
}

/// Wait for the next received file.
pub async fn next_received(events: &mut broadcast::Receiver<TransferEvent>) -> ReceivedFile {
    loop {
        match events.recv().await.expect("event stream closed") {
            TransferEvent::Complete(file) => return file,
            TransferEvent::Error { message, .. } => panic!("transfer failed: {message}"),
            _ => {}
        }
    }
}

/// Wait for the next transfer error.
pub async fn next_error(events: &mut broadcast::Receiver<TransferEvent>) -> (String, String) {
    loop {
        if let TransferEvent::Error {
            transfer_id,
            message,
        } = events.recv().await.expect("event stream closed")
        {
            return (transfer_id, message);
        }
    }
}

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
