//! Per-peer transfer session.
//!
//! A [`TransferSession`] binds one [`Channel`] to the transfer core. It owns
//! the peer's message queue and event loop, its network monitor and chunk
//! size controller, and its progress views.
//!
//! Every input (inbound frame, channel state change, stall timer expiry,
//! cancel request) becomes a [`PeerEvent`] in the peer's queue, so the
//! receive state is only ever touched by one handler at a time. Outgoing
//! transfers run as their own futures and receive replies from the event
//! loop through the [`OutgoingTransfers`] registry.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use peerdrop_core::{channel::memory_pair, config::Config, session::{PeerRole, TransferSession}};
//!
//! let (a, b) = memory_pair();
//! let host = TransferSession::new(PeerRole::Host, Arc::new(a), Config::default())?;
//! let client = TransferSession::new(PeerRole::Client, Arc::new(b), Config::default())?;
//!
//! let sent = host.send_bytes("hello.txt", "hello world").await?;
//! ```

use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adaptive::{
    ChunkSizeController, ChunkSizeStats, NetworkMetrics, NetworkMonitor, RttProbe,
};
use crate::channel::{Channel, ChannelEvent, ChannelState};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::progress::{AckProgress, ProgressManager, TransferDirection, TransferProgress};
use crate::protocol::{self, ControlMessage, FileInfoPayload, Frame, Inbound};
use crate::queue::{MessageQueue, QueueHandler};
use crate::reassembly::{Effect, ReceivedFile, StallNotifier, StreamReassembler};
use crate::sender::{self, Abort, OutgoingTransfers, SendContext, SendRequest, SentFile};

/// Capacity of the lifecycle event broadcast.
const EVENT_CAPACITY: usize = 256;

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Created the connection
    Host,
    /// Joined the connection
    Client,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Lifecycle notifications published by a session.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A transfer began
    Started {
        /// Transfer id
        transfer_id: String,
        /// File name
        file_name: String,
        /// Declared size
        file_size: u64,
        /// Send or receive
        direction: TransferDirection,
    },
    /// Bytes were received
    Progress {
        /// Transfer id
        transfer_id: String,
        /// Bytes received so far
        bytes_received: u64,
        /// Declared size
        file_size: u64,
    },
    /// The peer announced a file with `FILE_INFO`
    FileInfoReceived {
        /// Transfer id
        transfer_id: String,
        /// File name
        file_name: String,
        /// Size in bytes
        file_size: u64,
    },
    /// A file was received
    Complete(ReceivedFile),
    /// A file was sent and acknowledged
    Sent(SentFile),
    /// A transfer failed or was cancelled
    Error {
        /// Transfer id
        transfer_id: String,
        /// Human-readable cause
        message: String,
    },
}

/// An input to a peer's event loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// An inbound frame
    Frame(Frame),
    /// The channel changed state
    ChannelState(ChannelState),
    /// A stall timer expired
    StallCheck {
        /// Transfer id
        transfer_id: String,
        /// Generation the timer was armed with
        generation: u64,
    },
    /// Cancel one transfer, or all of them
    Cancel(Option<String>),
}

struct EventLoop {
    role: PeerRole,
    channel: Arc<dyn Channel>,
    queue: MessageQueue<PeerEvent>,
    reassembler: StreamReassembler,
    outgoing: Arc<OutgoingTransfers>,
    progress: Arc<ProgressManager>,
    probe: Arc<RttProbe>,
    events: broadcast::Sender<TransferEvent>,
    received: Arc<watch::Sender<Option<ReceivedFile>>>,
}

#[async_trait]
impl QueueHandler<PeerEvent> for EventLoop {
    async fn handle(&mut self, event: PeerEvent) -> Result<()> {
        let effects = match event {
            PeerEvent::Frame(frame) => match protocol::decode_frame(frame).await {
                Ok(inbound) => self.on_inbound(inbound),
                Err(e) => {
                    tracing::warn!(role = %self.role, error = %e, "Dropping undecodable frame");
                    Vec::new()
                }
            },
            PeerEvent::ChannelState(state) => self.on_channel_state(state),
            PeerEvent::StallCheck {
                transfer_id,
                generation,
            } => self.reassembler.on_stall(&transfer_id, generation),
            PeerEvent::Cancel(transfer_id) => {
                let reason = Abort::Cancelled;
                self.outgoing.abort(transfer_id.as_deref(), &reason);
                self.reassembler.cancel(transfer_id.as_deref())
            }
        };

        self.apply(effects).await;
        Ok(())
    }
}

impl EventLoop {
    fn on_inbound(&mut self, inbound: Inbound) -> Vec<Effect> {
        let message = match inbound {
            Inbound::Data(frame) => return self.reassembler.on_file_data(frame),
            Inbound::Control(message) => message,
            Inbound::Unrecognized { type_code } => {
                tracing::debug!(role = %self.role, type_code, "Dropping message of unknown type");
                return Vec::new();
            }
        };

        tracing::debug!(
            role = %self.role,
            message_type = %message.message_type(),
            transfer_id = message.transfer_id().unwrap_or_default(),
            "Control message received"
        );

        match message {
            ControlMessage::FileInfo(info) => {
                tracing::info!(
                    transfer_id = %info.transfer_id,
                    file_name = %info.file_name,
                    file_size = info.file_size,
                    "Peer announced a file"
                );
                let _ = self.events.send(TransferEvent::FileInfoReceived {
                    transfer_id: info.transfer_id,
                    file_name: info.file_name,
                    file_size: info.file_size,
                });
                Vec::new()
            }
            ControlMessage::FileStart(start) => self.reassembler.on_file_start(start),
            ControlMessage::FileComplete(summary) => self.reassembler.on_file_complete(&summary),
            ControlMessage::FileError(error) => {
                let reason = Abort::Remote(error.error.clone());
                if self.outgoing.abort(Some(&error.transfer_id), &reason) > 0 {
                    Vec::new()
                } else {
                    self.reassembler
                        .on_remote_error(&error.transfer_id, &error.error)
                }
            }
            ControlMessage::FileAck(ack) => {
                if self.outgoing.contains(&ack.transfer_id) {
                    self.progress
                        .ack_update(&ack.transfer_id, ack.progress, ack.bytes_received);
                } else {
                    tracing::debug!(transfer_id = %ack.transfer_id, "FILE_ACK for unknown transfer");
                }
                Vec::new()
            }
            ControlMessage::FileEnd(end) => self.reassembler.on_file_end(&end.transfer_id),
            ControlMessage::FileEndAck(end) => {
                if self.outgoing.contains(&end.transfer_id) {
                    self.progress.ack_complete(&end.transfer_id);
                    self.outgoing.end_ack(&end.transfer_id);
                } else {
                    tracing::debug!(transfer_id = %end.transfer_id, "Unexpected FILE_END_ACK");
                }
                Vec::new()
            }
            ControlMessage::Ping(ping) => {
                vec![Effect::Reply(ControlMessage::Pong(ping))]
            }
            ControlMessage::Pong(pong) => {
                if !self.probe.resolve(&pong.id) {
                    tracing::debug!(ping_id = %pong.id, "Late or unknown PONG");
                }
                Vec::new()
            }
        }
    }

    fn on_channel_state(&mut self, state: ChannelState) -> Vec<Effect> {
        tracing::debug!(role = %self.role, state = %state, "Channel state changed");
        if state.is_failure() {
            let reason = Abort::ChannelFailed(format!("channel {state}"));
            self.outgoing.abort(None, &reason);
            // Nothing queued behind a dead channel can complete.
            let pending = self.queue.len().saturating_sub(1);
            self.queue.clear();
            if pending > 0 {
                tracing::debug!(role = %self.role, pending, "Discarded events queued behind channel teardown");
            }
        }
        self.reassembler.on_channel_state(state)
    }

    async fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Reply(message) => {
                    let sent = match message.to_frame() {
                        Ok(frame) => self.channel.send(frame).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        tracing::warn!(
                            role = %self.role,
                            message_type = %message.message_type(),
                            error = %e,
                            "Could not send reply"
                        );
                    }
                }
                Effect::Started {
                    transfer_id,
                    file_name,
                    file_size,
                } => {
                    let _ = self.events.send(TransferEvent::Started {
                        transfer_id,
                        file_name,
                        file_size,
                        direction: TransferDirection::Receive,
                    });
                }
                Effect::Progress {
                    transfer_id,
                    bytes_received,
                    file_size,
                } => {
                    let _ = self.events.send(TransferEvent::Progress {
                        transfer_id,
                        bytes_received,
                        file_size,
                    });
                }
                Effect::Delivered(file) => {
                    self.received.send_replace(Some(file.clone()));
                    let _ = self.events.send(TransferEvent::Complete(file));
                }
                Effect::Failed { transfer_id, error } => {
                    let _ = self.events.send(TransferEvent::Error {
                        transfer_id,
                        message: error.to_string(),
                    });
                }
            }
        }
    }
}

/// One peer's end of a transfer connection.
pub struct TransferSession {
    role: PeerRole,
    config: Arc<Config>,
    channel: Arc<dyn Channel>,
    queue: MessageQueue<PeerEvent>,
    progress: Arc<ProgressManager>,
    monitor: Arc<Mutex<NetworkMonitor>>,
    controller: Arc<Mutex<ChunkSizeController>>,
    outgoing: Arc<OutgoingTransfers>,
    probe: Arc<RttProbe>,
    events: broadcast::Sender<TransferEvent>,
    received: Arc<watch::Sender<Option<ReceivedFile>>>,
    pump: JoinHandle<()>,
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("role", &self.role)
            .field("channel_state", &self.channel.state())
            .field("queue", &self.queue)
            .field("outgoing", &self.outgoing.active())
            .finish_non_exhaustive()
    }
}

impl TransferSession {
    /// Attach a session to a channel and start its event loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the channel's
    /// event stream was already taken.
    pub fn new(role: PeerRole, channel: Arc<dyn Channel>, config: Config) -> Result<Self> {
        config.validate()?;
        let mut inbound = channel
            .subscribe()
            .ok_or_else(|| Error::ChannelFailed("channel already has a subscriber".to_string()))?;

        let config = Arc::new(config);
        let queue = MessageQueue::new();
        let progress = Arc::new(ProgressManager::new());
        let monitor = Arc::new(Mutex::new(NetworkMonitor::new(config.monitor.clone())));
        let controller = Arc::new(Mutex::new(ChunkSizeController::new(config.chunk.clone())));
        let outgoing = Arc::new(OutgoingTransfers::new());
        let probe = Arc::new(RttProbe::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (received, _) = watch::channel(None);
        let received = Arc::new(received);

        let stall_queue = queue.clone();
        let on_stall: StallNotifier = Arc::new(move |transfer_id, generation| {
            let _ = stall_queue.enqueue(PeerEvent::StallCheck {
                transfer_id,
                generation,
            });
        });

        queue.set_handler(EventLoop {
            role,
            channel: Arc::clone(&channel),
            queue: queue.clone(),
            reassembler: StreamReassembler::new(&config, Arc::clone(&progress), on_stall),
            outgoing: Arc::clone(&outgoing),
            progress: Arc::clone(&progress),
            probe: Arc::clone(&probe),
            events: events.clone(),
            received: Arc::clone(&received),
        })?;

        let pump_queue = queue.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let event = match event {
                    ChannelEvent::Message(frame) => PeerEvent::Frame(frame),
                    ChannelEvent::StateChange(state) => PeerEvent::ChannelState(state),
                };
                if pump_queue.enqueue(event).is_err() {
                    break;
                }
            }
            tracing::debug!(role = %role, "Channel event stream ended");
        });

        tracing::debug!(role = %role, "Transfer session started");

        Ok(Self {
            role,
            config,
            channel,
            queue,
            progress,
            monitor,
            controller,
            outgoing,
            probe,
            events,
            received,
            pump,
        })
    }

    /// This session's role.
    pub const fn role(&self) -> PeerRole {
        self.role
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Send a file from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the transfer fails.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<SentFile> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());

        self.send_reader(&name, size, file).await
    }

    /// Send an in-memory buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails.
    pub async fn send_bytes(&self, name: &str, data: impl Into<Bytes>) -> Result<SentFile> {
        let data = data.into();
        let size = data.len() as u64;
        self.send_reader(name, size, Cursor::new(data)).await
    }

    /// Send `size` bytes read from `reader`.
    ///
    /// Resolves once the receiver has acknowledged the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails or is cancelled.
    pub async fn send_reader<R>(&self, name: &str, size: u64, reader: R) -> Result<SentFile>
    where
        R: AsyncRead + Unpin + Send,
    {
        let transfer_id = Uuid::new_v4().to_string();
        let compression = self.config.transfer.compression.select(name);

        let _ = self.events.send(TransferEvent::Started {
            transfer_id: transfer_id.clone(),
            file_name: name.to_string(),
            file_size: size,
            direction: TransferDirection::Send,
        });

        let request = SendRequest {
            transfer_id: transfer_id.clone(),
            file_name: name.to_string(),
            file_size: size,
            reader,
            compression,
        };

        match sender::send_stream(&self.send_context(), request).await {
            Ok(sent) => {
                let _ = self.events.send(TransferEvent::Sent(sent.clone()));
                Ok(sent)
            }
            Err(error) => {
                let _ = self.events.send(TransferEvent::Error {
                    transfer_id,
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Announce a file without sending it. Returns the transfer id used.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel rejects the frame.
    pub async fn send_file_info(&self, name: &str, size: u64) -> Result<String> {
        let transfer_id = Uuid::new_v4().to_string();
        let info = ControlMessage::FileInfo(FileInfoPayload {
            transfer_id: transfer_id.clone(),
            file_name: name.to_string(),
            file_size: size,
        });
        self.channel.send(info.to_frame()?).await?;
        Ok(transfer_id)
    }

    /// Cancel one transfer (either direction), or all of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the session has shut down.
    pub fn cancel_transfer(&self, transfer_id: Option<&str>) -> Result<()> {
        self.queue
            .enqueue(PeerEvent::Cancel(transfer_id.map(str::to_string)))
    }

    /// The most recently received file.
    pub fn received_file(&self) -> Option<ReceivedFile> {
        self.received.borrow().clone()
    }

    /// Name of the most recently received file.
    pub fn received_file_name(&self) -> Option<String> {
        self.received
            .borrow()
            .as_ref()
            .map(|file| file.file_name.clone())
    }

    /// Watch transfer progress.
    pub fn transfer_progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.progress()
    }

    /// Watch acknowledgment progress of outgoing transfers.
    pub fn ack_progress(&self) -> watch::Receiver<AckProgress> {
        self.progress.ack_progress()
    }

    /// Whether a transfer is in flight.
    pub fn is_transferring(&self) -> bool {
        self.progress.is_transferring()
    }

    /// Forget the last transfer's progress and received file.
    pub fn clear_transfer(&self) {
        self.progress.clear();
        self.received.send_replace(None);
    }

    /// Measure the round trip to the peer and feed it to the monitor.
    ///
    /// Returns [`Duration::ZERO`] if no reply arrived in time.
    pub async fn measure_rtt(&self) -> Duration {
        let timeout = self.monitor.lock().await.ping_timeout();
        let rtt = self.probe.measure(self.channel.as_ref(), timeout).await;
        if !rtt.is_zero() {
            self.monitor.lock().await.record_rtt(rtt);
        }
        rtt
    }

    /// Current link measurements.
    pub async fn network_metrics(&self) -> NetworkMetrics {
        self.monitor.lock().await.metrics()
    }

    /// Chunk sizing counters.
    pub async fn chunk_size_stats(&self) -> ChunkSizeStats {
        self.controller.lock().await.stats()
    }

    /// Discard queued events, cancel everything and stop the event loop.
    pub async fn shutdown(&self) {
        self.queue.clear();
        let _ = self.queue.enqueue(PeerEvent::Cancel(None));
        self.queue.close();
        self.queue.closed().await;
        self.pump.abort();
        tracing::debug!(role = %self.role, "Transfer session shut down");
    }

    fn send_context(&self) -> SendContext {
        SendContext {
            channel: Arc::clone(&self.channel),
            config: Arc::clone(&self.config),
            monitor: Arc::clone(&self.monitor),
            controller: Arc::clone(&self.controller),
            progress: Arc::clone(&self.progress),
            outgoing: Arc::clone(&self.outgoing),
            probe: Arc::clone(&self.probe),
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.queue.close();
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory_pair, memory_pair_with, MemoryChannel, MemoryChannelOptions};
    use crate::progress::TransferState;

    fn sessions(a: MemoryChannel, b: MemoryChannel) -> (TransferSession, TransferSession) {
        let host = TransferSession::new(PeerRole::Host, Arc::new(a), Config::default()).unwrap();
        let client = TransferSession::new(PeerRole::Client, Arc::new(b), Config::default()).unwrap();
        (host, client)
    }

    fn pair() -> (TransferSession, TransferSession) {
        let (a, b) = memory_pair();
        sessions(a, b)
    }

    async fn next_complete(rx: &mut broadcast::Receiver<TransferEvent>) -> ReceivedFile {
        loop {
            if let TransferEvent::Complete(file) = rx.recv().await.unwrap() {
                return file;
            }
        }
    }

    #[tokio::test]
    async fn test_send_bytes_roundtrip() {
        let (host, client) = pair();
        let mut events = client.subscribe();

        let sent = host.send_bytes("a.bin", vec![42u8; 1000]).await.unwrap();
        let received = next_complete(&mut events).await;

        assert_eq!(received.transfer_id, sent.transfer_id);
        assert_eq!(received.data.len(), 1000);
        assert_eq!(received.checksum, sent.checksum);
        assert_eq!(client.received_file_name().as_deref(), Some("a.bin"));
        assert_eq!(host.ack_progress().borrow().percentage, 100);
        assert_eq!(client.transfer_progress().borrow().state, TransferState::Completed);
    }

    #[tokio::test]
    async fn test_file_info_event() {
        let (host, client) = pair();
        let mut events = client.subscribe();

        let id = host.send_file_info("movie.mkv", 4096).await.unwrap();

        match events.recv().await.unwrap() {
            TransferEvent::FileInfoReceived {
                transfer_id,
                file_name,
                file_size,
            } => {
                assert_eq!(transfer_id, id);
                assert_eq!(file_name, "movie.mkv");
                assert_eq!(file_size, 4096);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_rtt() {
        let (a, b) = memory_pair_with(MemoryChannelOptions {
            latency: Duration::from_millis(20),
            binary_as_blob: false,
        });
        let (host, _client) = sessions(a, b);

        let rtt = host.measure_rtt().await;

        assert_eq!(rtt, Duration::from_millis(40));
        assert_eq!(host.network_metrics().await.rtt_samples, 1);
        assert_eq!(host.probe.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_second_session_on_channel_rejected() {
        let (a, _b) = memory_pair();
        let a: Arc<dyn Channel> = Arc::new(a);
        let _first = TransferSession::new(PeerRole::Host, Arc::clone(&a), Config::default()).unwrap();
        assert!(matches!(
            TransferSession::new(PeerRole::Host, a, Config::default()),
            Err(Error::ChannelFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_transfer() {
        let (host, client) = pair();
        let mut events = client.subscribe();
        host.send_bytes("a.txt", "hello").await.unwrap();
        next_complete(&mut events).await;

        client.clear_transfer();
        assert!(client.received_file().is_none());
        assert_eq!(client.transfer_progress().borrow().state, TransferState::Idle);
    }

    fn start_frame(transfer_id: &str) -> Frame {
        ControlMessage::FileStart(crate::protocol::FileStartPayload {
            transfer_id: transfer_id.to_string(),
            file_name: "late.bin".to_string(),
            file_size: 10,
            compression: crate::codec::CompressionAlgorithm::None,
        })
        .to_frame()
        .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_stops_queue() {
        let (host, _client) = pair();
        let mut events = host.subscribe();

        host.queue.enqueue(PeerEvent::Frame(start_frame("t1"))).unwrap();
        host.shutdown().await;

        assert!(host.cancel_transfer(None).is_err());
        assert!(host.queue.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_frames_behind_closed_state_dropped() {
        let (host, _client) = pair();
        let mut events = host.subscribe();

        host.queue
            .enqueue(PeerEvent::ChannelState(ChannelState::Closed))
            .unwrap();
        host.queue.enqueue(PeerEvent::Frame(start_frame("t1"))).unwrap();
        while !host.queue.is_empty() {
            tokio::task::yield_now().await;
        }

        assert!(events.try_recv().is_err());
        assert_eq!(host.transfer_progress().borrow().state, TransferState::Idle);

        // Later events are handled again.
        host.queue.enqueue(PeerEvent::Frame(start_frame("t2"))).unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            TransferEvent::Started { transfer_id, .. } if transfer_id == "t2"
        ));
    }
}
