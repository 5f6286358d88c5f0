//! Send-side transfer driver.
//!
//! [`send_stream`] pushes one file through a [`Channel`]:
//!
//! 1. `FILE_START` announces id, name, size and chunk encoding.
//! 2. The source is read in chunks sized by the [`ChunkSizeController`];
//!    each chunk goes out as a binary `FILE_DATA` frame. Sending pauses
//!    while the channel buffers more than the configured high-water mark.
//!    After the first chunk, and periodically after that, a background
//!    `PING` keeps the monitor's RTT samples fresh.
//! 3. `FILE_END` closes the stream; the sender waits for `FILE_END_ACK`.
//! 4. `FILE_COMPLETE` reports total bytes, checksum and elapsed time.
//!
//! Replies from the receiver (`FILE_END_ACK`, `FILE_ERROR`) are routed in
//! by the session's event loop through [`OutgoingTransfers`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::Instant;

use crate::adaptive::{ChunkSizeController, NetworkMonitor, PerformanceSample, RttProbe};
use crate::channel::Channel;
use crate::codec::{self, CompressionAlgorithm, StreamingChecksum};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::progress::{ProgressManager, TransferDirection};
use crate::protocol::{
    ControlMessage, DataFrame, FileCompletePayload, FileStartPayload, Frame, MAX_FILE_SIZE,
};
use crate::timeout::TimeoutCalculator;

/// Poll interval while the channel buffer drains.
const PACING_INTERVAL: Duration = Duration::from_millis(10);

/// Why an outgoing transfer was stopped from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abort {
    /// Cancelled locally
    Cancelled,
    /// The receiver sent `FILE_ERROR`
    Remote(String),
    /// The channel failed
    ChannelFailed(String),
}

impl Abort {
    fn into_error(self, transfer_id: &str) -> Error {
        match self {
            Self::Cancelled => Error::TransferCancelled,
            Self::Remote(message) => Error::RemoteError {
                transfer_id: transfer_id.to_string(),
                message,
            },
            Self::ChannelFailed(reason) => Error::ChannelFailed(reason),
        }
    }

    const fn notify_peer(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug)]
struct Slot {
    abort: watch::Sender<Option<Abort>>,
    end_ack: Option<oneshot::Sender<()>>,
}

/// Registry of in-flight outgoing transfers of one peer.
#[derive(Debug, Default)]
pub struct OutgoingTransfers {
    slots: StdMutex<HashMap<String, Slot>>,
}

impl OutgoingTransfers {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer. The slot is released when the returned
    /// registration is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already in flight.
    pub fn register(self: &Arc<Self>, transfer_id: &str) -> Result<Registration> {
        let (abort_tx, abort_rx) = watch::channel(None);
        let (end_ack_tx, end_ack_rx) = oneshot::channel();

        let mut slots = self.lock()?;
        if slots.contains_key(transfer_id) {
            return Err(Error::Internal(format!(
                "outgoing transfer '{transfer_id}' already in flight"
            )));
        }
        slots.insert(
            transfer_id.to_string(),
            Slot {
                abort: abort_tx,
                end_ack: Some(end_ack_tx),
            },
        );

        Ok(Registration {
            transfer_id: transfer_id.to_string(),
            abort: abort_rx,
            end_ack: Some(end_ack_rx),
            owner: Arc::clone(self),
        })
    }

    /// Stop one transfer, or all of them. Returns how many were signalled.
    pub fn abort(&self, transfer_id: Option<&str>, reason: &Abort) -> usize {
        let Ok(slots) = self.lock() else {
            return 0;
        };
        slots
            .iter()
            .filter(|(id, _)| transfer_id.is_none_or(|wanted| wanted == id.as_str()))
            .filter(|(_, slot)| {
                slot.abort.send_if_modified(|current| {
                    if current.is_some() {
                        return false;
                    }
                    *current = Some(reason.clone());
                    true
                })
            })
            .count()
    }

    /// Route a `FILE_END_ACK`. Returns `false` if nobody was waiting.
    pub fn end_ack(&self, transfer_id: &str) -> bool {
        let waiter = self
            .lock()
            .ok()
            .and_then(|mut slots| slots.get_mut(transfer_id).and_then(|s| s.end_ack.take()));
        waiter.is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Whether the id belongs to an in-flight outgoing transfer.
    pub fn contains(&self, transfer_id: &str) -> bool {
        self.lock().is_ok_and(|slots| slots.contains_key(transfer_id))
    }

    /// Ids of all in-flight outgoing transfers.
    pub fn active(&self) -> Vec<String> {
        self.lock()
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn release(&self, transfer_id: &str) {
        if let Ok(mut slots) = self.lock() {
            slots.remove(transfer_id);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| Error::Internal("outgoing registry poisoned".to_string()))
    }
}

/// Claim on an [`OutgoingTransfers`] slot.
#[derive(Debug)]
pub struct Registration {
    transfer_id: String,
    abort: watch::Receiver<Option<Abort>>,
    end_ack: Option<oneshot::Receiver<()>>,
    owner: Arc<OutgoingTransfers>,
}

impl Registration {
    fn check(&self) -> Result<()> {
        match self.abort.borrow().clone() {
            Some(reason) => Err(reason.into_error(&self.transfer_id)),
            None => Ok(()),
        }
    }

    fn aborted(&self) -> Option<Abort> {
        self.abort.borrow().clone()
    }

    /// Sleep for `duration` unless the transfer is aborted first.
    async fn sleep(&mut self, duration: Duration) -> Result<()> {
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            Ok(reason) = self.abort.wait_for(Option::is_some) => {
                let reason = reason.clone().unwrap_or(Abort::Cancelled);
                Err(reason.into_error(&self.transfer_id))
            }
        }
    }

    async fn wait_end_ack(&mut self, limit: Duration) -> Result<()> {
        let Some(end_ack) = self.end_ack.take() else {
            return Ok(());
        };
        let transfer_id = self.transfer_id.clone();
        tokio::select! {
            result = tokio::time::timeout(limit, end_ack) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(Error::Internal("end acknowledgment dropped".to_string())),
                Err(_) => Err(Error::StallTimeout {
                    transfer_id,
                    seconds: limit.as_secs(),
                }),
            },
            Ok(reason) = self.abort.wait_for(Option::is_some) => {
                let reason = reason.clone().unwrap_or(Abort::Cancelled);
                Err(reason.into_error(&transfer_id))
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.owner.release(&self.transfer_id);
    }
}

/// Shared state a send needs.
#[derive(Clone)]
pub struct SendContext {
    /// Outbound channel
    pub channel: Arc<dyn Channel>,
    /// Effective configuration
    pub config: Arc<Config>,
    /// Link measurements of this peer
    pub monitor: Arc<Mutex<NetworkMonitor>>,
    /// Chunk sizing of this peer
    pub controller: Arc<Mutex<ChunkSizeController>>,
    /// Progress views of this peer
    pub progress: Arc<ProgressManager>,
    /// In-flight outgoing transfers of this peer
    pub outgoing: Arc<OutgoingTransfers>,
    /// Ping correlation of this peer
    pub probe: Arc<RttProbe>,
}

impl std::fmt::Debug for SendContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendContext")
            .field("channel_state", &self.channel.state())
            .field("outgoing", &self.outgoing.active())
            .finish_non_exhaustive()
    }
}

/// One file to send.
#[derive(Debug)]
pub struct SendRequest<R> {
    /// Transfer id
    pub transfer_id: String,
    /// File name announced to the receiver
    pub file_name: String,
    /// Exact number of bytes `reader` yields
    pub file_size: u64,
    /// Source of the file contents
    pub reader: R,
    /// Chunk encoding
    pub compression: CompressionAlgorithm,
}

/// Summary of a finished send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFile {
    /// Transfer id
    pub transfer_id: String,
    /// File name
    pub file_name: String,
    /// Bytes read from the source
    pub total_bytes: u64,
    /// xxHash3-64 of the source bytes
    pub checksum: String,
    /// Time from `FILE_START` to `FILE_END_ACK`
    pub elapsed: Duration,
    /// `FILE_DATA` frames sent
    pub chunks: u64,
    /// Chunks abandoned after exhausting their retries
    pub skipped_chunks: u64,
}

/// Send one file and wait for the receiver to acknowledge it.
///
/// # Errors
///
/// Fails if the file is too large, the source cannot be read, the channel
/// fails, the receiver reports an error, the transfer is cancelled, or the
/// end acknowledgment does not arrive within the stall window. The receiver
/// is told about local failures with `FILE_ERROR`.
pub async fn send_stream<R>(ctx: &SendContext, request: SendRequest<R>) -> Result<SentFile>
where
    R: AsyncRead + Unpin + Send,
{
    if request.file_size > MAX_FILE_SIZE {
        return Err(Error::FileTooLarge(request.file_size));
    }

    let transfer_id = request.transfer_id.clone();
    let mut registration = ctx.outgoing.register(&transfer_id)?;

    ctx.progress.start(
        &transfer_id,
        &request.file_name,
        request.file_size,
        TransferDirection::Send,
    );
    ctx.progress.ack_start(&transfer_id, request.file_size);

    match drive(ctx, &mut registration, request).await {
        Ok(sent) => {
            ctx.progress.complete(&transfer_id);
            Ok(sent)
        }
        Err(error) => {
            let notify_peer = registration.aborted().map_or_else(
                || !matches!(error, Error::ChannelClosed | Error::ChannelFailed(_)),
                |abort| abort.notify_peer(),
            );
            if notify_peer {
                let message = ControlMessage::file_error(&transfer_id, error.to_string());
                if let Err(e) = send_control(ctx.channel.as_ref(), &message).await {
                    tracing::debug!(transfer_id = %transfer_id, error = %e, "Could not report failure to peer");
                }
            }

            if matches!(error, Error::TransferCancelled) {
                tracing::info!(transfer_id = %transfer_id, "Outgoing transfer cancelled");
                ctx.progress.cancel(&transfer_id);
            } else {
                tracing::error!(transfer_id = %transfer_id, error = %error, "Outgoing transfer failed");
                ctx.progress.fail(&transfer_id, &error.to_string());
            }
            Err(error)
        }
    }
}

async fn drive<R>(
    ctx: &SendContext,
    registration: &mut Registration,
    request: SendRequest<R>,
) -> Result<SentFile>
where
    R: AsyncRead + Unpin + Send,
{
    let SendRequest {
        transfer_id,
        file_name,
        file_size,
        mut reader,
        compression,
    } = request;
    let config = &ctx.config;
    let codec = codec::codec_for(compression, i32::from(config.transfer.compression_level));
    let started = Instant::now();

    send_control(
        ctx.channel.as_ref(),
        &ControlMessage::FileStart(FileStartPayload {
            transfer_id: transfer_id.clone(),
            file_name: file_name.clone(),
            file_size,
            compression,
        }),
    )
    .await?;

    tracing::info!(
        transfer_id = %transfer_id,
        file_name = %file_name,
        file_size,
        compression = %compression,
        "Outgoing transfer started"
    );

    let mut checksum = StreamingChecksum::new();
    let mut offset: u64 = 0;
    let mut chunks: u64 = 0;
    let mut skipped_chunks: u64 = 0;
    let mut rtt_probe: Option<tokio::task::JoinHandle<()>> = None;

    while offset < file_size {
        registration.check()?;

        let chunk_size = ctx.controller.lock().await.current_chunk_size();
        let remaining = file_size - offset;
        let want = usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size));

        let raw = read_chunk(&mut reader, want).await?;
        if raw.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended at {offset} of {file_size} bytes"),
            )));
        }
        checksum.update(&raw);
        let raw_len = raw.len() as u64;

        let payload = codec.encode(raw.freeze())?;
        let wire_len = payload.len();
        let frame_offset = u32::try_from(offset).map_err(|_| Error::FileTooLarge(file_size))?;
        let frame = DataFrame::new(transfer_id.as_str(), frame_offset, payload).to_frame()?;

        pace(ctx, registration).await?;

        let sent_at = Instant::now();
        let delivered = send_with_retry(ctx, registration, frame, offset).await?;

        {
            let mut monitor = ctx.monitor.lock().await;
            if delivered {
                monitor.record_chunk(wire_len as u64);
            }
            monitor.record_buffer_level(ctx.channel.buffered_amount());
            let rtt = monitor.average_rtt();
            drop(monitor);

            ctx.controller.lock().await.record_performance(PerformanceSample {
                at: sent_at,
                chunk_size: wire_len,
                rtt,
                success: delivered,
            });
        }

        offset += raw_len;
        chunks += 1;
        if !delivered {
            skipped_chunks += 1;
        }
        ctx.progress.update(&transfer_id, offset);

        let probe_every = u64::from(config.monitor.probe_every_chunks);
        if probe_every > 0
            && (chunks == 1 || chunks % probe_every == 0)
            && rtt_probe.as_ref().is_none_or(|probe| probe.is_finished())
        {
            rtt_probe = Some(spawn_rtt_probe(ctx));
        }

        if chunks % u64::from(config.chunk.adapt_every_chunks.max(1)) == 0 {
            let metrics = ctx.monitor.lock().await.metrics();
            ctx.controller.lock().await.update_chunk_size(&metrics);
        }
    }

    send_control(ctx.channel.as_ref(), &ControlMessage::file_end(&transfer_id)).await?;

    let limit = TimeoutCalculator::new(config.timeout.clone()).calculate(file_size, 0, started, None);
    registration.wait_end_ack(limit).await?;
    let elapsed = started.elapsed();
    let checksum = checksum.finish();

    #[allow(clippy::cast_possible_truncation)]
    let transfer_time = elapsed.as_millis() as u64;
    let summary = ControlMessage::FileComplete(FileCompletePayload {
        transfer_id: transfer_id.clone(),
        total_bytes: offset,
        checksum: checksum.clone(),
        transfer_time,
    });
    if let Err(e) = send_control(ctx.channel.as_ref(), &summary).await {
        tracing::warn!(transfer_id = %transfer_id, error = %e, "Could not send completion summary");
    }

    tracing::info!(
        transfer_id = %transfer_id,
        bytes = offset,
        chunks,
        skipped_chunks,
        elapsed_ms = transfer_time,
        "Outgoing transfer complete"
    );

    Ok(SentFile {
        transfer_id,
        file_name,
        total_bytes: offset,
        checksum,
        elapsed,
        chunks,
        skipped_chunks,
    })
}

/// Ping the peer in the background and record a non-zero RTT.
///
/// At most one probe per transfer runs at a time. A probe outlives the
/// transfer by at most the ping timeout.
fn spawn_rtt_probe(ctx: &SendContext) -> tokio::task::JoinHandle<()> {
    let channel = Arc::clone(&ctx.channel);
    let monitor = Arc::clone(&ctx.monitor);
    let probe = Arc::clone(&ctx.probe);
    let timeout = ctx.config.monitor.ping_timeout;
    tokio::spawn(async move {
        let rtt = probe.measure(channel.as_ref(), timeout).await;
        if !rtt.is_zero() {
            monitor.lock().await.record_rtt(rtt);
        }
    })
}

/// Fill up to `want` bytes, stopping early only at end of input.
async fn read_chunk<R>(reader: &mut R, want: usize) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(want);
    while buf.len() < want {
        let mut limited = (&mut *reader).take((want - buf.len()) as u64);
        if limited.read_buf(&mut buf).await? == 0 {
            break;
        }
    }
    Ok(buf)
}

/// Wait while the channel holds more than the high-water mark.
async fn pace(ctx: &SendContext, registration: &mut Registration) -> Result<()> {
    let high_water = ctx.config.chunk.buffer_high_water;
    loop {
        let buffered = ctx.channel.buffered_amount();
        if buffered <= high_water {
            return Ok(());
        }
        ctx.monitor.lock().await.record_buffer_level(buffered);
        registration.sleep(PACING_INTERVAL).await?;
    }
}

/// Send a data frame, retrying with a fixed delay.
///
/// Returns `false` when the chunk was abandoned after its last attempt.
async fn send_with_retry(
    ctx: &SendContext,
    registration: &mut Registration,
    frame: Frame,
    offset: u64,
) -> Result<bool> {
    let retry = &ctx.config.retry;
    let attempts = retry.max_attempts.max(1);
    let mut frame = Some(frame);

    for attempt in 1..=attempts {
        let Some(current) = frame.take() else {
            break;
        };
        let retained = reusable(&current);

        match ctx.channel.send(current).await {
            Ok(()) => return Ok(true),
            Err(Error::ChannelClosed) => return Err(Error::ChannelClosed),
            Err(e) => {
                tracing::warn!(
                    transfer_id = %registration.transfer_id,
                    offset,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Chunk send failed"
                );
            }
        }

        frame = retained;
        if attempt < attempts {
            registration.sleep(retry.delay).await?;
        }
    }

    if retry.fail_transfer_on_exhaustion {
        return Err(Error::RetriesExhausted {
            transfer_id: registration.transfer_id.clone(),
            offset,
            attempts,
        });
    }
    tracing::warn!(
        transfer_id = %registration.transfer_id,
        offset,
        attempts,
        "Chunk abandoned after retries"
    );
    Ok(false)
}

fn reusable(frame: &Frame) -> Option<Frame> {
    match frame {
        Frame::Text(text) => Some(Frame::Text(text.clone())),
        Frame::Binary(bytes) => Some(Frame::Binary(bytes.clone())),
        Frame::Blob(_) => None,
    }
}

async fn send_control(channel: &dyn Channel, message: &ControlMessage) -> Result<()> {
    channel.send(message.to_frame()?).await
}
