//! Receive-side stream reassembly.
//!
//! [`StreamReassembler`] owns every incoming transfer of a peer: the
//! per-transfer record, its pre-allocated buffer, and its stall timer. It is
//! driven exclusively by the peer's event loop, one event at a time, and
//! answers each event with a list of [`Effect`]s (frames to send back,
//! delivered files, failures) for the loop to carry out.
//!
//! Phases per transfer id:
//!
//! ```text
//! None ──FILE_START──▶ Started ──FILE_DATA──▶ Receiving ──FILE_END──▶ Completing ──▶ Done
//!                         │                      │                        │
//!                         └──────────────────────┴────────────────────────┴──▶ Error
//! ```
//!
//! Every exit (completion, validation failure, remote error, stall, cancel,
//! channel failure) goes through one idempotent release routine.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::ack::{AckInfo, AckStrategy};
use crate::channel::ChannelState;
use crate::codec::{self, ChunkCodec};
use crate::config::Config;
use crate::error::Error;
use crate::progress::{ProgressManager, TransferDirection};
use crate::protocol::{
    ControlMessage, DataFrame, FileAckPayload, FileCompletePayload, FileStartPayload,
    MAX_FILE_SIZE,
};
use crate::timeout::{TimeoutCalculator, TimerRegistry};

/// Finished transfers remembered for phase queries and checksum checks.
const HISTORY_LIMIT: usize = 64;

/// Lifecycle phase of an incoming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Unknown transfer id
    None,
    /// Buffer allocated, no data yet
    Started,
    /// Data frames arriving
    Receiving,
    /// `FILE_END` received, delivering
    Completing,
    /// Delivered
    Done,
    /// Failed, cancelled or superseded
    Error,
}

/// Callback invoked when a stall timer expires: `(transfer_id, generation)`.
pub type StallNotifier = Arc<dyn Fn(String, u64) + Send + Sync>;

/// A fully received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Transfer id
    pub transfer_id: String,
    /// File name announced in `FILE_START`
    pub file_name: String,
    /// Received bytes
    pub data: Bytes,
    /// Size announced in `FILE_START`
    pub declared_size: u64,
    /// xxHash3-64 of `data`
    pub checksum: String,
}

/// Work the event loop must carry out after an event.
#[derive(Debug)]
pub enum Effect {
    /// Send a control message to the peer
    Reply(ControlMessage),
    /// A new incoming transfer started
    Started {
        /// Transfer id
        transfer_id: String,
        /// File name
        file_name: String,
        /// Declared size
        file_size: u64,
    },
    /// Bytes were written
    Progress {
        /// Transfer id
        transfer_id: String,
        /// Bytes received so far
        bytes_received: u64,
        /// Declared size
        file_size: u64,
    },
    /// A file was delivered
    Delivered(ReceivedFile),
    /// A transfer ended with an error
    Failed {
        /// Transfer id
        transfer_id: String,
        /// Cause
        error: Error,
    },
}

/// State of one incoming transfer.
pub struct TransferRecord {
    file_name: String,
    file_size: u64,
    bytes_received: u64,
    start_time: Instant,
    last_acked_percentage: Option<u8>,
    last_ack_time: Option<Instant>,
    phase: TransferPhase,
    codec: Arc<dyn ChunkCodec>,
    armed_timeout: Duration,
    buffer: Vec<u8>,
}

impl TransferRecord {
    /// File name.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Declared size.
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes received so far.
    pub const fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Percentage carried by the last ack.
    pub const fn last_acked_percentage(&self) -> Option<u8> {
        self.last_acked_percentage
    }

    /// Current phase.
    pub const fn phase(&self) -> TransferPhase {
        self.phase
    }

    /// Silence window of the live stall timer.
    pub const fn armed_timeout(&self) -> Duration {
        self.armed_timeout
    }
}

impl fmt::Debug for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRecord")
            .field("file_name", &self.file_name)
            .field("file_size", &self.file_size)
            .field("bytes_received", &self.bytes_received)
            .field("phase", &self.phase)
            .field("codec", &self.codec.algorithm())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Finished {
    transfer_id: String,
    phase: TransferPhase,
    checksum: Option<String>,
}

/// Receive-side state machine for all incoming transfers of one peer.
pub struct StreamReassembler {
    records: HashMap<String, TransferRecord>,
    history: VecDeque<Finished>,
    timers: TimerRegistry,
    timeouts: TimeoutCalculator,
    acks: AckStrategy,
    progress: Arc<ProgressManager>,
    on_stall: StallNotifier,
    compression_level: i32,
}

impl fmt::Debug for StreamReassembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReassembler")
            .field("records", &self.records)
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}

impl StreamReassembler {
    /// Create a reassembler.
    ///
    /// `on_stall` is called from a timer task when a transfer has been
    /// silent for its whole window; it should route the expiry back into
    /// the event loop, which then calls [`StreamReassembler::on_stall`].
    pub fn new(config: &Config, progress: Arc<ProgressManager>, on_stall: StallNotifier) -> Self {
        Self {
            records: HashMap::new(),
            history: VecDeque::new(),
            timers: TimerRegistry::new(),
            timeouts: TimeoutCalculator::new(config.timeout.clone()),
            acks: AckStrategy::new(config.ack.clone()),
            progress,
            on_stall,
            compression_level: i32::from(config.transfer.compression_level),
        }
    }

    /// Record of an active transfer.
    pub fn record(&self, transfer_id: &str) -> Option<&TransferRecord> {
        self.records.get(transfer_id)
    }

    /// Phase of a transfer, including recently finished ones.
    pub fn phase(&self, transfer_id: &str) -> TransferPhase {
        if let Some(record) = self.records.get(transfer_id) {
            return record.phase;
        }
        self.history
            .iter()
            .rev()
            .find(|f| f.transfer_id == transfer_id)
            .map_or(TransferPhase::None, |f| f.phase)
    }

    /// Ids of all active transfers.
    pub fn active_transfers(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Number of armed stall timers.
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    /// Handle `FILE_START`.
    ///
    /// A `FILE_START` for an id that is still active cancels the old
    /// transfer (reported as superseded) and starts over.
    pub fn on_file_start(&mut self, start: FileStartPayload) -> Vec<Effect> {
        let FileStartPayload {
            transfer_id,
            file_name,
            file_size,
            compression,
        } = start;
        let mut effects = Vec::new();

        if self.records.contains_key(&transfer_id) {
            tracing::warn!(
                transfer_id = %transfer_id,
                "Duplicate FILE_START; restarting transfer"
            );
            effects.extend(self.fail(&transfer_id, Error::TransferSuperseded, false));
        }

        if file_size > MAX_FILE_SIZE {
            let error = Error::FileTooLarge(file_size);
            effects.push(Effect::Reply(ControlMessage::file_error(
                &transfer_id,
                error.to_string(),
            )));
            effects.push(Effect::Failed { transfer_id, error });
            return effects;
        }

        let mut buffer = Vec::new();
        let allocated = usize::try_from(file_size)
            .map_err(|e| e.to_string())
            .and_then(|len| {
                buffer.try_reserve_exact(len).map_err(|e| e.to_string())?;
                buffer.resize(len, 0);
                Ok(())
            });
        if let Err(reason) = allocated {
            let error = Error::Internal(format!("cannot allocate {file_size} bytes: {reason}"));
            effects.push(Effect::Reply(ControlMessage::file_error(
                &transfer_id,
                error.to_string(),
            )));
            effects.push(Effect::Failed { transfer_id, error });
            return effects;
        }

        let now = Instant::now();
        let armed_timeout = self.timeouts.calculate(file_size, 0, now, None);
        self.arm_stall_timer(&transfer_id, armed_timeout);

        tracing::info!(
            transfer_id = %transfer_id,
            file_name = %file_name,
            file_size,
            compression = %compression,
            "Incoming transfer started"
        );

        self.progress
            .start(&transfer_id, &file_name, file_size, TransferDirection::Receive);

        self.records.insert(
            transfer_id.clone(),
            TransferRecord {
                file_name: file_name.clone(),
                file_size,
                bytes_received: 0,
                start_time: now,
                last_acked_percentage: None,
                last_ack_time: None,
                phase: TransferPhase::Started,
                codec: codec::codec_for(compression, self.compression_level),
                armed_timeout,
                buffer,
            },
        );

        effects.push(Effect::Started {
            transfer_id,
            file_name,
            file_size,
        });
        effects
    }

    /// Handle a `FILE_DATA` frame.
    pub fn on_file_data(&mut self, frame: DataFrame) -> Vec<Effect> {
        let DataFrame {
            transfer_id,
            offset,
            payload,
        } = frame;

        let record = match self
            .records
            .get_mut(&transfer_id)
            .ok_or_else(|| Error::TransferNotFound(transfer_id.clone()))
        {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(offset, error = %error, "FILE_DATA dropped");
                return Vec::new();
            }
        };

        let room = usize::try_from(u64::from(offset))
            .map_or(0, |start| record.buffer.len().saturating_sub(start));
        let chunk = match record.codec.decode(payload, room) {
            Ok(chunk) => chunk,
            Err(error) => return self.fail(&transfer_id, error, true),
        };

        let start = u64::from(offset);
        let len = chunk.len() as u64;
        let capacity = record.buffer.len() as u64;
        if start + len > capacity {
            let error = Error::BufferOverflow {
                transfer_id: transfer_id.clone(),
                offset: start,
                len,
                capacity,
            };
            return self.fail(&transfer_id, error, true);
        }

        #[allow(clippy::cast_possible_truncation)]
        let range = start as usize..(start + len) as usize;
        record.buffer[range].copy_from_slice(&chunk);
        record.bytes_received = (record.bytes_received + len).min(record.file_size);
        record.phase = TransferPhase::Receiving;

        tracing::debug!(
            transfer_id = %transfer_id,
            offset,
            len,
            bytes_received = record.bytes_received,
            "Chunk written"
        );

        let mut effects = vec![Effect::Progress {
            transfer_id: transfer_id.clone(),
            bytes_received: record.bytes_received,
            file_size: record.file_size,
        }];
        self.progress.update(&transfer_id, record.bytes_received);

        let now = Instant::now();
        let decision = self.acks.evaluate(
            &AckInfo {
                file_size: record.file_size,
                bytes_received: record.bytes_received,
                last_acked_percentage: record.last_acked_percentage,
                last_ack_time: record.last_ack_time,
                start_time: record.start_time,
            },
            now,
        );
        if decision.send {
            record.last_acked_percentage = Some(decision.current_percentage);
            record.last_ack_time = Some(now);
            effects.push(Effect::Reply(ControlMessage::FileAck(FileAckPayload {
                transfer_id: transfer_id.clone(),
                progress: decision.current_percentage,
                bytes_received: Some(record.bytes_received),
            })));
        }

        let timeout = self.timeouts.calculate(
            record.file_size,
            record.bytes_received,
            record.start_time,
            None,
        );
        record.armed_timeout = timeout;
        self.arm_stall_timer(&transfer_id, timeout);

        effects
    }

    /// Handle `FILE_END`: acknowledge it and deliver the file.
    pub fn on_file_end(&mut self, transfer_id: &str) -> Vec<Effect> {
        let mut effects = vec![Effect::Reply(ControlMessage::file_end_ack(transfer_id))];
        if let Some(record) = self.records.get_mut(transfer_id) {
            record.phase = TransferPhase::Completing;
        }
        effects.extend(self.complete(transfer_id));
        effects
    }

    /// Deliver a transfer and release it.
    ///
    /// Calling this again for a released id is a no-op.
    pub fn complete(&mut self, transfer_id: &str) -> Vec<Effect> {
        let Some(record) = self.release(transfer_id) else {
            tracing::debug!(transfer_id = %transfer_id, "Completion for released transfer ignored");
            return Vec::new();
        };

        if record.bytes_received < record.file_size {
            tracing::warn!(
                transfer_id = %transfer_id,
                bytes_received = record.bytes_received,
                file_size = record.file_size,
                "Delivering partial file"
            );
        }

        let mut buffer = record.buffer;
        buffer.truncate(usize::try_from(record.bytes_received).unwrap_or(usize::MAX));
        let data = Bytes::from(buffer);
        let checksum = codec::checksum(&data);

        tracing::info!(
            transfer_id = %transfer_id,
            file_name = %record.file_name,
            bytes = data.len(),
            elapsed_ms = record.start_time.elapsed().as_millis(),
            "Transfer received"
        );

        self.progress.complete(transfer_id);
        self.remember(transfer_id, TransferPhase::Done, Some(checksum.clone()));

        vec![Effect::Delivered(ReceivedFile {
            transfer_id: transfer_id.to_string(),
            file_name: record.file_name,
            data,
            declared_size: record.file_size,
            checksum,
        })]
    }

    /// Handle the sender's `FILE_COMPLETE` summary.
    pub fn on_file_complete(&mut self, summary: &FileCompletePayload) -> Vec<Effect> {
        let delivered = self
            .history
            .iter()
            .rev()
            .find(|f| f.transfer_id == summary.transfer_id)
            .and_then(|f| f.checksum.as_deref());

        match delivered {
            Some(checksum) if checksum == summary.checksum => {
                tracing::debug!(
                    transfer_id = %summary.transfer_id,
                    total_bytes = summary.total_bytes,
                    transfer_time_ms = summary.transfer_time,
                    "Checksum verified"
                );
            }
            Some(checksum) => {
                tracing::warn!(
                    transfer_id = %summary.transfer_id,
                    expected = %summary.checksum,
                    actual = %checksum,
                    "Checksum mismatch for delivered file"
                );
            }
            None => {
                tracing::debug!(
                    transfer_id = %summary.transfer_id,
                    "FILE_COMPLETE for unknown transfer ignored"
                );
            }
        }
        Vec::new()
    }

    /// Handle a `FILE_ERROR` from the peer.
    pub fn on_remote_error(&mut self, transfer_id: &str, message: &str) -> Vec<Effect> {
        let error = Error::RemoteError {
            transfer_id: transfer_id.to_string(),
            message: message.to_string(),
        };
        self.fail(transfer_id, error, false)
    }

    /// Handle an expired stall timer.
    pub fn on_stall(&mut self, transfer_id: &str, generation: u64) -> Vec<Effect> {
        if !self.timers.is_current(transfer_id, generation) {
            return Vec::new();
        }
        let seconds = self
            .records
            .get(transfer_id)
            .map_or(0, |record| record.armed_timeout.as_secs());
        let error = Error::StallTimeout {
            transfer_id: transfer_id.to_string(),
            seconds,
        };
        self.fail(transfer_id, error, true)
    }

    /// Cancel one incoming transfer, or all of them.
    pub fn cancel(&mut self, transfer_id: Option<&str>) -> Vec<Effect> {
        let ids = match transfer_id {
            Some(id) => vec![id.to_string()],
            None => self.active_transfers(),
        };
        ids.iter()
            .flat_map(|id| self.fail(id, Error::TransferCancelled, true))
            .collect()
    }

    /// React to a channel state change.
    pub fn on_channel_state(&mut self, state: ChannelState) -> Vec<Effect> {
        if self.records.is_empty() {
            return Vec::new();
        }

        if state.is_disconnect() {
            for id in self.records.keys() {
                tracing::warn!(transfer_id = %id, state = %state, "Channel disconnected during transfer");
            }
            Vec::new()
        } else if state.is_failure() {
            self.active_transfers()
                .iter()
                .flat_map(|id| {
                    let error = Error::ChannelFailed(format!("channel {state}"));
                    self.fail(id, error, false)
                })
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Fail a transfer and release it. No-op for released ids.
    pub fn fail(&mut self, transfer_id: &str, error: Error, notify_peer: bool) -> Vec<Effect> {
        if self.release(transfer_id).is_none() {
            return Vec::new();
        }

        if matches!(error, Error::TransferCancelled) {
            tracing::info!(transfer_id = %transfer_id, "Transfer cancelled");
            self.progress.cancel(transfer_id);
        } else {
            tracing::error!(transfer_id = %transfer_id, error = %error, "Transfer failed");
            self.progress.fail(transfer_id, &error.to_string());
        }
        self.remember(transfer_id, TransferPhase::Error, None);

        let mut effects = Vec::with_capacity(2);
        if notify_peer {
            effects.push(Effect::Reply(ControlMessage::file_error(
                transfer_id,
                error.to_string(),
            )));
        }
        effects.push(Effect::Failed {
            transfer_id: transfer_id.to_string(),
            error,
        });
        effects
    }

    fn release(&mut self, transfer_id: &str) -> Option<TransferRecord> {
        self.timers.cancel(transfer_id);
        self.records.remove(transfer_id)
    }

    fn remember(&mut self, transfer_id: &str, phase: TransferPhase, checksum: Option<String>) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(Finished {
            transfer_id: transfer_id.to_string(),
            phase,
            checksum,
        });
    }

    fn arm_stall_timer(&mut self, transfer_id: &str, after: Duration) {
        let notify = Arc::clone(&self.on_stall);
        let id = transfer_id.to_string();
        self.timers
            .arm(transfer_id, after, move |generation| notify(id, generation));
    }
}
