//! Data channel abstraction.
//!
//! The transfer core runs over any [`Channel`]: an ordered, reliable,
//! bidirectional transport carrying text and binary frames (a WebRTC data
//! channel in a browser deployment). Ordering and reliability are
//! preconditions; the core never reorders or retransmits frames itself.
//!
//! [`memory_pair`] builds two connected in-process endpoints, optionally
//! with simulated latency, for tests and local demos.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::{Blob, Frame};

/// Connection state reported by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Negotiating
    Connecting,
    /// Ready for traffic
    Open,
    /// Connectivity lost; may recover
    Disconnected,
    /// Connectivity failed for good
    Failed,
    /// Closed by either side
    Closed,
}

impl ChannelState {
    /// Transient loss of connectivity.
    pub const fn is_disconnect(self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Unrecoverable failure.
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something a channel reports to its subscriber.
#[derive(Debug)]
pub enum ChannelEvent {
    /// An inbound frame
    Message(Frame),
    /// A connection state change
    StateChange(ChannelState),
}

/// An ordered, reliable, bidirectional frame transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queue a frame for delivery to the peer.
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Bytes queued locally but not yet delivered.
    fn buffered_amount(&self) -> usize;

    /// Take the inbound event stream. Returns `None` after the first call.
    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    /// Current connection state.
    fn state(&self) -> ChannelState;
}

/// Options for [`memory_pair_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryChannelOptions {
    /// One-way delivery delay
    pub latency: Duration,
    /// Deliver binary frames as [`Frame::Blob`]
    pub binary_as_blob: bool,
}

struct Endpoint {
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    state: Mutex<ChannelState>,
}

impl Endpoint {
    fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(ChannelState::Open),
        })
    }

    fn set_state(&self, state: ChannelState) -> bool {
        let Ok(mut current) = self.state.lock() else {
            return false;
        };
        if *current == state || *current == ChannelState::Closed {
            return false;
        }
        *current = state;
        let _ = self.events_tx.send(ChannelEvent::StateChange(state));
        true
    }

    fn state(&self) -> ChannelState {
        self.state.lock().map_or(ChannelState::Closed, |state| *state)
    }
}

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    outbound: mpsc::UnboundedSender<(Instant, Frame)>,
    buffered: Arc<AtomicUsize>,
    injected_failures: AtomicU32,
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("state", &self.local.state())
            .field("buffered", &self.buffered_amount())
            .finish_non_exhaustive()
    }
}

impl MemoryChannel {
    /// Report a state change to this end's subscriber only.
    pub fn set_state(&self, state: ChannelState) {
        self.local.set_state(state);
    }

    /// Close both ends.
    pub fn close(&self) {
        self.local.set_state(ChannelState::Closed);
        self.remote.set_state(ChannelState::Closed);
    }

    /// Make the next `count` binary sends fail with a channel error.
    ///
    /// Text frames are unaffected.
    pub fn inject_send_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::Release);
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, frame: Frame) -> Result<()> {
        if self.local.state().is_failure() {
            return Err(Error::ChannelClosed);
        }

        let injected = !matches!(frame, Frame::Text(_))
            && self
                .injected_failures
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
        if injected {
            return Err(Error::ChannelFailed("injected send failure".to_string()));
        }

        let len = frame.len().unwrap_or(0);
        self.buffered.fetch_add(len, Ordering::AcqRel);
        self.outbound
            .send((Instant::now(), frame))
            .map_err(|_| Error::ChannelClosed)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.local
            .events_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
    }

    fn state(&self) -> ChannelState {
        self.local.state()
    }
}

/// Two connected endpoints with immediate delivery.
///
/// Must be called from within a tokio runtime.
pub fn memory_pair() -> (MemoryChannel, MemoryChannel) {
    memory_pair_with(MemoryChannelOptions::default())
}

/// Two connected endpoints with the given options.
///
/// Must be called from within a tokio runtime.
pub fn memory_pair_with(options: MemoryChannelOptions) -> (MemoryChannel, MemoryChannel) {
    let a = Endpoint::new();
    let b = Endpoint::new();
    (
        endpoint(Arc::clone(&a), Arc::clone(&b), options),
        endpoint(b, a, options),
    )
}

fn endpoint(local: Arc<Endpoint>, remote: Arc<Endpoint>, options: MemoryChannelOptions) -> MemoryChannel {
    let (outbound, mut queued) = mpsc::unbounded_channel::<(Instant, Frame)>();
    let buffered = Arc::new(AtomicUsize::new(0));

    let pump_remote = Arc::clone(&remote);
    let pump_buffered = Arc::clone(&buffered);
    tokio::spawn(async move {
        while let Some((sent_at, frame)) = queued.recv().await {
            if !options.latency.is_zero() {
                tokio::time::sleep_until(sent_at + options.latency).await;
            }

            let len = frame.len().unwrap_or(0);
            pump_buffered.fetch_sub(len, Ordering::AcqRel);

            if pump_remote.state().is_failure() {
                continue;
            }
            let frame = match frame {
                Frame::Binary(bytes) if options.binary_as_blob => {
                    Frame::Blob(Blob::from_bytes(bytes))
                }
                other => other,
            };
            let _ = pump_remote.events_tx.send(ChannelEvent::Message(frame));
        }
    });

    MemoryChannel {
        local,
        remote,
        outbound,
        buffered,
        injected_failures: AtomicU32::new(0),
    }
}
