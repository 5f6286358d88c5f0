//! # PeerDrop Core Library
//!
//! `peerdrop-core` implements the transfer core of PeerDrop: chunked,
//! acknowledged delivery of single files between two peers over an ordered,
//! reliable data channel (a WebRTC data channel in the browser deployment).
//!
//! ## Features
//!
//! - **Adaptive chunking**: chunk size follows measured RTT, bandwidth,
//!   buffer pressure and jitter
//! - **Stall detection**: size- and rate-aware silence windows per transfer
//! - **Throttled acknowledgments**: size-tiered `FILE_ACK` policy
//! - **Optional compression**: per-transfer zstd chunk encoding
//!
//! ## Modules
//!
//! - [`ack`] - Receiver acknowledgment policy
//! - [`adaptive`] - Network monitor and chunk-size controller
//! - [`channel`] - Data channel abstraction and in-memory channel pair
//! - [`codec`] - Chunk codecs and checksums
//! - [`config`] - Configuration management
//! - [`progress`] - Progress view-models
//! - [`protocol`] - Wire protocol
//! - [`queue`] - Ordered event queue
//! - [`reassembly`] - Receive-side state machine
//! - [`sender`] - Send-side transfer driver
//! - [`session`] - Per-peer transfer session
//! - [`timeout`] - Stall timeouts and timers
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use peerdrop_core::{memory_pair, Config, PeerRole, TransferSession};
//!
//! let (a, b) = memory_pair();
//! let host = TransferSession::new(PeerRole::Host, Arc::new(a), Config::default())?;
//! let client = TransferSession::new(PeerRole::Client, Arc::new(b), Config::default())?;
//!
//! let mut events = client.subscribe();
//! host.send_file("photo.jpg").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod ack;
pub mod adaptive;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod reassembly;
pub mod sender;
pub mod session;
pub mod timeout;

pub use channel::{memory_pair, memory_pair_with, Channel, ChannelEvent, ChannelState};
pub use config::Config;
pub use error::{Error, Result};
pub use reassembly::ReceivedFile;
pub use sender::SentFile;
pub use session::{PeerRole, TransferEvent, TransferSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Smallest chunk the controller will use (8 KiB)
pub const MIN_CHUNK_SIZE: usize = 8 * 1024;

/// Largest chunk the controller will use (1 MiB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk size before any adaptation (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
