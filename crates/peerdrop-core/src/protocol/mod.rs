//! PeerDrop wire protocol.
//!
//! The data channel carries two kinds of frames:
//!
//! - **Text frames** hold JSON control messages. Every message is an object
//!   with a numeric `type` field and (for file messages) a `transferId`.
//! - **Binary frames** hold file data only (`FILE_DATA`).
//!
//! ## Binary Frame Format
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────┬─────────────┬─────────────┐
//! │ message type │ transfer id len  │    offset    │ transfer id │   payload   │
//! │  u32 (LE)    │    u32 (LE)      │   u32 (LE)   │  id_len B   │  remainder  │
//! └──────────────┴──────────────────┴──────────────┴─────────────┴─────────────┘
//! ```
//!
//! The offset is expressed in decoded (original file) bytes, so a transfer
//! is limited to 4 GiB.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::CompressionAlgorithm;
use crate::error::{Error, Result};

/// Fixed binary header size in bytes.
pub const BINARY_HEADER_SIZE: usize = 12;

/// Maximum accepted transfer id length.
pub const MAX_TRANSFER_ID_LEN: usize = 256;

/// Largest file size a transfer can declare.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Message types of the PeerDrop protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Announce a file before sending it
    FileInfo = 0,
    /// Begin a transfer
    FileStart = 1,
    /// File bytes (binary frames only)
    FileData = 2,
    /// Sender-side summary after the handshake
    FileComplete = 3,
    /// Transfer failed on the remote side
    FileError = 4,
    /// Receiver progress acknowledgment
    FileAck = 5,
    /// No more data frames for this transfer
    FileEnd = 6,
    /// Receiver confirms `FileEnd`
    FileEndAck = 7,
    /// RTT probe
    Ping = 8,
    /// RTT probe response
    Pong = 9,
}

impl MessageType {
    /// Parse a message type from its wire value.
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::FileInfo),
            1 => Some(Self::FileStart),
            2 => Some(Self::FileData),
            3 => Some(Self::FileComplete),
            4 => Some(Self::FileError),
            5 => Some(Self::FileAck),
            6 => Some(Self::FileEnd),
            7 => Some(Self::FileEndAck),
            8 => Some(Self::Ping),
            9 => Some(Self::Pong),
            _ => None,
        }
    }

    /// Wire value of this message type.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Protocol name of this message type.
    pub const fn name(self) -> &'static str {
        match self {
            Self::FileInfo => "FILE_INFO",
            Self::FileStart => "FILE_START",
            Self::FileData => "FILE_DATA",
            Self::FileComplete => "FILE_COMPLETE",
            Self::FileError => "FILE_ERROR",
            Self::FileAck => "FILE_ACK",
            Self::FileEnd => "FILE_END",
            Self::FileEndAck => "FILE_END_ACK",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A binary large object surfaced by a channel.
///
/// Browsers may hand binary messages over as blobs; the core reads them
/// fully into memory before parsing.
pub struct Blob {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    size_hint: Option<usize>,
}

impl Blob {
    /// Wrap an async reader as a blob.
    pub fn new<R>(reader: R, size_hint: Option<usize>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            size_hint,
        }
    }

    /// Create a blob backed by in-memory bytes.
    pub fn from_bytes(bytes: Bytes) -> Self {
        let len = bytes.len();
        Self::new(std::io::Cursor::new(bytes), Some(len))
    }

    /// Read the blob into a contiguous buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reader fails.
    pub async fn into_bytes(mut self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.size_hint.unwrap_or(0));
        self.reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("size_hint", &self.size_hint)
            .finish_non_exhaustive()
    }
}

/// A frame as delivered by, or handed to, a data channel.
#[derive(Debug)]
pub enum Frame {
    /// A string message (JSON control message)
    Text(String),
    /// A binary message
    Binary(Bytes),
    /// A binary message that still has to be read
    Blob(Blob),
}

impl Frame {
    /// Size of the frame on the wire, if known without reading it.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Text(text) => Some(text.len()),
            Self::Binary(bytes) => Some(bytes.len()),
            Self::Blob(blob) => blob.size_hint,
        }
    }
}

/// A binary `FILE_DATA` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Transfer this chunk belongs to
    pub transfer_id: String,
    /// Offset of the decoded chunk within the file
    pub offset: u32,
    /// Encoded chunk bytes
    pub payload: Bytes,
}

impl DataFrame {
    /// Create a new data frame.
    pub fn new(transfer_id: impl Into<String>, offset: u32, payload: Bytes) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            offset,
            payload,
        }
    }

    /// Encode this frame into its binary wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer id is too long.
    pub fn encode(&self) -> Result<Bytes> {
        let id = self.transfer_id.as_bytes();
        if id.len() > MAX_TRANSFER_ID_LEN {
            return Err(Error::ProtocolError(format!(
                "transfer id too long: {} bytes",
                id.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(BINARY_HEADER_SIZE + id.len() + self.payload.len());
        buf.put_u32_le(MessageType::FileData.as_u32());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(id.len() as u32);
        buf.put_u32_le(self.offset);
        buf.put_slice(id);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode a binary frame.
    ///
    /// The payload is sliced out of `frame` without copying.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is truncated, is not a `FILE_DATA`
    /// frame, or carries an invalid transfer id.
    pub fn decode(frame: &Bytes) -> Result<Self> {
        if frame.len() < BINARY_HEADER_SIZE {
            return Err(Error::ProtocolError(format!(
                "binary frame too short: {} bytes",
                frame.len()
            )));
        }

        let message_type = read_u32_le(frame, 0);
        if MessageType::from_u32(message_type) != Some(MessageType::FileData) {
            return Err(Error::ProtocolError(format!(
                "unexpected binary message type: {message_type}"
            )));
        }

        let id_len = read_u32_le(frame, 4) as usize;
        let offset = read_u32_le(frame, 8);

        if id_len > MAX_TRANSFER_ID_LEN || BINARY_HEADER_SIZE + id_len > frame.len() {
            return Err(Error::ProtocolError(format!(
                "invalid transfer id length: {id_len}"
            )));
        }

        let id_end = BINARY_HEADER_SIZE + id_len;
        let transfer_id = std::str::from_utf8(&frame[BINARY_HEADER_SIZE..id_end])
            .map_err(|e| Error::ProtocolError(format!("transfer id is not UTF-8: {e}")))?
            .to_string();

        Ok(Self {
            transfer_id,
            offset,
            payload: frame.slice(id_end..),
        })
    }

    /// Wrap the encoded frame for a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_frame(&self) -> Result<Frame> {
        self.encode().map(Frame::Binary)
    }
}

fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// `FILE_INFO` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfoPayload {
    /// Transfer the file will be sent under
    pub transfer_id: String,
    /// File name
    pub file_name: String,
    /// File size in bytes
    pub file_size: u64,
}

/// `FILE_START` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStartPayload {
    /// Transfer id
    pub transfer_id: String,
    /// File name
    pub file_name: String,
    /// Declared file size in bytes
    pub file_size: u64,
    /// Per-chunk transform applied by the sender
    #[serde(default, skip_serializing_if = "CompressionAlgorithm::is_none")]
    pub compression: CompressionAlgorithm,
}

/// `FILE_COMPLETE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCompletePayload {
    /// Transfer id
    pub transfer_id: String,
    /// Total bytes sent
    pub total_bytes: u64,
    /// xxHash3-64 of the file contents (hex)
    pub checksum: String,
    /// Transfer duration in milliseconds
    pub transfer_time: u64,
}

/// `FILE_ERROR` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileErrorPayload {
    /// Transfer id
    pub transfer_id: String,
    /// Error message
    pub error: String,
}

/// `FILE_ACK` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAckPayload {
    /// Transfer id
    pub transfer_id: String,
    /// Cumulative received percentage (0-100)
    pub progress: u8,
    /// Cumulative received bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<u64>,
}

/// Payload of messages that only carry a transfer id (`FILE_END`, `FILE_END_ACK`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferIdPayload {
    /// Transfer id
    pub transfer_id: String,
}

/// `PING` / `PONG` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Correlation id echoed by the pong
    pub id: String,
}

/// A JSON control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `FILE_INFO`
    FileInfo(FileInfoPayload),
    /// `FILE_START`
    FileStart(FileStartPayload),
    /// `FILE_COMPLETE`
    FileComplete(FileCompletePayload),
    /// `FILE_ERROR`
    FileError(FileErrorPayload),
    /// `FILE_ACK`
    FileAck(FileAckPayload),
    /// `FILE_END`
    FileEnd(TransferIdPayload),
    /// `FILE_END_ACK`
    FileEndAck(TransferIdPayload),
    /// `PING`
    Ping(PingPayload),
    /// `PONG`
    Pong(PingPayload),
}

impl ControlMessage {
    /// Build a `FILE_END` message.
    pub fn file_end(transfer_id: impl Into<String>) -> Self {
        Self::FileEnd(TransferIdPayload {
            transfer_id: transfer_id.into(),
        })
    }

    /// Build a `FILE_END_ACK` message.
    pub fn file_end_ack(transfer_id: impl Into<String>) -> Self {
        Self::FileEndAck(TransferIdPayload {
            transfer_id: transfer_id.into(),
        })
    }

    /// Build a `FILE_ERROR` message.
    pub fn file_error(transfer_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::FileError(FileErrorPayload {
            transfer_id: transfer_id.into(),
            error: error.into(),
        })
    }

    /// Message type of this message.
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::FileInfo(_) => MessageType::FileInfo,
            Self::FileStart(_) => MessageType::FileStart,
            Self::FileComplete(_) => MessageType::FileComplete,
            Self::FileError(_) => MessageType::FileError,
            Self::FileAck(_) => MessageType::FileAck,
            Self::FileEnd(_) => MessageType::FileEnd,
            Self::FileEndAck(_) => MessageType::FileEndAck,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
        }
    }

    /// Transfer id carried by this message, if any.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Self::FileInfo(p) => Some(&p.transfer_id),
            Self::FileStart(p) => Some(&p.transfer_id),
            Self::FileComplete(p) => Some(&p.transfer_id),
            Self::FileError(p) => Some(&p.transfer_id),
            Self::FileAck(p) => Some(&p.transfer_id),
            Self::FileEnd(p) | Self::FileEndAck(p) => Some(&p.transfer_id),
            Self::Ping(_) | Self::Pong(_) => None,
        }
    }

    /// Encode this message as a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        let mut value = match self {
            Self::FileInfo(p) => to_value(p)?,
            Self::FileStart(p) => to_value(p)?,
            Self::FileComplete(p) => to_value(p)?,
            Self::FileError(p) => to_value(p)?,
            Self::FileAck(p) => to_value(p)?,
            Self::FileEnd(p) | Self::FileEndAck(p) => to_value(p)?,
            Self::Ping(p) | Self::Pong(p) => to_value(p)?,
        };

        let object = value
            .as_object_mut()
            .ok_or_else(|| Error::Internal("control payload is not an object".to_string()))?;
        object.insert(
            "type".to_string(),
            serde_json::Value::from(self.message_type().as_u32()),
        );

        serde_json::to_string(&value).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Wrap the encoded message for a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_frame(&self) -> Result<Frame> {
        self.encode().map(Frame::Text)
    }
}

fn to_value<T: Serialize>(payload: &T) -> Result<serde_json::Value> {
    serde_json::to_value(payload).map_err(|e| Error::Serialization(e.to_string()))
}

fn from_value<T: for<'de> Deserialize<'de>>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A control message
    Control(ControlMessage),
    /// A file data chunk
    Data(DataFrame),
    /// A well-formed message with a type this peer does not know
    Unrecognized {
        /// Raw `type` value
        type_code: u64,
    },
}

/// Parse a text (JSON) frame.
///
/// Unknown `type` values produce [`Inbound::Unrecognized`]; they are never
/// coerced into a known message.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object with a numeric `type`,
/// if a known message is missing fields, or if `FILE_DATA` arrives as text.
pub fn parse_text(text: &str) -> Result<Inbound> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Error::Serialization(e.to_string()))?;

    let type_code = value
        .get("type")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| Error::ProtocolError("missing numeric 'type' field".to_string()))?;

    let Some(message_type) = u32::try_from(type_code).ok().and_then(MessageType::from_u32) else {
        return Ok(Inbound::Unrecognized { type_code });
    };

    let message = match message_type {
        MessageType::FileInfo => ControlMessage::FileInfo(from_value(value)?),
        MessageType::FileStart => ControlMessage::FileStart(from_value(value)?),
        MessageType::FileComplete => ControlMessage::FileComplete(from_value(value)?),
        MessageType::FileError => ControlMessage::FileError(from_value(value)?),
        MessageType::FileAck => ControlMessage::FileAck(from_value(value)?),
        MessageType::FileEnd => ControlMessage::FileEnd(from_value(value)?),
        MessageType::FileEndAck => ControlMessage::FileEndAck(from_value(value)?),
        MessageType::Ping => ControlMessage::Ping(from_value(value)?),
        MessageType::Pong => ControlMessage::Pong(from_value(value)?),
        MessageType::FileData => {
            return Err(Error::ProtocolError(
                "FILE_DATA must be sent as a binary frame".to_string(),
            ));
        }
    };

    Ok(Inbound::Control(message))
}

/// Parse any inbound frame, reading blobs into memory first.
///
/// # Errors
///
/// Returns an error if the frame is malformed or a blob cannot be read.
pub async fn decode_frame(frame: Frame) -> Result<Inbound> {
    match frame {
        Frame::Text(text) => parse_text(&text),
        Frame::Binary(bytes) => DataFrame::decode(&bytes).map(Inbound::Data),
        Frame::Blob(blob) => {
            let bytes = blob.into_bytes().await?;
            DataFrame::decode(&bytes).map(Inbound::Data)
        }
    }
}
