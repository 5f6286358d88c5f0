//! Per-chunk byte transforms and integrity checksums.
//!
//! Every `FILE_DATA` payload passes through a [`ChunkCodec`]. The codec is
//! chosen by the sender, announced in `FILE_START`, and applied to each
//! chunk independently so chunks can be decoded as they arrive.
//!
//! Offsets on the wire always refer to decoded bytes.

use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::error::{Error, Result};

/// Chunk transform identifier carried in `FILE_START`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Chunks are sent as-is
    #[default]
    None,
    /// Each chunk is an independent zstd frame
    Zstd,
}

impl CompressionAlgorithm {
    /// Whether this is the identity transform.
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Zstd => f.write_str("zstd"),
        }
    }
}

/// When the sender compresses outgoing chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// Compress unless the file name says the content is already compressed
    #[default]
    Auto,
    /// Always compress
    Always,
    /// Never compress
    Never,
}

/// Extensions of formats that are already compressed.
const INCOMPRESSIBLE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "avif", "mp4", "mkv", "webm", "mov", "avi",
    "mp3", "aac", "ogg", "flac", "m4a", "opus", "zip", "gz", "bz2", "xz", "7z", "rar", "zst",
    "lz4", "tgz", "pdf", "docx", "xlsx", "pptx", "epub", "woff2", "apk", "jar",
];

impl CompressionMode {
    /// Pick the algorithm for a file with the given name.
    pub fn select(self, file_name: &str) -> CompressionAlgorithm {
        match self {
            Self::Never => CompressionAlgorithm::None,
            Self::Always => CompressionAlgorithm::Zstd,
            Self::Auto => {
                let incompressible = Path::new(file_name)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| {
                        INCOMPRESSIBLE_EXTENSIONS
                            .iter()
                            .any(|known| known.eq_ignore_ascii_case(ext))
                    });
                if incompressible {
                    CompressionAlgorithm::None
                } else {
                    CompressionAlgorithm::Zstd
                }
            }
        }
    }
}

/// A reversible per-chunk transform.
///
/// `decode(encode(x)) == x` must hold for every chunk.
pub trait ChunkCodec: Send + Sync + fmt::Debug {
    /// Algorithm announced on the wire.
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Transform a chunk before it is framed.
    fn encode(&self, chunk: Bytes) -> Result<Bytes>;

    /// Reverse [`ChunkCodec::encode`] on a received payload.
    ///
    /// Output stops after `limit + 1` bytes, so a result longer than
    /// `limit` means the chunk does not fit and nothing larger was held.
    fn decode(&self, payload: Bytes, limit: usize) -> Result<Bytes>;
}

/// Pass-through codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl ChunkCodec for IdentityCodec {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn encode(&self, chunk: Bytes) -> Result<Bytes> {
        Ok(chunk)
    }

    fn decode(&self, payload: Bytes, _limit: usize) -> Result<Bytes> {
        Ok(payload)
    }
}

/// Zstandard codec, one frame per chunk.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    /// Create a codec with the given compression level (1-22).
    pub const fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ChunkCodec for ZstdCodec {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zstd
    }

    fn encode(&self, chunk: Bytes) -> Result<Bytes> {
        zstd::stream::encode_all(Cursor::new(chunk), self.level)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(format!("zstd compress failed: {e}")))
    }

    fn decode(&self, payload: Bytes, limit: usize) -> Result<Bytes> {
        let decompress_failed =
            |e: std::io::Error| Error::Codec(format!("zstd decompress failed: {e}"));
        let decoder =
            zstd::stream::read::Decoder::new(Cursor::new(payload)).map_err(decompress_failed)?;

        let mut out = Vec::new();
        decoder
            .take(limit as u64 + 1)
            .read_to_end(&mut out)
            .map_err(decompress_failed)?;
        Ok(Bytes::from(out))
    }
}

/// Build the codec for an algorithm.
pub fn codec_for(algorithm: CompressionAlgorithm, level: i32) -> Arc<dyn ChunkCodec> {
    match algorithm {
        CompressionAlgorithm::None => Arc::new(IdentityCodec),
        CompressionAlgorithm::Zstd => Arc::new(ZstdCodec::new(level)),
    }
}

/// xxHash3-64 of a complete buffer, as 16 hex digits.
pub fn checksum(data: &[u8]) -> String {
    format!("{:016x}", xxh3_64(data))
}

/// Incremental form of [`checksum`] for streamed sources.
#[derive(Clone)]
pub struct StreamingChecksum {
    hasher: Xxh3,
}

impl StreamingChecksum {
    /// Start a new checksum.
    pub fn new() -> Self {
        Self {
            hasher: Xxh3::new(),
        }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Hex digest of everything fed so far.
    pub fn finish(&self) -> String {
        format!("{:016x}", self.hasher.digest())
    }
}

impl Default for StreamingChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamingChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingChecksum").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_codec_shrinks_text() {
        let codec = ZstdCodec::default();
        let original = Bytes::from(b"Repetitive text that compresses well. ".repeat(200));

        let encoded = codec.encode(original.clone()).unwrap();
        assert!(encoded.len() < original.len() / 2);
        assert_eq!(codec.decode(encoded, original.len()).unwrap(), original);
    }

    #[test]
    fn test_zstd_decode_stops_past_limit() {
        let codec = ZstdCodec::default();
        let bomb = codec.encode(Bytes::from(vec![0u8; 16 * 1024 * 1024])).unwrap();
        assert!(bomb.len() < 4096);

        let decoded = codec.decode(bomb, 1000).unwrap();
        assert_eq!(decoded.len(), 1001);
    }

    #[test]
    fn test_zstd_decode_invalid() {
        let result = ZstdCodec::default().decode(Bytes::from_static(b"not zstd"), 1024);
        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn test_identity_codec() {
        let data = Bytes::from_static(b"abc");
        assert_eq!(IdentityCodec.encode(data.clone()).unwrap(), data);
        assert_eq!(IdentityCodec.algorithm(), CompressionAlgorithm::None);
    }

    #[test]
    fn test_mode_select() {
        assert_eq!(
            CompressionMode::Auto.select("notes.txt"),
            CompressionAlgorithm::Zstd
        );
        assert_eq!(
            CompressionMode::Auto.select("holiday.JPG"),
            CompressionAlgorithm::None
        );
        assert_eq!(
            CompressionMode::Never.select("notes.txt"),
            CompressionAlgorithm::None
        );
        assert_eq!(
            CompressionMode::Always.select("movie.mp4"),
            CompressionAlgorithm::Zstd
        );
    }

    #[test]
    fn test_streaming_checksum_matches_oneshot() {
        let data = b"hello world, hello peers".repeat(50);
        let mut streaming = StreamingChecksum::new();
        for piece in data.chunks(7) {
            streaming.update(piece);
        }
        assert_eq!(streaming.finish(), checksum(&data));
        assert_eq!(checksum(&data).len(), 16);
    }

    #[test]
    fn test_algorithm_serde() {
        let json = serde_json::to_string(&CompressionAlgorithm::Zstd).unwrap();
        assert_eq!(json, "\"zstd\"");
        let mode: CompressionMode = serde_json::from_str("\"never\"").unwrap();
        assert_eq!(mode, CompressionMode::Never);
    }
}
