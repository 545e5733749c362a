//! Binary wire format for chunk transfer and for the merged video artifact.
//!
//! A chunk upload carries a stream with exactly one chunk. The merged
//! artifact the store assembles on finalization is the same stream holding
//! every chunk of the session in index order, so a truncated or corrupted
//! merged artifact fails to decode (checksum) and its decoded duration is the
//! sum of the durations it actually contains.
//!
//! ## Wire Format
//!
//! ```text
//! [Header: 16 bytes] [Chunk 1] [Chunk 2] ... [Chunk N]
//! ```
//!
//! ### Header (16 bytes, little-endian)
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Magic: 0x4B4E4843 ("CHNK") |
//! | 4 | 4 | Version: 1 |
//! | 8 | 4 | Chunk count (u32) |
//! | 12 | 4 | CRC32 checksum (of all data after header) |
//!
//! ### Per-Chunk (26 + session_id_len + payload_len bytes)
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | chunk_index (u32) |
//! | 4 | 8 | capture_start_ms (i64) |
//! | 12 | 8 | duration_ms (u64) |
//! | 20 | 2 | session_id_len (u16) |
//! | 22 | 4 | payload_len (u32) |
//! | 26 | S | session_id (UTF-8) |
//! | 26+S | N | payload (raw bytes) |

use std::fmt;

/// Magic number: "CHNK" in ASCII (little-endian)
pub const MAGIC: u32 = 0x4B4E4843;

/// Protocol version
pub const VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Per-chunk header size (before session id and payload)
pub const CHUNK_HEADER_SIZE: usize = 26;

/// Content-Type header value for this format
pub const CONTENT_TYPE: &str = "application/x-chunk-stream";

/// Chunk data for wire transfer
#[derive(Debug, Clone, PartialEq)]
pub struct WireChunk {
    pub session_id: String,
    pub chunk_index: u32,
    pub capture_start_ms: i64,
    pub duration_ms: u64,
    pub payload: Vec<u8>,
}

/// Errors that can occur during decoding
#[derive(Debug)]
pub enum DecodeError {
    /// Magic number doesn't match expected value
    InvalidMagic { expected: u32, got: u32 },
    /// Protocol version is not supported
    UnsupportedVersion { expected: u32, got: u32 },
    /// Header is incomplete
    TruncatedHeader { expected: usize, got: usize },
    /// Chunk header is incomplete
    TruncatedChunk {
        chunk_position: usize,
        expected: usize,
        got: usize,
    },
    /// Session id or payload length exceeds available data
    InvalidDataLen {
        chunk_position: usize,
        claimed: usize,
        available: usize,
    },
    /// Session id bytes are not UTF-8
    InvalidSessionId { chunk_position: usize },
    /// Bytes left over after the declared chunk count
    TrailingBytes { count: usize },
    /// CRC32 checksum doesn't match
    ChecksumMismatch { expected: u32, computed: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidMagic { expected, got } => {
                write!(
                    f,
                    "Invalid magic number: expected 0x{:08X}, got 0x{:08X}",
                    expected, got
                )
            }
            DecodeError::UnsupportedVersion { expected, got } => {
                write!(
                    f,
                    "Unsupported protocol version: expected {}, got {}",
                    expected, got
                )
            }
            DecodeError::TruncatedHeader { expected, got } => {
                write!(
                    f,
                    "Truncated header: expected {} bytes, got {}",
                    expected, got
                )
            }
            DecodeError::TruncatedChunk {
                chunk_position,
                expected,
                got,
            } => {
                write!(
                    f,
                    "Truncated chunk {}: expected {} bytes, got {}",
                    chunk_position, expected, got
                )
            }
            DecodeError::InvalidDataLen {
                chunk_position,
                claimed,
                available,
            } => {
                write!(
                    f,
                    "Chunk {} claims {} bytes of data, but only {} available",
                    chunk_position, claimed, available
                )
            }
            DecodeError::InvalidSessionId { chunk_position } => {
                write!(f, "Chunk {} has a session id that is not UTF-8", chunk_position)
            }
            DecodeError::TrailingBytes { count } => {
                write!(f, "{} unexpected bytes after the last chunk", count)
            }
            DecodeError::ChecksumMismatch { expected, computed } => {
                write!(
                    f,
                    "CRC32 checksum mismatch: expected 0x{:08X}, computed 0x{:08X}",
                    expected, computed
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode chunks to binary wire format.
///
/// The CRC32 checksum covers all chunk data (everything after the header).
pub fn encode_chunks(chunks: &[WireChunk]) -> Vec<u8> {
    let chunks_size: usize = chunks
        .iter()
        .map(|c| CHUNK_HEADER_SIZE + c.session_id.len() + c.payload.len())
        .sum();
    let mut buf = Vec::with_capacity(HEADER_SIZE + chunks_size);

    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // CRC32 placeholder

    for chunk in chunks {
        let session_id = chunk.session_id.as_bytes();
        buf.extend_from_slice(&chunk.chunk_index.to_le_bytes());
        buf.extend_from_slice(&chunk.capture_start_ms.to_le_bytes());
        buf.extend_from_slice(&chunk.duration_ms.to_le_bytes());
        buf.extend_from_slice(&(session_id.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(chunk.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(session_id);
        buf.extend_from_slice(&chunk.payload);
    }

    let crc = crc32fast::hash(&buf[HEADER_SIZE..]);
    buf[12..16].copy_from_slice(&crc.to_le_bytes());

    buf
}

/// Encode a single chunk, the body of one upload request
pub fn encode_chunk(chunk: &WireChunk) -> Vec<u8> {
    encode_chunks(std::slice::from_ref(chunk))
}

fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

fn read_u64(data: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}

/// Decode chunks from binary wire format.
///
/// Validates magic number, version, and CRC32 checksum before returning chunks.
pub fn decode_chunks(data: &[u8]) -> Result<Vec<WireChunk>, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::TruncatedHeader {
            expected: HEADER_SIZE,
            got: data.len(),
        });
    }

    let magic = read_u32(data, 0);
    if magic != MAGIC {
        return Err(DecodeError::InvalidMagic {
            expected: MAGIC,
            got: magic,
        });
    }

    let version = read_u32(data, 4);
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion {
            expected: VERSION,
            got: version,
        });
    }

    let count = read_u32(data, 8) as usize;
    let expected_crc = read_u32(data, 12);

    let computed_crc = crc32fast::hash(&data[HEADER_SIZE..]);
    if computed_crc != expected_crc {
        return Err(DecodeError::ChecksumMismatch {
            expected: expected_crc,
            computed: computed_crc,
        });
    }

    let mut chunks = Vec::with_capacity(count.min(4096));
    let mut pos = HEADER_SIZE;

    for i in 0..count {
        if pos + CHUNK_HEADER_SIZE > data.len() {
            return Err(DecodeError::TruncatedChunk {
                chunk_position: i,
                expected: CHUNK_HEADER_SIZE,
                got: data.len() - pos,
            });
        }

        let chunk_index = read_u32(data, pos);
        let capture_start_ms = read_u64(data, pos + 4) as i64;
        let duration_ms = read_u64(data, pos + 12);
        let session_id_len = read_u16(data, pos + 20) as usize;
        let payload_len = read_u32(data, pos + 22) as usize;
        pos += CHUNK_HEADER_SIZE;

        let needed = session_id_len + payload_len;
        if pos + needed > data.len() {
            return Err(DecodeError::InvalidDataLen {
                chunk_position: i,
                claimed: needed,
                available: data.len() - pos,
            });
        }

        let session_id = std::str::from_utf8(&data[pos..pos + session_id_len])
            .map_err(|_| DecodeError::InvalidSessionId { chunk_position: i })?
            .to_string();
        pos += session_id_len;

        let payload = data[pos..pos + payload_len].to_vec();
        pos += payload_len;

        chunks.push(WireChunk {
            session_id,
            chunk_index,
            capture_start_ms,
            duration_ms,
            payload,
        });
    }

    if pos != data.len() {
        return Err(DecodeError::TrailingBytes {
            count: data.len() - pos,
        });
    }

    Ok(chunks)
}

/// Decode a stream that must contain exactly one chunk
pub fn decode_single_chunk(data: &[u8]) -> Result<WireChunk, DecodeError> {
    let mut chunks = decode_chunks(data)?;
    match chunks.len() {
        1 => Ok(chunks.remove(0)),
        n => Err(DecodeError::TruncatedChunk {
            chunk_position: n,
            expected: 1,
            got: n,
        }),
    }
}

/// Playable duration of a decoded stream: the sum of its chunk durations
pub fn decoded_duration_ms(chunks: &[WireChunk]) -> u64 {
    chunks
        .iter()
        .map(|c| c.duration_ms)
        .fold(0u64, u64::saturating_add)
}
