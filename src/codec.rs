//! # Frame Encoding and Incremental Decoding
//!
//! This module owns the on-disk frame format and the incremental reader used
//! during load. Every frame is little-endian:
//!
//! ```text
//! ┌────────────┬──────────┬────────────┬────────────┬─────────┬──────────┐
//! │ length u32 │  id u64  │  type i32  │ flags u32  │ payload │ crc32    │
//! │ (incl. self)│          │ <0 service │            │         │ [0,L−4)  │
//! └────────────┴──────────┴────────────┴────────────┴─────────┴──────────┘
//! ```
//!
//! The length field counts the whole frame, itself included, so the smallest
//! legal frame is an empty payload: 4 + 8 + 4 + 4 + 4 = 24 bytes. The CRC
//! covers everything before it, length field included.
//!
//! ## Incremental Reading
//!
//! [`BinlogReader`] is a two-state machine. In `ReadLength` it waits for the
//! 4-byte length and validates it against the size bounds; in `ReadEvent` it
//! waits for the full frame and hands it to [`decode_frame`]. `read_next`
//! either produces an event, or reports the minimum number of buffered bytes
//! it needs to make progress: the engine uses that demand to size its next
//! file read.

use crate::buffer::ChainBuffer;
use crate::error::{Error, Result};
use crate::types::{BinlogEvent, EventId};

// =============================================================================
// Frame Layout Constants
// =============================================================================

/// Bytes before the payload: length, id, type, flags.
pub const HEADER_SIZE: usize = 4 + 8 + 4 + 4;

/// Bytes after the payload: the CRC32.
pub const TAIL_SIZE: usize = 4;

/// Smallest legal frame (empty payload).
pub const MIN_EVENT_SIZE: usize = HEADER_SIZE + TAIL_SIZE;

/// Largest legal frame. A declared length above this is corruption, which
/// keeps a damaged length field from demanding gigabytes of buffer.
pub const MAX_EVENT_SIZE: usize = 1 << 24;

// =============================================================================
// Encoding
// =============================================================================

/// Frames a payload into its on-disk byte representation.
///
/// # Panics
///
/// Panics if the frame would exceed [`MAX_EVENT_SIZE`].
pub fn encode_frame(id: EventId, event_type: i32, flags: u32, payload: &[u8]) -> Vec<u8> {
    let total = HEADER_SIZE + payload.len() + TAIL_SIZE;
    assert!(
        total <= MAX_EVENT_SIZE,
        "event payload of {} bytes exceeds the frame cap",
        payload.len()
    );

    let mut raw = Vec::with_capacity(total);
    raw.extend_from_slice(&(total as u32).to_le_bytes());
    raw.extend_from_slice(&id.0.to_le_bytes());
    raw.extend_from_slice(&event_type.to_le_bytes());
    raw.extend_from_slice(&flags.to_le_bytes());
    raw.extend_from_slice(payload);
    let crc = crc32fast::hash(&raw);
    raw.extend_from_slice(&crc.to_le_bytes());
    raw
}

// =============================================================================
// Decoding
// =============================================================================

/// Parses and validates a complete frame.
///
/// # Errors
///
/// Returns [`Error::Corruption`] if the length field disagrees with the
/// buffer, violates the size bounds, or the CRC does not match.
pub fn decode_frame(raw: Vec<u8>) -> Result<BinlogEvent> {
    if raw.len() < MIN_EVENT_SIZE {
        return Err(Error::Corruption(format!(
            "event too small: {} bytes",
            raw.len()
        )));
    }
    if raw.len() > MAX_EVENT_SIZE {
        return Err(Error::Corruption(format!(
            "event too big: {} bytes",
            raw.len()
        )));
    }

    let declared = u32::from_le_bytes(raw[0..4].try_into().expect("sliced 4 bytes")) as usize;
    if declared != raw.len() {
        return Err(Error::Corruption(format!(
            "declared event size {} does not match {} buffered bytes",
            declared,
            raw.len()
        )));
    }

    let body_end = raw.len() - TAIL_SIZE;
    let stored_crc = u32::from_le_bytes(raw[body_end..].try_into().expect("sliced 4 bytes"));
    let actual_crc = crc32fast::hash(&raw[..body_end]);
    if stored_crc != actual_crc {
        return Err(Error::Corruption(format!(
            "crc mismatch: stored {stored_crc:#010x}, computed {actual_crc:#010x}"
        )));
    }

    let id = u64::from_le_bytes(raw[4..12].try_into().expect("sliced 8 bytes"));
    let event_type = i32::from_le_bytes(raw[12..16].try_into().expect("sliced 4 bytes"));
    let flags = u32::from_le_bytes(raw[16..20].try_into().expect("sliced 4 bytes"));

    Ok(BinlogEvent {
        id: EventId(id),
        event_type,
        flags,
        raw,
        offset: 0,
    })
}

/// The payload region of a framed event.
pub fn frame_payload(raw: &[u8]) -> &[u8] {
    &raw[HEADER_SIZE..raw.len() - TAIL_SIZE]
}

// =============================================================================
// Incremental Reader
// =============================================================================

/// What a call to [`BinlogReader::read_next`] produced.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete, validated event.
    Event(BinlogEvent),

    /// The reader needs at least this many bytes buffered before it can make
    /// progress. Always > 0.
    NeedBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    ReadLength,
    ReadEvent,
}

/// Incremental frame reader over a [`ChainBuffer`].
///
/// Tracks a running offset: after each produced event, `offset()` is the
/// file position at which that frame ended. The engine compares this against
/// the actual file size to detect (and truncate) a torn tail.
#[derive(Debug)]
pub struct BinlogReader {
    state: ReadState,
    size: usize,
    offset: u64,
}

impl BinlogReader {
    pub fn new() -> Self {
        BinlogReader {
            state: ReadState::ReadLength,
            size: 0,
            offset: 0,
        }
    }

    /// File position right after the last event produced.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Attempts to produce the next event from `input`.
    ///
    /// The length field is peeked, not consumed, so the produced frame bytes
    /// always include it.
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] if the length is out of bounds or the frame
    /// fails validation. The reader is not usable after an error.
    pub fn read_next(&mut self, input: &mut ChainBuffer) -> Result<ReadOutcome> {
        if self.state == ReadState::ReadLength {
            if input.len() < 4 {
                return Ok(ReadOutcome::NeedBytes(4));
            }
            let mut len_bytes = [0u8; 4];
            input.peek(&mut len_bytes);
            let size = u32::from_le_bytes(len_bytes) as usize;

            if size > MAX_EVENT_SIZE {
                return Err(Error::Corruption(format!("event too big: {size} bytes")));
            }
            if size < MIN_EVENT_SIZE {
                return Err(Error::Corruption(format!("event too small: {size} bytes")));
            }
            self.size = size;
            self.state = ReadState::ReadEvent;
        }

        if input.len() < self.size {
            return Ok(ReadOutcome::NeedBytes(self.size));
        }

        let mut raw = vec![0u8; self.size];
        input.read_exact(&mut raw);
        let mut event = decode_frame(raw)?;
        self.offset += self.size as u64;
        event.offset = self.offset;
        self.state = ReadState::ReadLength;
        Ok(ReadOutcome::Event(event))
    }
}

impl Default for BinlogReader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
