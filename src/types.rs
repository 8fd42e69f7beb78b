//! # Domain Types for the Binlog
//!
//! This module defines the core types: event ids, event flags, service
//! types, the [`BinlogEvent`] record itself, and the [`BinlogInfo`] summary
//! reported after open. Uses the newtype pattern for ids so they can't be
//! mixed up with sizes or offsets.
//!
//! ## Events
//!
//! An event is the minimum on-disk unit. Producers assign each non-rewrite
//! event a strictly increasing 64-bit id; an event may later be superseded
//! (rewritten) or erased by appending another event with the same id and the
//! [`EVENT_FLAG_REWRITE`] flag. The full framed bytes are retained in
//! [`BinlogEvent::raw`] so compaction can re-emit an event verbatim without
//! re-serializing it.

use std::fmt;

use crate::codec;
use crate::error::Result;

// =============================================================================
// Event Id
// =============================================================================

/// A 64-bit producer-assigned identifier for a logical record.
///
/// Ids are monotonic for non-rewrite events; a rewrite reuses the id of the
/// event it supersedes. Draw fresh ids from
/// [`Binlog::next_event_id`](crate::Binlog::next_event_id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId(pub u64);

impl EventId {
    /// The id used by service events that do not identify a logical record.
    pub const ZERO: EventId = EventId(0);
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self {
        EventId(value)
    }
}

// =============================================================================
// Event Flags and Types
// =============================================================================

/// This event supersedes the prior live event with the same id. Combined
/// with [`SERVICE_TYPE_EMPTY`] it erases the id instead.
pub const EVENT_FLAG_REWRITE: u32 = 1;

/// This event is a prefix member of a logically atomic group. It stays
/// invisible until a non-partial event completes the group, at which point
/// the whole group is applied and written as a contiguous unit.
pub const EVENT_FLAG_PARTIAL: u32 = 1 << 1;

/// Sentinel type for erasure: a rewrite whose replacement carries this type
/// removes the id from the live set.
pub const SERVICE_TYPE_EMPTY: i32 = -2;

/// Key-establishment record. Everything after this frame is AES-CTR
/// ciphertext under the key it describes; the frame itself stays cleartext.
pub const SERVICE_TYPE_AES_CTR_ENCRYPTION: i32 = -3;

// =============================================================================
// BinlogEvent
// =============================================================================

/// A single event record.
///
/// The framed bytes in `raw` are authoritative: the header fields and the
/// payload are parsed views of them. `flags` is the one exception: the
/// engine clears [`EVENT_FLAG_PARTIAL`] in memory while accumulating a
/// group, without touching the bytes that go to disk.
#[derive(Debug, Clone)]
pub struct BinlogEvent {
    /// Producer-assigned identifier.
    pub id: EventId,

    /// 32-bit type tag. Negative values are service types interpreted by
    /// the engine; non-negative values belong to the caller.
    pub event_type: i32,

    /// In-memory view of the flag bits. See [`EVENT_FLAG_REWRITE`] and
    /// [`EVENT_FLAG_PARTIAL`].
    pub flags: u32,

    /// The full frame as it appears on disk: length, header, payload, CRC.
    pub raw: Vec<u8>,

    /// File offset at which this frame *ended*; assigned when the event is
    /// read back from disk, zero for freshly created events.
    pub offset: u64,
}

impl BinlogEvent {
    /// Creates an event, framing the payload immediately.
    ///
    /// # Panics
    ///
    /// Panics if the payload would exceed [`codec::MAX_EVENT_SIZE`]; the cap
    /// is 16 MiB, far above any sane payload.
    pub fn new(id: EventId, event_type: i32, flags: u32, payload: &[u8]) -> Self {
        let raw = codec::encode_frame(id, event_type, flags, payload);
        BinlogEvent {
            id,
            event_type,
            flags,
            raw,
            offset: 0,
        }
    }

    /// Creates a rewrite event superseding the live event with `id`.
    pub fn rewrite(id: EventId, event_type: i32, payload: &[u8]) -> Self {
        Self::new(id, event_type, EVENT_FLAG_REWRITE, payload)
    }

    /// Creates an erase event removing `id` from the live set.
    pub fn erase(id: EventId) -> Self {
        Self::new(id, SERVICE_TYPE_EMPTY, EVENT_FLAG_REWRITE, &[])
    }

    /// Parses and validates a full frame (length bounds, header, CRC).
    pub fn from_raw(raw: Vec<u8>) -> Result<Self> {
        codec::decode_frame(raw)
    }

    /// The opaque payload bytes inside the frame.
    pub fn data(&self) -> &[u8] {
        codec::frame_payload(&self.raw)
    }

    /// Total size of the frame on disk, in bytes.
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn is_rewrite(&self) -> bool {
        self.flags & EVENT_FLAG_REWRITE != 0
    }

    pub fn is_partial(&self) -> bool {
        self.flags & EVENT_FLAG_PARTIAL != 0
    }

    /// Service events carry a negative type and are interpreted by the
    /// engine rather than handed to the caller.
    pub fn is_service(&self) -> bool {
        self.event_type < 0
    }
}

impl fmt::Display for BinlogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event[id={}, type={}, flags={:#x}, size={}]",
            self.id,
            self.event_type,
            self.flags,
            self.raw.len()
        )
    }
}

// =============================================================================
// BinlogInfo
// =============================================================================

/// Summary of an open binlog, filled in during load.
#[derive(Debug, Clone, Default)]
pub struct BinlogInfo {
    /// The file did not exist before this open.
    pub was_created: bool,

    /// The engine currently owns the file. Cleared by close.
    pub is_opened: bool,

    /// The key-establishment record matched neither provided key. The open
    /// that observed this also returned [`Error::WrongPassword`].
    ///
    /// [`Error::WrongPassword`]: crate::error::Error::WrongPassword
    pub wrong_password: bool,

    /// Highest event id seen in the file at load time.
    pub last_id: EventId,
}

// =============================================================================
// Tests
// =============================================================================
