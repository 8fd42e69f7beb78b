//! # Error Handling for SpiteLog
//!
//! This module defines the error types used throughout the crate. We use a
//! single error enum ([`Error`]) to represent all failure modes, which keeps
//! function signatures small and lets callers match on the handful of
//! conditions they actually care about.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Contention | `FileLocked` | Another process owns the file; back off |
//! | Authentication | `WrongPassword` | Ask the user for the right passphrase |
//! | Data | `Corruption` | The damaged tail was discarded; investigate |
//! | Environment | `Io` | Filesystem failure; the file state is suspect |
//! | Usage | `Closed` | Operation after close/shutdown; a caller bug |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in binlog operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The advisory file lock could not be acquired within the retry window.
    ///
    /// Exactly one writer may own a binlog file. The lock is retried for
    /// roughly 100 ms before giving up, which papers over the common case of
    /// a previous owner that is just now releasing it.
    #[error("binlog file is locked by another instance")]
    FileLocked,

    /// The key-establishment record matched neither `db_key` nor `old_db_key`.
    ///
    /// Load aborts before any encrypted byte is interpreted. The engine is
    /// left closed and [`BinlogInfo::wrong_password`] is set.
    ///
    /// [`BinlogInfo::wrong_password`]: crate::types::BinlogInfo::wrong_password
    #[error("wrong binlog password")]
    WrongPassword,

    /// A frame failed validation: out-of-range length, checksum mismatch, or
    /// a malformed service event payload.
    ///
    /// During load this is not fatal to the open as a whole: replay stops at
    /// the last valid event and the damaged tail is truncated. During normal
    /// operation it indicates a caller bug (duplicate or non-monotonic ids)
    /// and the offending event is rejected.
    #[error("binlog corruption: {0}")]
    Corruption(String),

    /// An underlying filesystem operation failed.
    ///
    /// When a flush or sync fails mid-run the on-disk state can no longer be
    /// reasoned about; the caller should close the binlog and treat the file
    /// as suspect.
    #[error("binlog i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine (or its background thread) has already shut down.
    #[error("binlog is closed")]
    Closed,
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
