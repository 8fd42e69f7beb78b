//! # SpiteLog - Encrypted Binlog Engine
//!
//! SpiteLog is an append-only, optionally encrypted binary log ("binlog")
//! with in-place compaction. It provides:
//!
//! - **Write-ahead journaling**: append events, replay the current logical
//!   state on startup through a callback
//! - **Rewrite/erase semantics**: supersede or remove earlier events by id
//! - **Passphrase encryption**: AES-CTR over the file, keys derived with
//!   PBKDF2 and verified before a single encrypted byte is interpreted
//! - **Compaction ("reindex")**: atomic rewrite of the file down to its
//!   live events, without interrupting the append stream
//! - **Crash safety**: torn tails are truncated on open, interrupted
//!   compactions are healed from the `.new` sidecar
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Async Facade (SpiteLog)                     │
//! │               (clone-able handle, tokio channels)               │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Binlog Engine                            │
//! │              (single thread, owns file + lock)                  │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │ Events Buffer│  │ Partial-Group│  │   Live-Event Index   │  │
//! │  │  (optional)  │  │  Accumulator │  │  (id → latest event) │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │ Frame Codec  │──│   AES-CTR    │──│    Buffered File     │  │
//! │  │ (len + CRC)  │  │  (optional)  │  │  (chained buffers)   │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! These invariants are enforced throughout the codebase and must never be
//! violated:
//!
//! 1. **Single writer**: one engine owns one file, guarded by an exclusive
//!    advisory lock from open to close
//! 2. **Monotonic ids**: non-rewrite event ids strictly increase
//! 3. **Prefix durability**: bytes on disk are always a prefix of the
//!    logical event stream; after `sync` that prefix is durable
//! 4. **Group atomicity**: a partial group is invisible until completed,
//!    and reaches the file as one contiguous unit
//! 5. **Keystream hygiene**: a (key, iv) pair is never rewound against
//!    different plaintext
//!
//! ## Module Organization
//!
//! - [`error`]: the single error enum for all failure modes
//! - [`types`]: event ids, flags, [`BinlogEvent`], [`BinlogInfo`]
//! - [`codec`]: on-disk frame format and the incremental frame reader
//! - [`buffer`]: chained byte buffers for the read/write pipelines
//! - [`crypto`]: key derivation, key-establishment records, AES-CTR state
//! - [`processor`]: the live-event index replay is served from
//! - [`events_buffer`]: optional write coalescing in front of the engine
//! - [`engine`]: the [`Binlog`] engine (open/append/flush/sync/reindex)
//! - [`api`]: the [`SpiteLog`] async facade

pub mod api;
pub mod buffer;
pub mod codec;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events_buffer;
pub mod processor;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================
// Commonly used types at the crate root, so users can write
// `use spitelog::Binlog` instead of `use spitelog::engine::Binlog`.

pub use api::SpiteLog;
pub use crypto::DbKey;
pub use engine::{Binlog, BinlogOptions};
pub use error::{Error, Result};
pub use types::{
    BinlogEvent, BinlogInfo, EventId, EVENT_FLAG_PARTIAL, EVENT_FLAG_REWRITE, SERVICE_TYPE_EMPTY,
};
