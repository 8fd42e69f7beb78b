//! # The Binlog Engine
//!
//! [`Binlog`] owns an append-only framed event file and keeps it in lockstep
//! with an in-memory live-event index. Higher layers treat it as a
//! write-ahead journal: append events, occasionally rewrite or erase earlier
//! ones by id, and on startup replay the current logical state through a
//! callback.
//!
//! ## Pipelines
//!
//! ```text
//! append:  caller ──► events buffer (optional) ──► partial-group
//!          accumulator ──► processor (in-memory)
//!                      └─► write buffer ──► [AES-CTR] ──► file
//!
//! replay:  file ──► read buffer ──► [AES-CTR] ──► frame reader ──►
//!          processor ──► replay callback
//! ```
//!
//! The cipher stages appear once the key-establishment record has been read
//! (or written). Cipher state is a value that moves between the read and
//! write pipelines so the keystream continues exactly where it left off; it
//! is never re-created against different plaintext.
//!
//! ## State Machine
//!
//! `Load → Run ↔ Reindex`. Load streams the file through the frame reader
//! and folds it into the processor. Run appends. Reindex atomically rewrites
//! the file to contain only live events: everything is streamed into a
//! `.new` sidecar, synced, and renamed over the original: the rename is the
//! linearization point, and a crash in between is healed by the
//! rename-from-sidecar check at the next open.
//!
//! ## Ownership
//!
//! One engine owns one file, enforced by an exclusive advisory lock held
//! from open to close. All operations run in the caller's thread and either
//! complete or return an error; there are no internal suspension points.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use log::{error, info, trace, warn};

use crate::buffer::ChainBuffer;
use crate::codec::{BinlogReader, ReadOutcome};
use crate::crypto::{AesCtrEncryptionEvent, AesCtrState, DbKey, IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};
use crate::events_buffer::BinlogEventsBuffer;
use crate::processor::EventsProcessor;
use crate::types::{
    BinlogEvent, BinlogInfo, EventId, EVENT_FLAG_PARTIAL, SERVICE_TYPE_AES_CTR_ENCRYPTION,
};

// =============================================================================
// Tuning Constants
// =============================================================================

/// How long to retry the advisory lock before reporting [`Error::FileLocked`].
const LOCK_RETRY_WINDOW: Duration = Duration::from_millis(100);

/// Pause between lock attempts.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Minimum bytes demanded from the file per read during load.
const MIN_READ_CHUNK: usize = 4096;

/// Pending bytes above which `lazy_flush` flushes immediately instead of
/// arming the flush deadline.
const LAZY_FLUSH_SIZE: usize = 1 << 14;

/// Compact once the file exceeds this and holds < 1/5 live data.
const COMPACT_SMALL_SIZE: u64 = 100_000;
const COMPACT_SMALL_RATE: u64 = 5;

/// Compact once the file exceeds this and holds < 1/2 live data.
const COMPACT_LARGE_SIZE: u64 = 500_000;
const COMPACT_LARGE_RATE: u64 = 2;

// =============================================================================
// Configuration
// =============================================================================

/// Open-time configuration for [`Binlog::open`].
#[derive(Default)]
pub struct BinlogOptions {
    /// Current passphrase. Empty means the file should be unencrypted; if
    /// the on-disk state disagrees with this request, open fixes it with a
    /// reindex.
    pub db_key: DbKey,

    /// Previous passphrase, tried when `db_key` fails verification. A match
    /// re-encrypts the file under `db_key` before open returns.
    pub old_db_key: DbKey,

    /// Route appends through the write-coalescing events buffer.
    pub use_events_buffer: bool,

    /// Called once per event read during load, in file order, regardless of
    /// whether the event survives folding.
    pub debug_callback: Option<Box<dyn FnMut(&BinlogEvent) + Send>>,
}

impl BinlogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_db_key(mut self, db_key: DbKey) -> Self {
        self.db_key = db_key;
        self
    }

    pub fn with_old_db_key(mut self, old_db_key: DbKey) -> Self {
        self.old_db_key = old_db_key;
        self
    }

    pub fn with_events_buffer(mut self, enabled: bool) -> Self {
        self.use_events_buffer = enabled;
        self
    }

    pub fn with_debug_callback(
        mut self,
        callback: impl FnMut(&BinlogEvent) + Send + 'static,
    ) -> Self {
        self.debug_callback = Some(Box::new(callback));
        self
    }
}

// =============================================================================
// Engine State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Load,
    Run,
    Reindex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncryptionKind {
    None,
    AesCtr,
}

// =============================================================================
// Binlog
// =============================================================================

/// Append-only, optionally encrypted binlog with in-place compaction.
///
/// Write operations take `&mut self`: there is exactly one writer, and the
/// advisory file lock enforces the same across processes. For shared async
/// access, wrap the engine in [`SpiteLog`](crate::api::SpiteLog).
pub struct Binlog {
    path: PathBuf,
    fd: Option<File>,
    state: State,

    encryption: EncryptionKind,
    db_key: DbKey,
    old_db_key: DbKey,
    db_key_used: bool,
    aes_ctr_key_salt: Vec<u8>,
    aes_ctr_key: [u8; KEY_SIZE],
    /// Cipher state parked between pipeline rebuilds.
    aes_ctr_state: Option<AesCtrState>,
    /// Cipher spliced into the read pipeline (load only).
    read_cipher: Option<AesCtrState>,
    /// Cipher spliced into the write pipeline (run/reindex).
    write_cipher: Option<AesCtrState>,

    read_buf: ChainBuffer,
    write_buf: ChainBuffer,
    processor: EventsProcessor,
    events_buffer: Option<BinlogEventsBuffer>,
    in_flush_events_buffer: bool,
    /// Partial-group accumulator; committed when a non-partial event lands.
    pending_events: Vec<BinlogEvent>,

    /// Bytes accounted to the current file (grows with every event fed in).
    fd_size: u64,
    /// Events accounted to the current file.
    fd_events: u64,
    last_id: EventId,

    need_sync: bool,
    need_flush_since: Option<Instant>,

    debug_callback: Option<Box<dyn FnMut(&BinlogEvent) + Send>>,
    info: BinlogInfo,
}

impl std::fmt::Debug for Binlog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binlog")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("encryption", &self.encryption)
            .field("fd_size", &self.fd_size)
            .field("fd_events", &self.fd_events)
            .field("last_id", &self.last_id)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl Binlog {
    // =========================================================================
    // Open / Load
    // =========================================================================

    /// Opens (or creates) the binlog at `path`, replays every live event
    /// through `replay` in id order, and leaves the engine ready to append.
    ///
    /// If `path` is missing but a `path.new` sidecar exists, the sidecar is
    /// the committed result of an interrupted compaction and is renamed into
    /// place first.
    ///
    /// # Errors
    ///
    /// - [`Error::FileLocked`] if another instance owns the file
    /// - [`Error::WrongPassword`] if the stored key hash matches neither key
    /// - [`Error::Io`] on filesystem failure
    ///
    /// Corrupt or torn trailing data is not an error: replay stops at the
    /// last valid event and the tail is truncated.
    pub fn open<P: AsRef<Path>>(
        path: P,
        options: BinlogOptions,
        replay: impl FnMut(&BinlogEvent),
    ) -> Result<Binlog> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let sidecar = sidecar_path(&path);
            if sidecar.exists() {
                info!(
                    "recovering binlog {} from sidecar {}",
                    path.display(),
                    sidecar.display()
                );
                fs::rename(&sidecar, &path)?;
            }
        }

        let was_created = !path.exists();
        let fd = open_locked(
            &path,
            OpenOptions::new().read(true).write(true).create(true),
        )?;

        let mut binlog = Binlog {
            path,
            fd: Some(fd),
            state: State::Load,
            encryption: EncryptionKind::None,
            db_key: options.db_key,
            old_db_key: options.old_db_key,
            db_key_used: false,
            aes_ctr_key_salt: Vec::new(),
            aes_ctr_key: [0u8; KEY_SIZE],
            aes_ctr_state: None,
            read_cipher: None,
            write_cipher: None,
            read_buf: ChainBuffer::new(),
            write_buf: ChainBuffer::new(),
            processor: EventsProcessor::new(),
            events_buffer: options.use_events_buffer.then(BinlogEventsBuffer::new),
            in_flush_events_buffer: false,
            pending_events: Vec::new(),
            fd_size: 0,
            fd_events: 0,
            last_id: EventId::ZERO,
            need_sync: false,
            need_flush_since: None,
            debug_callback: options.debug_callback,
            info: BinlogInfo {
                was_created,
                ..BinlogInfo::default()
            },
        };

        if let Err(err) = binlog.load(replay) {
            let _ = binlog.close(false);
            return Err(err);
        }
        binlog.last_id = binlog.processor.last_id();
        binlog.info.last_id = binlog.last_id;

        if binlog.info.wrong_password {
            let _ = binlog.close(false);
            return Err(Error::WrongPassword);
        }

        // Make the on-disk encryption state match the requested key: encrypt
        // a plain file when a key was given but never used, decrypt (or
        // rotate) when the key no longer matches what the file declares.
        if (!binlog.db_key.is_empty() && !binlog.db_key_used)
            || (binlog.db_key.is_empty() && binlog.encryption != EncryptionKind::None)
        {
            binlog.aes_ctr_key_salt.clear();
            binlog.do_reindex()?;
        }

        binlog.info.is_opened = true;
        Ok(binlog)
    }

    fn load(&mut self, mut replay: impl FnMut(&BinlogEvent)) -> Result<()> {
        self.state = State::Load;
        self.info.wrong_password = false;
        let mut reader = BinlogReader::new();

        loop {
            match reader.read_next(&mut self.read_buf) {
                Ok(ReadOutcome::Event(event)) => {
                    if let Some(callback) = self.debug_callback.as_mut() {
                        callback(&event);
                    }
                    match self.do_add_event(event) {
                        Ok(()) => {}
                        // A frame that parses but folds inconsistently is
                        // treated like any other corrupt tail.
                        Err(Error::Corruption(message)) => {
                            error!(
                                "binlog {}: replay stopped at offset {}: {}",
                                self.path.display(),
                                reader.offset(),
                                message
                            );
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                    if self.info.wrong_password {
                        return Ok(());
                    }
                }
                Ok(ReadOutcome::NeedBytes(need)) => {
                    if self.fill_read_buf(need.max(MIN_READ_CHUNK))? == 0 {
                        break;
                    }
                }
                Err(err) => {
                    error!(
                        "binlog {}: replay stopped at offset {}: {}",
                        self.path.display(),
                        reader.offset(),
                        err
                    );
                    break;
                }
            }
        }

        let offset = self.processor.offset();
        self.processor.for_each(|event| {
            trace!("replay binlog event: {event}");
            replay(event);
        });

        let fd = self.fd.as_mut().ok_or(Error::Closed)?;
        let actual_size = fd.metadata()?.len();
        if offset != actual_size {
            warn!(
                "truncating binlog {} from {} to {} bytes",
                self.path.display(),
                actual_size,
                offset
            );
            fd.seek(SeekFrom::Start(offset))?;
            fd.set_len(offset)?;
            // The keystream position no longer matches the file tail, so the
            // end-of-open repair must rewrite the file under a fresh iv.
            self.db_key_used = false;
        }

        self.read_buf.clear();
        self.state = State::Run;
        self.write_buf.clear();

        if self.encryption == EncryptionKind::AesCtr {
            self.aes_ctr_state = self.read_cipher.take();
        }
        self.read_cipher = None;
        self.update_write_encryption();
        Ok(())
    }

    /// Reads up to `want` bytes from the file into the read buffer,
    /// decrypting them if the read pipeline has a cipher spliced in.
    /// Returns 0 only at end of file.
    fn fill_read_buf(&mut self, want: usize) -> Result<usize> {
        let fd = self.fd.as_mut().ok_or(Error::Closed)?;
        let mut chunk = vec![0u8; want];
        let n = fd.read(&mut chunk)?;
        if n == 0 {
            return Ok(0);
        }
        chunk.truncate(n);
        if let Some(cipher) = self.read_cipher.as_mut() {
            cipher.apply(&mut chunk);
        }
        self.read_buf.push_chunk(chunk);
        Ok(n)
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Appends an event.
    ///
    /// A partial event stays invisible (and unwritten) until a non-partial
    /// event completes its group, at which point the whole group reaches the
    /// file as one contiguous unit. May trigger a compaction when the file
    /// has grown far past its live content.
    pub fn add_event(&mut self, event: BinlogEvent) -> Result<()> {
        if self.fd.is_none() {
            return Err(Error::Closed);
        }
        match self.events_buffer.as_mut() {
            Some(buffer) => buffer.add_event(event),
            None => self.do_add_event(event)?,
        }
        self.lazy_flush()?;

        if self.state == State::Run {
            let mut fd_size = self.fd_size;
            if let Some(buffer) = &self.events_buffer {
                fd_size += buffer.size() as u64;
            }
            let live = self.processor.total_raw_events_size();
            let need_reindex =
                |min_size: u64, rate: u64| fd_size > min_size && fd_size / rate > live;
            if need_reindex(COMPACT_SMALL_SIZE, COMPACT_SMALL_RATE)
                || need_reindex(COMPACT_LARGE_SIZE, COMPACT_LARGE_RATE)
            {
                info!(
                    "binlog {}: compacting ({} bytes on disk, {} bytes live)",
                    self.path.display(),
                    fd_size,
                    live
                );
                self.do_reindex()?;
            }
        }
        Ok(())
    }

    /// Appends a payload under a freshly allocated id and returns that id.
    pub fn add(&mut self, event_type: i32, payload: &[u8]) -> Result<EventId> {
        debug_assert!(event_type >= 0, "service types are reserved");
        let id = self.next_event_id();
        self.add_event(BinlogEvent::new(id, event_type, 0, payload))?;
        Ok(id)
    }

    /// Supersedes the live event with `id`.
    pub fn rewrite(&mut self, id: EventId, event_type: i32, payload: &[u8]) -> Result<()> {
        debug_assert!(event_type >= 0, "service types are reserved");
        self.add_event(BinlogEvent::rewrite(id, event_type, payload))
    }

    /// Erases the live event with `id`.
    pub fn erase(&mut self, id: EventId) -> Result<()> {
        self.add_event(BinlogEvent::erase(id))
    }

    /// Allocates the next event id. Ids are monotonic across reopens: the
    /// allocator resumes from the highest id found in the file.
    pub fn next_event_id(&mut self) -> EventId {
        self.last_id = EventId(self.last_id.0 + 1);
        self.last_id
    }

    fn do_add_event(&mut self, mut event: BinlogEvent) -> Result<()> {
        if event.is_partial() {
            // The flag is cleared in memory only; the framed bytes keep it,
            // so the group re-accumulates if replayed from disk.
            event.flags &= !EVENT_FLAG_PARTIAL;
            self.pending_events.push(event);
        } else {
            for pending in std::mem::take(&mut self.pending_events) {
                self.do_event(pending)?;
            }
            self.do_event(event)?;
        }
        Ok(())
    }

    fn do_event(&mut self, event: BinlogEvent) -> Result<()> {
        // Validate first: a rejected event must never reach the file.
        if self.state != State::Reindex {
            self.processor.check_event(&event)?;
        }

        self.fd_events += 1;
        self.fd_size += event.raw.len() as u64;

        if self.state == State::Run || self.state == State::Reindex {
            trace!("write binlog event: {event}");
            self.write_buf.append(&event.raw);
        }

        if event.event_type == SERVICE_TYPE_AES_CTR_ENCRYPTION {
            self.apply_encryption_event(&event)?;
            if self.info.wrong_password {
                return Ok(());
            }
        }

        if self.state != State::Reindex {
            self.processor.add_event(event)?;
        }
        Ok(())
    }

    // =========================================================================
    // Encryption
    // =========================================================================

    /// Handles a key-establishment record, whether read from disk during
    /// load or emitted by [`Self::reset_encryption`] during reindex.
    fn apply_encryption_event(&mut self, event: &BinlogEvent) -> Result<()> {
        let record = AesCtrEncryptionEvent::decode(event.data())?;

        let mut key = [0u8; KEY_SIZE];
        let mut have_key = false;
        if !self.aes_ctr_key_salt.is_empty() && self.aes_ctr_key_salt == record.key_salt {
            // Same salt as the installed key: skip the expensive derivation.
            key = self.aes_ctr_key;
            have_key = true;
        } else if !self.db_key.is_empty() {
            key = record.generate_key(&self.db_key);
            have_key = true;
        }

        if have_key && AesCtrEncryptionEvent::generate_hash(&key)[..] == record.key_hash[..] {
            self.db_key_used = true;
        } else {
            debug_assert!(self.state == State::Load);
            let mut old_key_matched = false;
            if !self.old_db_key.is_empty() {
                let old_key = record.generate_key(&self.old_db_key);
                if AesCtrEncryptionEvent::generate_hash(&old_key)[..] == record.key_hash[..] {
                    key = old_key;
                    old_key_matched = true;
                }
            }
            if !old_key_matched {
                self.info.wrong_password = true;
                return Ok(());
            }
        }

        self.encryption = EncryptionKind::AesCtr;
        self.aes_ctr_key_salt = record.key_salt.clone();
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&record.iv);
        self.update_encryption(&key, &iv);

        match self.state {
            State::Load => {
                self.update_read_encryption();
                info!("binlog {}: reading encrypted tail", self.path.display());
            }
            State::Reindex => {
                // The record itself must leave the buffer in cleartext
                // before the write pipeline switches to encrypting mode.
                self.flush()?;
                self.update_write_encryption();
            }
            State::Run => debug_assert!(false, "encryption event outside load/reindex"),
        }
        Ok(())
    }

    fn update_encryption(&mut self, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) {
        self.aes_ctr_key = *key;
        self.aes_ctr_state = Some(AesCtrState::init(key, iv));
    }

    fn update_read_encryption(&mut self) {
        match self.encryption {
            EncryptionKind::None => self.read_cipher = None,
            EncryptionKind::AesCtr => {
                self.read_cipher = self.aes_ctr_state.take();
                // Bytes already buffered beyond the establishment frame are
                // ciphertext; bring them through the new pipeline stage.
                if let Some(cipher) = self.read_cipher.as_mut() {
                    self.read_buf.apply_mut(|region| cipher.apply(region));
                }
            }
        }
    }

    fn update_write_encryption(&mut self) {
        match self.encryption {
            EncryptionKind::None => self.write_cipher = None,
            EncryptionKind::AesCtr => self.write_cipher = self.aes_ctr_state.take(),
        }
    }

    /// Emits a fresh key-establishment record at the head of a reindexed
    /// file, or disables encryption when no key is set. Reuses the installed
    /// key when the salt is unchanged; always draws a fresh iv.
    fn reset_encryption(&mut self) -> Result<()> {
        if self.db_key.is_empty() {
            self.encryption = EncryptionKind::None;
            return Ok(());
        }

        let reuse_salt = !self.aes_ctr_key_salt.is_empty();
        let mut record =
            AesCtrEncryptionEvent::generate(reuse_salt.then(|| self.aes_ctr_key_salt.clone()));
        let key = if reuse_salt {
            self.aes_ctr_key
        } else {
            record.generate_key(&self.db_key)
        };
        record.key_hash = AesCtrEncryptionEvent::generate_hash(&key).to_vec();

        let event = BinlogEvent::new(
            EventId::ZERO,
            SERVICE_TYPE_AES_CTR_ENCRYPTION,
            0,
            &record.encode(),
        );
        self.do_event(event)
    }

    /// Re-encrypts the binlog under a new passphrase.
    ///
    /// The file is rewritten immediately (fresh salt, fresh iv); once this
    /// returns, nothing on disk is readable under the old passphrase.
    pub fn change_key(&mut self, new_db_key: DbKey) -> Result<()> {
        if self.fd.is_none() {
            return Err(Error::Closed);
        }
        self.db_key = new_db_key;
        self.aes_ctr_key_salt.clear();
        self.do_reindex()
    }

    // =========================================================================
    // Flush / Sync / Close
    // =========================================================================

    /// Drains the events buffer and writes everything pending to the OS.
    /// Encryption happens here, as bytes leave the write buffer.
    pub fn flush(&mut self) -> Result<()> {
        if self.state == State::Load {
            return Ok(());
        }
        self.flush_events_buffer(true)?;
        let mut bytes = self.write_buf.take_all();
        if let Some(cipher) = self.write_cipher.as_mut() {
            cipher.apply(&mut bytes);
        }
        if !bytes.is_empty() {
            let fd = self.fd.as_mut().ok_or(Error::Closed)?;
            fd.write_all(&bytes)?;
            self.need_sync = true;
        }
        self.need_flush_since = None;
        Ok(())
    }

    /// [`Self::flush`] plus fsync. After this returns, every event appended
    /// so far is durable.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        if self.need_sync {
            let fd = self.fd.as_mut().ok_or(Error::Closed)?;
            fd.sync_all()?;
            self.need_sync = false;
        }
        Ok(())
    }

    /// Flushes when enough bytes are pending, otherwise arms the advisory
    /// flush deadline that [`Self::need_flush_since`] reports.
    fn lazy_flush(&mut self) -> Result<()> {
        let staged = self.flush_events_buffer(false)?;
        let size = self.write_buf.len() + staged;
        if size > LAZY_FLUSH_SIZE {
            self.flush()
        } else {
            if size > 0 && self.need_flush_since.is_none() {
                self.need_flush_since = Some(Instant::now());
            }
            Ok(())
        }
    }

    fn flush_events_buffer(&mut self, force: bool) -> Result<usize> {
        let (need_flush, size) = match &self.events_buffer {
            Some(buffer) => (buffer.need_flush(), buffer.size()),
            None => return Ok(0),
        };
        if (!force && !need_flush) || self.in_flush_events_buffer {
            return Ok(size);
        }

        self.in_flush_events_buffer = true;
        let events = self
            .events_buffer
            .as_mut()
            .expect("events buffer checked above")
            .take_events();
        let mut result = Ok(());
        for event in events {
            result = self.do_add_event(event);
            if result.is_err() {
                break;
            }
        }
        self.in_flush_events_buffer = false;
        result.map(|_| 0)
    }

    /// Closes the binlog, optionally syncing first. Idempotent; releases
    /// the file lock.
    pub fn close(&mut self, need_sync: bool) -> Result<()> {
        if self.fd.is_none() {
            return Ok(());
        }
        let result = if need_sync { self.sync() } else { self.flush() };
        if let Some(fd) = self.fd.take() {
            let _ = fd.unlock();
        }
        self.info.is_opened = false;
        self.need_sync = false;
        result
    }

    /// Closes the binlog and removes the file and its sidecar.
    pub fn close_and_destroy(&mut self) -> Result<()> {
        let path = self.path.clone();
        let result = self.close(false);
        Self::destroy(&path)?;
        result
    }

    /// Removes a binlog file and its sidecar, ignoring missing files.
    pub fn destroy(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let _ = fs::remove_file(path);
        let _ = fs::remove_file(sidecar_path(path));
        Ok(())
    }

    // =========================================================================
    // Reindex
    // =========================================================================

    /// Atomically rewrites the file to contain only live events.
    ///
    /// The `.new` sidecar is the commit point: it is fully written and
    /// synced before the original is unlinked and the sidecar renamed over
    /// it. Failure to even open the sidecar is logged and swallowed: the
    /// engine keeps running on the old file and the trigger will fire again.
    fn do_reindex(&mut self) -> Result<()> {
        self.flush_events_buffer(true)?;
        debug_assert!(self.state == State::Run);
        if self.state != State::Run {
            return Ok(());
        }
        self.state = State::Reindex;
        let result = self.reindex_inner();
        self.state = State::Run;
        result
    }

    fn reindex_inner(&mut self) -> Result<()> {
        let start_time = Instant::now();
        let start_size = file_size(&self.path);
        let start_events = self.fd_events;

        let new_path = sidecar_path(&self.path);
        let new_fd = match open_locked(
            &new_path,
            OpenOptions::new().write(true).create(true).truncate(true),
        ) {
            Ok(fd) => fd,
            Err(err) => {
                error!(
                    "binlog {}: cannot open sidecar for compaction: {}",
                    self.path.display(),
                    err
                );
                return Ok(());
            }
        };
        if let Some(old_fd) = self.fd.take() {
            let _ = old_fd.unlock();
        }
        self.fd = Some(new_fd);

        self.write_buf.clear();
        self.encryption = EncryptionKind::None;
        self.update_write_encryption();

        self.fd_size = 0;
        self.fd_events = 0;
        self.reset_encryption()?;

        // Live events are re-emitted verbatim from their retained frames;
        // the processor is left untouched while in Reindex.
        let processor = std::mem::take(&mut self.processor);
        let mut result = Ok(());
        for event in processor.live_events() {
            result = self.do_event(event.clone());
            if result.is_err() {
                break;
            }
        }
        self.processor = processor;
        result?;

        // The new file's creation must itself reach disk before the rename.
        self.need_sync = true;
        self.sync()?;

        fs::remove_file(&self.path)?;
        fs::rename(&new_path, &self.path)?;

        info!(
            "binlog {}: reindexed {} -> {} bytes, {} -> {} events in {:.1?}",
            self.path.display(),
            start_size,
            self.fd_size,
            start_events,
            self.fd_events,
            start_time.elapsed()
        );

        self.write_buf.clear();
        if self.encryption == EncryptionKind::AesCtr {
            self.aes_ctr_state = self.write_cipher.take();
        }
        self.update_write_encryption();
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Open summary: creation, password verdict, highest id.
    pub fn info(&self) -> &BinlogInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes accounted to the file, including not-yet-flushed appends.
    pub fn size(&self) -> u64 {
        self.fd_size
    }

    /// Events accounted to the file, including superseded ones.
    pub fn events_count(&self) -> u64 {
        self.fd_events
    }

    /// When unflushed bytes started waiting, if any. Callers use this as an
    /// advisory deadline: flush after a grace period of their choosing.
    pub fn need_flush_since(&self) -> Option<Instant> {
        self.need_flush_since
    }
}

impl Drop for Binlog {
    fn drop(&mut self) {
        let _ = self.close(false);
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// `path.new`: the reindex sidecar.
fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".new");
    PathBuf::from(os)
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

/// Opens a file and takes the exclusive advisory lock, retrying contention
/// for [`LOCK_RETRY_WINDOW`].
fn open_locked(path: &Path, options: &OpenOptions) -> Result<File> {
    let file = options.open(path)?;
    let deadline = Instant::now() + LOCK_RETRY_WINDOW;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(err) => {
                if err.raw_os_error() != fs2::lock_contended_error().raw_os_error() {
                    return Err(Error::Io(err));
                }
                if Instant::now() >= deadline {
                    return Err(Error::FileLocked);
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_path_appends_suffix() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/events.binlog")),
            PathBuf::from("/tmp/events.binlog.new")
        );
    }

    #[test]
    fn test_open_creates_file_and_reports_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.binlog");

        let mut binlog = Binlog::open(&path, BinlogOptions::new(), |_| {}).unwrap();
        assert!(binlog.info().was_created);
        assert!(binlog.info().is_opened);
        assert!(path.exists());

        binlog.close(false).unwrap();
        assert!(!binlog.info().is_opened);

        let reopened = Binlog::open(&path, BinlogOptions::new(), |_| {}).unwrap();
        assert!(!reopened.info().was_created);
    }

    #[test]
    fn test_second_open_hits_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.binlog");

        let _first = Binlog::open(&path, BinlogOptions::new(), |_| {}).unwrap();
        let err = Binlog::open(&path, BinlogOptions::new(), |_| {}).unwrap_err();
        assert!(matches!(err, Error::FileLocked));
    }

    #[test]
    fn test_close_is_idempotent_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("close.binlog");

        let mut binlog = Binlog::open(&path, BinlogOptions::new(), |_| {}).unwrap();
        binlog.close(true).unwrap();
        binlog.close(true).unwrap();

        // The lock is gone: a fresh open succeeds immediately.
        Binlog::open(&path, BinlogOptions::new(), |_| {}).unwrap();
    }

    #[test]
    fn test_operations_after_close_report_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.binlog");

        let mut binlog = Binlog::open(&path, BinlogOptions::new(), |_| {}).unwrap();
        binlog.close(false).unwrap();

        let err = binlog.add(0, b"too late").unwrap_err();
        assert!(matches!(err, Error::Closed));
        let err = binlog.change_key(DbKey::password("pw")).unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn test_destroy_removes_file_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doomed.binlog");

        let mut binlog = Binlog::open(&path, BinlogOptions::new(), |_| {}).unwrap();
        binlog.add(0, b"x").unwrap();
        binlog.close_and_destroy().unwrap();

        assert!(!path.exists());
        assert!(!sidecar_path(&path).exists());
    }
}
