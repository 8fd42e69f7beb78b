//! # Live-Event Index
//!
//! The [`EventsProcessor`] folds a linear on-disk history into the current
//! logical set: for every id, the most recent live event. It is the
//! in-memory mirror of the file: it may lag what the caller has appended
//! (events still sitting in the coalescing buffer) but it never leads disk
//! in a way that replay could observe.
//!
//! ## Folding Rules
//!
//! - A plain event inserts under its id; ids must be strictly increasing.
//! - A rewrite must target a live id: it replaces that entry, or erases it
//!   when the replacement carries the empty service type. A rewrite of an
//!   id that is dead or was never assigned is malformed and rejected.
//! - Service events pass through: they advance the offset accounting but
//!   never appear in the live set.
//!
//! The processor also maintains the two numbers the engine's compaction
//! trigger is built on: the total bytes fed in (`offset`, equal to the file
//! position after the last consumed frame) and the total bytes of live
//! events (`total_raw_events_size`).

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::{BinlogEvent, EventId, SERVICE_TYPE_EMPTY};

/// Index from event id to the latest live event.
#[derive(Debug, Default)]
pub struct EventsProcessor {
    events: BTreeMap<EventId, BinlogEvent>,
    last_id: EventId,
    offset: u64,
    total_raw_events_size: u64,
}

impl EventsProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether an event would fold cleanly, without applying it.
    ///
    /// The engine validates before an event's bytes are committed to the
    /// write pipeline, so a rejected event never reaches the file.
    pub fn check_event(&self, event: &BinlogEvent) -> Result<()> {
        if event.is_rewrite() {
            if !self.events.contains_key(&event.id) {
                return Err(Error::Corruption(format!(
                    "rewrite of unknown event id {}",
                    event.id
                )));
            }
        } else if !event.is_service() && event.id <= self.last_id {
            return Err(Error::Corruption(format!(
                "event id {} is not greater than last id {}",
                event.id, self.last_id
            )));
        }
        Ok(())
    }

    /// Folds one event into the live set.
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] on a rewrite (or erase) of an id that is not
    /// live, or a non-rewrite id that does not exceed every previously seen
    /// id.
    pub fn add_event(&mut self, event: BinlogEvent) -> Result<()> {
        self.offset += event.raw.len() as u64;

        if event.is_rewrite() {
            // A rewrite supersedes the prior event with its id; there is
            // nothing to supersede unless that id is live.
            let old = match self.events.get(&event.id) {
                Some(old) => old,
                None => {
                    return Err(Error::Corruption(format!(
                        "rewrite of unknown event id {}",
                        event.id
                    )));
                }
            };
            self.total_raw_events_size -= old.raw.len() as u64;
            if event.event_type == SERVICE_TYPE_EMPTY {
                self.events.remove(&event.id);
            } else {
                self.total_raw_events_size += event.raw.len() as u64;
                self.events.insert(event.id, event);
            }
        } else if event.is_service() {
            // Interpreted by the engine; only the offset accounting sees it.
        } else {
            if event.id <= self.last_id {
                return Err(Error::Corruption(format!(
                    "event id {} is not greater than last id {}",
                    event.id, self.last_id
                )));
            }
            self.last_id = event.id;
            self.total_raw_events_size += event.raw.len() as u64;
            self.events.insert(event.id, event);
        }
        Ok(())
    }

    /// Visits every live event in id order.
    pub fn for_each(&self, mut f: impl FnMut(&BinlogEvent)) {
        for event in self.events.values() {
            f(event);
        }
    }

    /// Iterates live events in id order.
    pub fn live_events(&self) -> impl Iterator<Item = &BinlogEvent> {
        self.events.values()
    }

    /// Highest id ever inserted (rewrites do not move it).
    pub fn last_id(&self) -> EventId {
        self.last_id
    }

    /// Total bytes fed in; after load this equals the file position right
    /// after the last complete frame, which is what torn-tail truncation
    /// cuts back to.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total bytes of live events: the size a compacted file would have,
    /// minus the encryption record.
    pub fn total_raw_events_size(&self) -> u64 {
        self.total_raw_events_size
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
