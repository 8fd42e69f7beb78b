//! # Async Facade for the Binlog
//!
//! The engine is strictly single-owner: one `&mut Binlog`, one thread. This
//! module provides the shared async handle on top of it, for applications
//! that want to append from many tasks without threading a mutable engine
//! reference around.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Tokio Runtime                          │
//! │   task1 ─┐                                                   │
//! │   task2 ─┼── tokio::sync::mpsc ──────────────┐               │
//! │   task3 ─┘      (async send)                 │               │
//! └──────────────────────────────────────────────┼───────────────┘
//!                                                ▼
//!                                    ┌───────────────────────┐
//!                                    │  Dedicated OS Thread  │
//!                                    │  ┌─────────────────┐  │
//!                                    │  │     Binlog      │  │
//!                                    │  │  (file + lock)  │  │
//!                                    │  └─────────────────┘  │
//!                                    └───────────────────────┘
//! ```
//!
//! The engine lives on a dedicated thread that owns it outright; tasks talk
//! to it through an async channel with a oneshot response per request. This
//! preserves the engine's ordering guarantees (requests are applied in
//! channel order) and keeps the advisory file lock semantics intact.
//!
//! Id allocation happens on the engine thread as part of [`SpiteLog::add`],
//! so concurrent appenders can never interleave an id draw with another
//! task's append.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::crypto::DbKey;
use crate::engine::{Binlog, BinlogOptions};
use crate::error::{Error, Result};
use crate::types::{BinlogEvent, BinlogInfo, EventId};

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 1024;

// =============================================================================
// Request Types
// =============================================================================

enum Request {
    Add {
        event_type: i32,
        payload: Vec<u8>,
        response: oneshot::Sender<Result<EventId>>,
    },
    AddEvent {
        event: BinlogEvent,
        response: oneshot::Sender<Result<()>>,
    },
    NextEventId {
        response: oneshot::Sender<EventId>,
    },
    Flush {
        response: oneshot::Sender<Result<()>>,
    },
    Sync {
        response: oneshot::Sender<Result<()>>,
    },
    ChangeKey {
        db_key: DbKey,
        response: oneshot::Sender<Result<()>>,
    },
    Info {
        response: oneshot::Sender<BinlogInfo>,
    },
    Shutdown {
        sync: bool,
        response: oneshot::Sender<Result<()>>,
    },
}

// =============================================================================
// SpiteLog - The Async Handle
// =============================================================================

/// Clone-able async handle to a binlog engine running on its own thread.
///
/// All clones share the one engine; requests from any clone are applied in
/// channel order. After [`SpiteLog::shutdown`] (from any clone) every
/// operation returns [`Error::Closed`].
///
/// # Example
///
/// ```rust,ignore
/// use spitelog::{BinlogOptions, SpiteLog};
///
/// #[tokio::main]
/// async fn main() -> spitelog::Result<()> {
///     let (log, replayed) = SpiteLog::open("events.binlog", BinlogOptions::new()).await?;
///     println!("replayed {} live events", replayed.len());
///
///     let id = log.add(0, b"user created".to_vec()).await?;
///     log.sync().await?;
///     println!("event {id} is durable");
///
///     log.shutdown(true).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
#[derive(Debug)]
pub struct SpiteLog {
    tx: mpsc::Sender<Request>,
    engine_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SpiteLog {
    /// Opens the binlog on a dedicated engine thread.
    ///
    /// Returns the handle plus every live event replayed during load, in id
    /// order. Open errors (wrong password, lock contention, I/O) surface
    /// here, exactly as from [`Binlog::open`].
    pub async fn open<P: AsRef<Path>>(
        path: P,
        options: BinlogOptions,
    ) -> Result<(SpiteLog, Vec<BinlogEvent>)> {
        let path = path.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let (open_tx, open_rx) = oneshot::channel();

        // The engine is not Sync and holds the file lock: a dedicated thread
        // owns it, tasks reach it through the channel.
        let handle = thread::Builder::new()
            .name("spitelog-engine".to_string())
            .spawn(move || {
                let mut replayed = Vec::new();
                let opened = Binlog::open(&path, options, |event| replayed.push(event.clone()));
                let mut binlog = match opened {
                    Ok(binlog) => {
                        if open_tx.send(Ok(replayed)).is_err() {
                            return;
                        }
                        binlog
                    }
                    Err(err) => {
                        let _ = open_tx.send(Err(err));
                        return;
                    }
                };
                run_engine(&mut binlog, rx);
            })
            .map_err(Error::Io)?;

        let replayed = match open_rx.await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Closed),
        };

        Ok((
            SpiteLog {
                tx,
                engine_handle: Arc::new(Mutex::new(Some(handle))),
            },
            replayed,
        ))
    }

    /// Appends a payload under a freshly allocated id and returns that id.
    ///
    /// Safe to call from concurrent tasks: the id is drawn on the engine
    /// thread, atomically with the append.
    pub async fn add(&self, event_type: i32, payload: Vec<u8>) -> Result<EventId> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(Request::Add {
            event_type,
            payload,
            response: response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Appends a pre-built event (rewrites, erases, partial groups).
    pub async fn add_event(&self, event: BinlogEvent) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(Request::AddEvent {
            event,
            response: response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Allocates the next event id without appending anything.
    ///
    /// Each draw is served on the engine thread, so concurrent callers
    /// always receive distinct, monotonically increasing ids. Prefer
    /// [`SpiteLog::add`] when the id is only needed for a plain append; draw
    /// explicitly when building partial groups or pre-framed events.
    pub async fn next_event_id(&self) -> Result<EventId> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(Request::NextEventId {
            response: response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| Error::Closed)
    }

    /// Drains every pending byte to the OS.
    pub async fn flush(&self) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(Request::Flush {
            response: response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Flush plus fsync; appended events are durable once this returns.
    pub async fn sync(&self) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(Request::Sync {
            response: response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Re-encrypts the binlog under a new passphrase.
    pub async fn change_key(&self, db_key: DbKey) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(Request::ChangeKey {
            db_key,
            response: response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Current open summary.
    pub async fn info(&self) -> Result<BinlogInfo> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(Request::Info {
            response: response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| Error::Closed)
    }

    /// Closes the engine (optionally syncing first) and joins its thread.
    ///
    /// Other clones of the handle observe [`Error::Closed`] afterwards.
    pub async fn shutdown(self, sync: bool) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        let close_result = match self
            .tx
            .send(Request::Shutdown {
                sync,
                response: response_tx,
            })
            .await
        {
            Ok(()) => response_rx.await.unwrap_or(Ok(())),
            // Engine already gone; shutting down twice is not an error.
            Err(_) => Ok(()),
        };

        if let Some(handle) = self.engine_handle.lock().await.take() {
            let _ = handle.join();
        }
        close_result
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.tx.send(request).await.map_err(|_| Error::Closed)
    }
}

// =============================================================================
// Engine Thread
// =============================================================================

/// Request loop running on the dedicated engine thread. Exits on shutdown or
/// when the last handle is dropped; either way the engine closes cleanly.
fn run_engine(binlog: &mut Binlog, mut rx: mpsc::Receiver<Request>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Add {
                event_type,
                payload,
                response,
            } => {
                let _ = response.send(binlog.add(event_type, &payload));
            }
            Request::AddEvent { event, response } => {
                let _ = response.send(binlog.add_event(event));
            }
            Request::NextEventId { response } => {
                let _ = response.send(binlog.next_event_id());
            }
            Request::Flush { response } => {
                let _ = response.send(binlog.flush());
            }
            Request::Sync { response } => {
                let _ = response.send(binlog.sync());
            }
            Request::ChangeKey { db_key, response } => {
                let _ = response.send(binlog.change_key(db_key));
            }
            Request::Info { response } => {
                let _ = response.send(binlog.info().clone());
            }
            Request::Shutdown { sync, response } => {
                let _ = response.send(binlog.close(sync));
                return;
            }
        }
    }
    let _ = binlog.close(false);
}
