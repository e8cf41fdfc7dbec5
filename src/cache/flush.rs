//! Background persistence for the fingerprint store.
//!
//! A single tokio task owns all disk writes of the record set. Callers push
//! `Schedule` commands through a bounded queue; the task coalesces them into
//! one snapshot write per `flush_delay` window. `Drain` and `Shutdown` are
//! barriers: they reply only after the snapshot has been written.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::persist;
use crate::cache::types::{CacheError, CacheRecord, CacheResult, TaskFingerprint};

pub(crate) type RecordMap = HashMap<TaskFingerprint, CacheRecord>;

/// Writes full snapshots of the shared record map to the task-cache file.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotWriter {
    path: PathBuf,
    records: Arc<RwLock<RecordMap>>,
    /// Serializes every file mutation (snapshot writes and `clear`).
    io_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SnapshotWriter {
    pub(crate) fn new(
        path: PathBuf,
        records: Arc<RwLock<RecordMap>>,
        io_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            path,
            records,
            io_lock,
        }
    }

    /// Snapshot the map and write it atomically, oldest record first.
    pub(crate) async fn write(&self) -> CacheResult<()> {
        let _io = self.io_lock.lock().await;

        let mut snapshot: Vec<CacheRecord> = {
            let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
            records.values().cloned().collect()
        };
        if snapshot.is_empty() && !self.path.exists() {
            return Ok(());
        }
        snapshot.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });

        let path = self.path.clone();
        let count = snapshot.len();
        tokio::task::spawn_blocking(move || persist::write_json_atomic(&path, &snapshot))
            .await
            .map_err(|e| CacheError::io(&self.path, std::io::Error::other(e)))??;

        debug!("Flushed {} records to {}", count, self.path.display());
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum FlushCommand {
    Schedule,
    Drain(oneshot::Sender<CacheResult<()>>),
    Shutdown(oneshot::Sender<CacheResult<()>>),
}

/// Store-side handle on the flush task.
#[derive(Debug)]
pub(crate) struct FlushHandle {
    tx: mpsc::Sender<FlushCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FlushHandle {
    /// Spawn the flush task on the current tokio runtime.
    pub(crate) fn spawn(writer: SnapshotWriter, delay: Duration, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run(writer, rx, delay));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Ask for a flush without waiting for it.
    ///
    /// A full queue already holds a pending `Schedule`, which writes the
    /// latest snapshot anyway, so it is not an error.
    pub(crate) fn schedule(&self) -> CacheResult<()> {
        match self.tx.try_send(FlushCommand::Schedule) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CacheError::StoreClosed),
        }
    }

    /// Write the current snapshot and wait for the result.
    pub(crate) async fn drain(&self) -> CacheResult<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(FlushCommand::Drain(reply))
            .await
            .map_err(|_| CacheError::StoreClosed)?;
        done.await.map_err(|_| CacheError::StoreClosed)?
    }

    /// Final write, then stop the task.
    pub(crate) async fn shutdown(&self) -> CacheResult<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(FlushCommand::Shutdown(reply))
            .await
            .map_err(|_| CacheError::StoreClosed)?;
        let result = done.await.map_err(|_| CacheError::StoreClosed)?;

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Flush task ended abnormally: {}", e);
            }
        }
        result
    }

    /// Stop the task without writing pending changes.
    pub(crate) fn abort(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

async fn run(writer: SnapshotWriter, mut rx: mpsc::Receiver<FlushCommand>, delay: Duration) {
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => {
                tokio::select! {
                    command = rx.recv() => command,
                    _ = tokio::time::sleep_until(at) => {
                        deadline = None;
                        if let Err(e) = writer.write().await {
                            warn!("Background flush failed: {}", e);
                        }
                        continue;
                    }
                }
            }
            None => rx.recv().await,
        };

        match command {
            Some(FlushCommand::Schedule) => {
                deadline.get_or_insert_with(|| Instant::now() + delay);
            }
            Some(FlushCommand::Drain(reply)) => {
                deadline = None;
                let _ = reply.send(writer.write().await);
            }
            Some(FlushCommand::Shutdown(reply)) => {
                let _ = reply.send(writer.write().await);
                break;
            }
            None => {
                if deadline.is_some() {
                    if let Err(e) = writer.write().await {
                        warn!("Final flush failed: {}", e);
                    }
                }
                break;
            }
        }
    }
    debug!("Flush task stopped");
}
