use std::{
    fs::File,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use crossbeam_utils::atomic::AtomicCell;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};

/// A job handed off to the background I/O worker. File handles are owned by
/// the job from the moment it is enqueued.
enum BioJob {
    /// Fsync the file and publish `repl_offset` as durably synced.
    Fsync { file: File, repl_offset: u64 },
    /// Fsync, then close. Used when rotating away from a tail segment so no
    /// reordering can lose bytes still buffered on the old descriptor.
    FsyncAndClose { file: File, repl_offset: u64 },
    /// Delete a file. Failures are logged and otherwise ignored.
    Unlink { path: PathBuf },
}

struct BioShared {
    /// Number of fsync-carrying jobs submitted but not yet completed.
    fsync_in_flight: AtomicU64,
    /// Whether the most recent background fsync succeeded.
    fsync_ok: AtomicBool,
    /// Highest replication offset whose bytes are known durable.
    durable_offset: AtomicU64,
    /// Completion time of the most recent fsync job.
    last_fsync_completed: AtomicCell<Instant>,
    /// Signalled every time an fsync job completes.
    fsync_done: Notify,
}

/// Handle for submitting background I/O jobs.
///
/// The owning side never waits on an individual job; it can only observe
/// whether any fsync is in flight, drain them all, and read the published
/// durable offset.
#[derive(Clone)]
pub(crate) struct Bio {
    tx: mpsc::UnboundedSender<BioJob>,
    shared: Arc<BioShared>,
}

impl Bio {
    /// Spawns the worker task and returns the submission handle plus the
    /// worker's join handle for shutdown.
    pub fn spawn() -> (Bio, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BioShared {
            fsync_in_flight: AtomicU64::new(0),
            fsync_ok: AtomicBool::new(true),
            durable_offset: AtomicU64::new(0),
            last_fsync_completed: AtomicCell::new(Instant::now()),
            fsync_done: Notify::new(),
        });

        let worker = tokio::spawn(run_worker(rx, Arc::clone(&shared)));

        (Bio { tx, shared }, worker)
    }

    pub fn submit_fsync(&self, file: File, repl_offset: u64) {
        self.shared.fsync_in_flight.fetch_add(1, Ordering::AcqRel);
        if self
            .tx
            .send(BioJob::Fsync { file, repl_offset })
            .is_err()
        {
            self.shared.fsync_in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn submit_fsync_and_close(&self, file: File, repl_offset: u64) {
        self.shared.fsync_in_flight.fetch_add(1, Ordering::AcqRel);
        if self
            .tx
            .send(BioJob::FsyncAndClose { file, repl_offset })
            .is_err()
        {
            self.shared.fsync_in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn submit_unlink(&self, path: PathBuf) {
        let _ = self.tx.send(BioJob::Unlink { path });
    }

    /// Whether any background fsync has been submitted but not completed.
    pub fn fsync_in_flight(&self) -> bool {
        self.shared.fsync_in_flight.load(Ordering::Acquire) > 0
    }

    /// Waits until every submitted fsync job has completed.
    pub async fn drain_fsync(&self) {
        loop {
            let notified = self.shared.fsync_done.notified();
            if self.shared.fsync_in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn fsync_ok(&self) -> bool {
        self.shared.fsync_ok.load(Ordering::Acquire)
    }

    /// Highest replication offset whose bytes are known to be on stable
    /// storage.
    pub fn durable_offset(&self) -> u64 {
        self.shared.durable_offset.load(Ordering::Acquire)
    }

    /// Publishes an offset as durable. The offset only ever moves forward.
    pub fn publish_durable(&self, offset: u64) {
        self.shared.durable_offset.fetch_max(offset, Ordering::AcqRel);
    }

    pub fn seconds_since_last_fsync(&self) -> u64 {
        self.shared.last_fsync_completed.load().elapsed().as_secs()
    }

    /// Test-only: forces the in-flight fsync counter, simulating a stalled
    /// background fsync.
    #[cfg(test)]
    pub(crate) fn force_fsync_in_flight(&self, count: u64) {
        self.shared.fsync_in_flight.store(count, Ordering::Release);
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<BioJob>, shared: Arc<BioShared>) {
    while let Some(job) = rx.recv().await {
        match job {
            BioJob::Fsync { file, repl_offset } => {
                let result = tokio::task::spawn_blocking(move || {
                    let result = file.sync_data();
                    drop(file);
                    result
                })
                .await;
                complete_fsync(&shared, flatten_join(result), repl_offset);
            }
            BioJob::FsyncAndClose { file, repl_offset } => {
                let result = tokio::task::spawn_blocking(move || {
                    let result = file.sync_all();
                    drop(file);
                    result
                })
                .await;
                complete_fsync(&shared, flatten_join(result), repl_offset);
            }
            BioJob::Unlink { path } => {
                if let Err(error) = tokio::fs::remove_file(&path).await {
                    warn!(path = ?path, %error, "Failed to unlink file in background.");
                } else {
                    trace!(path = ?path, "Unlinked file in background.");
                }
            }
        }
    }
}

fn flatten_join(
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> std::io::Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
    }
}

fn complete_fsync(shared: &BioShared, result: std::io::Result<()>, repl_offset: u64) {
    match result {
        Ok(()) => {
            shared.fsync_ok.store(true, Ordering::Release);
            shared.durable_offset.fetch_max(repl_offset, Ordering::AcqRel);
        }
        Err(error) => {
            error!(%error, "Background fsync failed.");
            shared.fsync_ok.store(false, Ordering::Release);
        }
    }

    shared.last_fsync_completed.store(Instant::now());
    shared.fsync_in_flight.fetch_sub(1, Ordering::AcqRel);
    shared.fsync_done.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_returns_once_fsyncs_complete() {
        let (bio, _worker) = Bio::spawn();
        assert!(!bio.fsync_in_flight());

        let dir = temp_dir::TempDir::new().expect("temp dir");
        let path = dir.path().join("sync-target");
        std::fs::write(&path, b"payload").expect("write");
        let file = File::open(&path).expect("open");

        bio.submit_fsync(file, 7);
        bio.drain_fsync().await;

        assert!(!bio.fsync_in_flight());
        assert!(bio.fsync_ok());
        assert_eq!(bio.durable_offset(), 7);
    }

    #[tokio::test]
    async fn unlink_removes_file() {
        let (bio, _worker) = Bio::spawn();

        let dir = temp_dir::TempDir::new().expect("temp dir");
        let path = dir.path().join("doomed");
        std::fs::write(&path, b"bytes").expect("write");

        bio.submit_unlink(path.clone());
        // Unlink jobs carry no completion signal; poll briefly.
        for _ in 0..50 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn durable_offset_is_monotonic() {
        let (bio, _worker) = Bio::spawn();
        bio.publish_durable(10);
        bio.publish_durable(5);
        assert_eq!(bio.durable_offset(), 10);
    }
}
