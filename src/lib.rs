//! # Append-only command log with multi-segment manifests.
//!
//! This crate is the persistence subsystem of an in-memory key/value store:
//! every state-mutating command is appended to an on-disk log, and replaying
//! the log after a crash or restart reconstructs the full dataset.
//!
//! ## Design constraints
//!
//! These invariants are the groundwork for keeping the design simple and
//! recoverable:
//! - the log is an ordered collection of segments, tracked by a durable
//!   manifest; segments are never rewritten in place
//! - at most one base segment exists; incremental sequence numbers are
//!   strictly ascending and never reused within a manifest
//! - the manifest is persisted (temp file, fsync, rename, directory fsync)
//!   before any segment it references must exist, with a single documented
//!   exception during rewrite
//! - one writer per log directory, enforced with an advisory lock
//! - a segment moves to history only when a successful rewrite supersedes
//!   it, and its file is deleted only after the supersession is durable
//!
//! ## On-disk layout
//!
//! Everything lives in a dedicated subdirectory of the store's data
//! directory:
//!
//! ```text
//!   appendonlydir/
//!     appendonly.aof.manifest      manifest: one `file ... seq ... type ...`
//!                                  line per segment
//!     appendonly.aof.1.base.aof    base: minimal command sequence (or a
//!                                  binary snapshot when a codec is used)
//!     appendonly.aof.1.incr.aof    incrementals: textual command framing
//! ```
//!
//! Commands use the textual request framing — `*<argc>\r\n` then
//! `$<len>\r\n<bytes>\r\n` per argument — optionally interleaved with
//! `#TS:<epoch>` annotation lines.
//!
//! ## Write path
//!
//! Commands are encoded into an in-memory buffer and flushed to the tail
//! incremental on each tick. The fsync policy decides durability: `Always`
//! fsyncs synchronously before the caller acknowledges, `EverySec` hands
//! coalesced fsyncs to a background worker, `Never` leaves it to the OS.
//! Under `EverySec` a flush is postponed (bounded by a two-second window)
//! while a background fsync is in flight, so the foreground never queues
//! behind the disk. A short write is repaired by truncating the tail back to
//! the last command boundary and retrying on the next tick.
//!
//! ## Loading
//!
//! The loader replays the base and every incremental in manifest order
//! through a replay sink that stands in for a synthetic client. A damaged
//! tail is cut back to the last complete command when truncation tolerance
//! is enabled; damage anywhere else aborts startup. A legacy single-file log
//! is migrated into the manifest layout transparently, with every migration
//! step safe to crash through.
//!
//! ## Rewrite
//!
//! A rewrite collapses the log to the minimal command sequence that
//! reproduces the dataset. The writer is first rotated onto a fresh
//! incremental, then a child task serializes an owned snapshot into a temp
//! file while foreground writes keep flowing. On success the temp file is
//! renamed over a freshly-allocated base name, superseded segments become
//! history, the manifest is persisted and swapped, and history is unlinked
//! in the background. Failures leave the live manifest untouched and are
//! rate-limited with exponential back-off after repeated occurrences.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

mod bio;
mod common;
pub mod dataset;
mod loader;
mod manifest;
mod record;
mod rewrite;
mod serializer;
mod writer;

#[cfg(test)]
mod tests;

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use fslock::LockFile;
use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;

use self::{
    bio::Bio,
    loader::load_dataset,
    manifest::SharedManifest,
    rewrite::RewriteControl,
    writer::{ReplState, Writer},
};
pub use self::{
    common::{AofConfig, AofConfigBuilder, FsyncPolicy, MANIFEST_MAX_LINE_BYTES},
    dataset::{
        DatabaseSnapshot, DatasetSnapshot, Entry, ReplayError, ReplaySink, SnapshotCodec,
        SnapshotSource, Value,
    },
    loader::{LoadOutcome, LoadReport, LoaderError},
    manifest::{BaseFormat, Manifest, ManifestError, Segment, SegmentKind},
    rewrite::{RewriteError, RewriteStart},
    writer::{WriterError, WriterState},
};

/// Error that occurred while opening the append log.
#[derive(Debug, Snafu)]
pub enum OpenError {
    /// A general I/O error occurred.
    #[snafu(display("append log I/O error: {}", source))]
    Io { source: io::Error },

    /// Another process holds the log directory's advisory lock.
    #[snafu(display(
        "failed to lock aof.lock; is another process using this append log directory?"
    ))]
    LockAlreadyHeld,

    /// The manifest could not be read.
    #[snafu(display("failed to read the manifest: {}", source))]
    BadManifest { source: ManifestError },

    /// Startup replay failed.
    #[snafu(display("failed to load the append log: {}", source))]
    Load { source: LoaderError },

    /// The tail segment could not be opened for appending.
    #[snafu(display("failed to open the append log for writing: {}", source))]
    OpenForAppend { source: WriterError },
}

/// Point-in-time view of the subsystem, the INFO-persistence equivalent.
#[derive(Clone, Debug)]
pub struct AofStatus {
    pub state: WriterState,
    pub last_write_ok: bool,
    pub last_bio_fsync_ok: bool,
    pub last_rewrite_ok: bool,
    pub rewrite_in_progress: bool,
    pub rewrite_scheduled: bool,
    pub delayed_fsyncs: u64,
    pub pending_buffer_bytes: usize,
    pub current_size: u64,
    pub rewrite_base_size: u64,
    pub incr_segments: usize,
    pub history_segments: usize,
    pub has_base: bool,
    pub repl_offset: u64,
    pub durable_offset: u64,
    pub seconds_since_last_fsync: u64,
}

/// The append-only log subsystem: writer, manifest, loader and rewrite
/// orchestration behind one owned handle with dataset lifetime.
///
/// All methods are driven from the single owning task; the only concurrency
/// underneath is the background I/O worker (fsync/close/unlink) and the
/// rewrite child, both communicating through atomics and join handles.
pub struct Aof {
    config: Arc<AofConfig>,
    manifest: Arc<SharedManifest>,
    writer: Writer,
    bio: Bio,
    bio_worker: JoinHandle<()>,
    repl: Arc<ReplState>,
    rewrite: RewriteControl,
    source: Arc<dyn SnapshotSource>,
    #[allow(dead_code)]
    lock: LockFile,
}

impl Aof {
    /// Opens the log: acquires the directory lock, migrates any legacy
    /// single-file log, replays existing segments into `sink`, and readies
    /// the writer for appending.
    ///
    /// `source` is consulted whenever a rewrite needs a dataset snapshot.
    pub async fn open(
        config: AofConfig,
        sink: &mut dyn ReplaySink,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<(Aof, LoadReport), OpenError> {
        let config = Arc::new(config);

        tokio::fs::create_dir_all(config.aof_dir())
            .await
            .context(IoSnafu)?;

        let lock_path = config.lock_path();
        let mut lock = LockFile::open(&lock_path).context(IoSnafu)?;
        if !lock.try_lock().context(IoSnafu)? {
            return Err(OpenError::LockAlreadyHeld);
        }

        let (report, manifest) = if config.start_enabled {
            let mut report = load_dataset(&config, sink).await.context(LoadSnafu)?;
            let manifest = std::mem::take(&mut report.manifest);
            (report, manifest)
        } else {
            // Not loading, but the sequence counters must continue from
            // whatever a previous run left behind.
            let manifest = Manifest::load(&config.manifest_path())
                .await
                .context(BadManifestSnafu)?
                .unwrap_or_default();
            (
                LoadReport {
                    outcome: LoadOutcome::NotExist,
                    commands: 0,
                    total_size: 0,
                    base_size: 0,
                    manifest: Manifest::default(),
                },
                manifest,
            )
        };

        let manifest = Arc::new(SharedManifest::new(manifest));
        let repl = Arc::new(ReplState::new());
        let (bio, bio_worker) = Bio::spawn();
        let child_active = Arc::new(AtomicBool::new(false));

        let writer = Writer::new(
            Arc::clone(&config),
            Arc::clone(&manifest),
            bio.clone(),
            Arc::clone(&repl),
            Arc::clone(&child_active),
        );

        let mut aof = Aof {
            config: Arc::clone(&config),
            manifest,
            writer,
            bio,
            bio_worker,
            repl,
            rewrite: RewriteControl::new(child_active),
            source,
            lock,
        };

        if config.start_enabled {
            aof.repl.offset.store(report.total_size, Ordering::Release);
            aof.bio.publish_durable(report.total_size);
            aof.writer.set_state(WriterState::On);
            aof.writer.set_current_size(report.total_size);
            aof.rewrite.rewrite_base_size = report.total_size;
            aof.writer
                .open_for_append()
                .await
                .context(OpenForAppendSnafu)?;
        }

        Ok((aof, report))
    }

    /// Whether commands are currently being recorded.
    pub fn is_enabled(&self) -> bool {
        self.writer.state() != WriterState::Off
    }

    /// Records one propagated command against database `db`.
    ///
    /// The bytes land in the pending buffer; durability follows on the next
    /// [`Aof::flush`]/[`Aof::tick`] according to policy.
    pub fn feed_command(&mut self, db: u32, argv: &[Bytes]) {
        self.writer.feed_command(db, argv);
    }

    /// Flushes the pending buffer and runs the fsync stage.
    pub async fn flush(&mut self, force: bool) -> Result<(), WriterError> {
        self.writer.flush(force).await
    }

    /// Periodic driver: collects a finished rewrite child, retries pending
    /// flushes, and starts scheduled or growth-triggered rewrites.
    pub async fn tick(&mut self) {
        self.reap_rewrite_child(false).await;

        if self.writer.state() != WriterState::Off {
            if let Err(error) = self.writer.flush(false).await {
                debug!(%error, "Flush failed; unwritten bytes retained for retry.");
            }
        }

        if self.rewrite.child.is_none() {
            let due = match self.writer.state() {
                WriterState::On => {
                    self.rewrite.scheduled
                        || self
                            .rewrite
                            .growth_exceeded(&self.config, self.writer.current_size())
                }
                WriterState::WaitRewrite => self.rewrite.scheduled,
                WriterState::Off => false,
            };

            if due {
                match self.start_background_rewrite(false).await {
                    Ok(_) => self.rewrite.scheduled = false,
                    // Stays scheduled; a later tick outlives the back-off.
                    Err(RewriteError::RateLimited { .. }) => {}
                    Err(error) => {
                        warn!(%error, "Automatic rewrite failed to start.");
                    }
                }
            }
        }
    }

    /// Manually triggers a background rewrite, bypassing the failure
    /// back-off. Returns whether it started now or was scheduled behind a
    /// running child.
    pub async fn start_rewrite(&mut self) -> Result<RewriteStart, RewriteError> {
        self.start_background_rewrite(true).await
    }

    /// Waits for a running rewrite child to exit and processes the result.
    pub async fn wait_for_rewrite(&mut self) {
        self.reap_rewrite_child(true).await;
    }

    /// Starts recording commands on a log that was opened disabled (or
    /// disabled at runtime). The first base is produced by an immediate
    /// rewrite; until it lands, commands accumulate in a temporary
    /// incremental that is finalized with the rewrite.
    pub async fn enable(&mut self) -> Result<(), RewriteError> {
        if self.writer.state() != WriterState::Off {
            return Ok(());
        }

        self.writer.set_state(WriterState::WaitRewrite);
        match self.start_background_rewrite(true).await {
            Ok(_) => Ok(()),
            Err(error) => {
                self.writer.set_state(WriterState::Off);
                Err(error)
            }
        }
    }

    /// Stops recording: aborts any rewrite child cleanly, flushes what is
    /// pending, and hands the tail descriptor to the background worker.
    pub async fn disable(&mut self) {
        if self.writer.state() == WriterState::Off {
            return;
        }

        if let Some(child) = &self.rewrite.child {
            child.cancel.cancel();
        }
        self.reap_rewrite_child(true).await;
        self.rewrite.scheduled = false;

        if let Err(error) = self.writer.shut_down().await {
            warn!(%error, "Flush during disable failed; some buffered commands were lost.");
        }
    }

    /// Total bytes ever appended to the log (the write offset).
    pub fn repl_offset(&self) -> u64 {
        self.repl.offset.load(Ordering::Acquire)
    }

    /// Largest offset whose bytes are known durable; the WAITAOF watermark.
    pub fn durable_offset(&self) -> u64 {
        self.bio.durable_offset()
    }

    /// The live manifest. The returned snapshot is immutable; a concurrent
    /// rewrite swap simply leaves the caller with the older view.
    pub fn manifest(&self) -> Arc<Manifest> {
        self.manifest.load()
    }

    pub fn status(&self) -> AofStatus {
        let manifest = self.manifest.load();
        AofStatus {
            state: self.writer.state(),
            last_write_ok: self.writer.last_write_ok(),
            last_bio_fsync_ok: self.bio.fsync_ok(),
            last_rewrite_ok: self.rewrite.last_status_ok,
            rewrite_in_progress: self.rewrite.child.is_some(),
            rewrite_scheduled: self.rewrite.scheduled,
            delayed_fsyncs: self.writer.delayed_fsyncs(),
            pending_buffer_bytes: self.writer.pending_bytes(),
            current_size: self.writer.current_size(),
            rewrite_base_size: self.rewrite.rewrite_base_size,
            incr_segments: manifest.incrs().len(),
            history_segments: manifest.history_len(),
            has_base: manifest.base().is_some(),
            repl_offset: self.repl_offset(),
            durable_offset: self.durable_offset(),
            seconds_since_last_fsync: self.bio.seconds_since_last_fsync(),
        }
    }

    /// Clean shutdown: aborts any rewrite, flushes, drains background
    /// fsyncs, and waits for the background worker to exit.
    pub async fn close(mut self) -> Result<(), WriterError> {
        if let Some(child) = &self.rewrite.child {
            child.cancel.cancel();
        }
        self.reap_rewrite_child(true).await;

        let result = self.writer.shut_down().await;
        self.bio.drain_fsync().await;

        let Aof {
            writer,
            bio,
            bio_worker,
            lock,
            ..
        } = self;
        drop(writer);
        drop(bio);
        let _ = bio_worker.await;
        drop(lock);

        result
    }
}
