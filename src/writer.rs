use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::{Buf, Bytes, BytesMut};
use snafu::{ResultExt, Snafu};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use crate::{
    bio::Bio,
    common::{
        unix_seconds, AofConfig, FsyncPolicy, FLUSH_POSTPONE_LIMIT, FSYNC_INTERVAL,
        PENDING_BUF_SHRINK_BYTES,
    },
    manifest::{ManifestError, SharedManifest},
    record::{encode_command, encode_select, encode_ts_annotation},
};

/// Error that occurred during calls to [`Writer`].
#[derive(Debug, Snafu)]
pub enum WriterError {
    /// A general I/O error occurred.
    ///
    /// Write failures under `EverySec`/`Never` are recoverable: the
    /// unwritten bytes stay buffered and the next flush retries. Failures
    /// under `Always` never surface here, as they terminate the process.
    #[snafu(display("writer I/O error: {}", source))]
    Io { source: io::Error },

    /// Persisting the manifest during rotation failed; the live manifest and
    /// the current tail are untouched.
    #[snafu(display("failed to persist manifest during rotation: {}", source))]
    Rotation { source: ManifestError },
}

/// Whether the writer is appending, and into what kind of tail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriterState {
    /// Not appending; commands are not recorded.
    Off,
    /// Appending to a manifest-installed incremental segment.
    On,
    /// Appending to a temporary incremental whose final name will be
    /// assigned by the rewrite that is producing the first base.
    WaitRewrite,
}

/// Replication offset counter: total bytes ever appended to the log.
///
/// The durable counterpart — the largest offset whose bytes have been
/// fsynced — is published through [`Bio`].
pub(crate) struct ReplState {
    pub offset: AtomicU64,
}

impl ReplState {
    pub fn new() -> Self {
        Self {
            offset: AtomicU64::new(0),
        }
    }
}

/// Buffers propagated commands and flushes them to the tail incremental
/// segment, enforcing the configured fsync policy.
pub(crate) struct Writer {
    config: Arc<AofConfig>,
    manifest: Arc<SharedManifest>,
    bio: Bio,
    repl: Arc<ReplState>,
    /// Set while a rewrite child is running; checked for
    /// `no_fsync_on_rewrite`.
    rewrite_child_active: Arc<AtomicBool>,
    file: Option<tokio::fs::File>,
    buf: BytesMut,
    state: WriterState,
    last_incr_size: u64,
    last_incr_fsync_offset: u64,
    last_fsync_at: Instant,
    postponed_flush_start: Option<Instant>,
    selected_db: Option<u32>,
    last_ts_sec: i64,
    last_write_ok: bool,
    delayed_fsyncs: u64,
    warned_fsync_skip: bool,
    /// Total on-disk size of the log (base plus incrementals), maintained
    /// incrementally as writes land.
    current_size: u64,
}

impl Writer {
    pub fn new(
        config: Arc<AofConfig>,
        manifest: Arc<SharedManifest>,
        bio: Bio,
        repl: Arc<ReplState>,
        rewrite_child_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            manifest,
            bio,
            repl,
            rewrite_child_active,
            file: None,
            buf: BytesMut::new(),
            state: WriterState::Off,
            last_incr_size: 0,
            last_incr_fsync_offset: 0,
            last_fsync_at: Instant::now(),
            postponed_flush_start: None,
            selected_db: None,
            last_ts_sec: 0,
            last_write_ok: true,
            delayed_fsyncs: 0,
            warned_fsync_skip: false,
            current_size: 0,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn set_state(&mut self, state: WriterState) {
        self.state = state;
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn set_current_size(&mut self, size: u64) {
        self.current_size = size;
    }

    pub fn last_incr_size(&self) -> u64 {
        self.last_incr_size
    }

    pub fn delayed_fsyncs(&self) -> u64 {
        self.delayed_fsyncs
    }

    pub fn last_write_ok(&self) -> bool {
        self.last_write_ok
    }

    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Discards the accumulated pending buffer. Only used when a rewrite
    /// fails while the writer was in `WaitRewrite` and the temporary tail is
    /// being thrown away with it.
    pub fn drop_pending(&mut self) {
        self.buf.clear();
    }

    /// Drops the tail descriptor without any flush or handoff. The next
    /// write reopens according to state. Only used when the tail file itself
    /// is being discarded.
    pub fn discard_tail(&mut self) {
        self.file = None;
        self.last_incr_size = 0;
        self.last_incr_fsync_offset = 0;
        self.selected_db = None;
    }

    /// Encodes one command into the pending buffer, prepending `SELECT` when
    /// the target database changed and a timestamp annotation when the epoch
    /// second advanced.
    pub fn feed_command(&mut self, db: u32, argv: &[Bytes]) {
        if self.state == WriterState::Off {
            return;
        }

        let before = self.buf.len();

        if self.config.timestamp_annotations {
            let now = unix_seconds();
            if now > self.last_ts_sec {
                encode_ts_annotation(&mut self.buf, now);
                self.last_ts_sec = now;
            }
        }

        if self.selected_db != Some(db) {
            encode_select(&mut self.buf, db);
            self.selected_db = Some(db);
        }

        encode_command(&mut self.buf, argv);

        self.repl
            .offset
            .fetch_add((self.buf.len() - before) as u64, Ordering::AcqRel);
    }

    /// Flushes the pending buffer to the tail segment and runs the fsync
    /// stage according to policy.
    ///
    /// With `force` unset under `EverySec`, the flush is postponed while a
    /// background fsync is in flight, for at most the postponement window;
    /// past it the write is forced through and the delayed-fsync counter is
    /// incremented.
    #[instrument(skip(self), level = "trace")]
    pub async fn flush(&mut self, force: bool) -> Result<(), WriterError> {
        if self.state == WriterState::Off {
            return Ok(());
        }

        if self.buf.is_empty() {
            let unsynced = self.last_incr_size > self.last_incr_fsync_offset;
            let due = match self.config.fsync {
                FsyncPolicy::Always => unsynced,
                FsyncPolicy::EverySec => {
                    unsynced && self.last_fsync_at.elapsed() >= FSYNC_INTERVAL
                }
                FsyncPolicy::Never => false,
            };
            if due {
                self.fsync_stage().await;
            }
            return Ok(());
        }

        if self.config.fsync == FsyncPolicy::EverySec && !force && self.bio.fsync_in_flight() {
            match self.postponed_flush_start {
                None => {
                    self.postponed_flush_start = Some(Instant::now());
                    return Ok(());
                }
                Some(start) if start.elapsed() < FLUSH_POSTPONE_LIMIT => return Ok(()),
                Some(_) => {
                    self.delayed_fsyncs += 1;
                    debug!(
                        "Background fsync still in flight past the postponement window, \
                         writing through anyway."
                    );
                }
            }
        }
        self.postponed_flush_start = None;

        if self.file.is_none() {
            self.open_for_append().await?;
        }

        self.write_pending().await?;
        self.fsync_stage().await;

        Ok(())
    }

    /// Opens the segment the writer should append to, according to state:
    /// the manifest tail under `On` (creating and persisting the first
    /// incremental if none exists), the temporary incremental under
    /// `WaitRewrite`.
    pub async fn open_for_append(&mut self) -> Result<(), WriterError> {
        match self.state {
            WriterState::Off => Ok(()),
            WriterState::WaitRewrite => self.open_new_incr().await,
            WriterState::On => {
                let live = self.manifest.load();
                let Some(tail) = live.incrs().last() else {
                    drop(live);
                    return self.open_new_incr().await;
                };

                let name = tail.name.clone();
                let path = self.config.segment_path(&name);
                let file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&path)
                    .await
                    .context(IoSnafu)?;
                let len = file.metadata().await.context(IoSnafu)?.len();

                debug!(segment = %name, existing_size = len, "Opened tail incremental for append.");

                self.file = Some(file);
                self.last_incr_size = len;
                // Whatever the tail held at startup is as durable as it will
                // get; only new bytes are tracked against the fsync offset.
                self.last_incr_fsync_offset = len;
                Ok(())
            }
        }
    }

    /// Rotates to a fresh incremental segment.
    ///
    /// Under `WaitRewrite` this opens the temporary incremental and touches
    /// no manifest state: the rewrite assigns the final name on success.
    /// Otherwise a new incremental is allocated on a staged manifest copy
    /// which is persisted before the pointer swap; failure leaves the live
    /// manifest and current tail untouched.
    #[instrument(skip(self), level = "debug")]
    pub async fn open_new_incr(&mut self) -> Result<(), WriterError> {
        let file = match self.state {
            WriterState::WaitRewrite => {
                let path = self.config.temp_incr_path();
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&path)
                    .await
                    .context(IoSnafu)?;
                debug!(path = ?path, "Opened temporary incremental; the rewrite assigns its final name.");
                file
            }
            _ => {
                let mut staged = self.manifest.load().dup();
                let name = staged.new_incr_name(&self.config.file_prefix);
                let path = self.config.segment_path(&name);
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&path)
                    .await
                    .context(IoSnafu)?;

                if let Err(e) = staged.persist(&self.config).await {
                    drop(file);
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(WriterError::Rotation { source: e });
                }
                self.manifest.swap(Arc::new(staged));

                debug!(segment = %name, "Rotated to a new incremental segment.");
                file
            }
        };

        // Fsync-before-close on the old tail: buffered bytes must reach disk
        // before the descriptor goes away.
        if let Some(prev) = self.file.take() {
            let std_file = prev.into_std().await;
            self.bio
                .submit_fsync_and_close(std_file, self.repl.offset.load(Ordering::Acquire));
        }

        self.file = Some(file);
        self.last_incr_size = 0;
        self.last_incr_fsync_offset = 0;
        // A fresh segment carries no database context.
        self.selected_db = None;
        Ok(())
    }

    /// Flushes whatever is pending and hands the tail descriptor to the
    /// background worker, leaving the writer off.
    pub async fn shut_down(&mut self) -> Result<(), WriterError> {
        if self.state == WriterState::Off {
            return Ok(());
        }

        let result = self.flush(true).await;
        if let Some(file) = self.file.take() {
            let std_file = file.into_std().await;
            self.bio
                .submit_fsync_and_close(std_file, self.repl.offset.load(Ordering::Acquire));
        }
        self.state = WriterState::Off;
        self.selected_db = None;
        result
    }

    async fn write_pending(&mut self) -> Result<(), WriterError> {
        let total = self.buf.len();
        let file = self
            .file
            .as_mut()
            .expect("tail file must be open before writing");

        let mut written = 0usize;
        let error = loop {
            if written == total {
                break None;
            }
            match file.write(&self.buf[written..]).await {
                Ok(0) => {
                    break Some(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned zero bytes",
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Some(e),
            }
        };

        match error {
            None => {
                self.last_incr_size += total as u64;
                self.current_size += total as u64;
                if !self.last_write_ok {
                    info!("Write to the append log succeeded after a previous failure.");
                    self.last_write_ok = true;
                }
                self.buf.clear();
                if self.buf.capacity() > PENDING_BUF_SHRINK_BYTES {
                    self.buf = BytesMut::new();
                }
                Ok(())
            }
            Some(error) => {
                if written > 0 {
                    // Drop the partial tail so the segment ends on a command
                    // boundary; if even that fails, account the partial bytes
                    // and retry only the remainder later.
                    if file.set_len(self.last_incr_size).await.is_ok() {
                        written = 0;
                    } else {
                        error!("Failed to truncate a partially-written tail.");
                    }
                }

                if self.config.fsync == FsyncPolicy::Always {
                    error!(
                        %error,
                        "Cannot write to the append log with fsync policy 'always'; \
                         exiting now to honor the durability contract."
                    );
                    std::process::exit(1);
                }

                error!(%error, "Failed writing to the append log; retrying on next flush.");
                self.last_write_ok = false;
                if written > 0 {
                    self.last_incr_size += written as u64;
                    self.current_size += written as u64;
                    self.buf.advance(written);
                }
                Err(WriterError::Io { source: error })
            }
        }
    }

    async fn fsync_stage(&mut self) {
        if self.config.no_fsync_on_rewrite && self.rewrite_child_active.load(Ordering::Acquire) {
            if self.config.fsync == FsyncPolicy::Always && !self.warned_fsync_skip {
                warn!(
                    "Skipping fsync under policy 'always' because a rewrite is running and \
                     no-fsync-on-rewrite is set; durability is weakened until it completes."
                );
                self.warned_fsync_skip = true;
            }
            return;
        }
        self.warned_fsync_skip = false;

        match self.config.fsync {
            FsyncPolicy::Always => {
                let Some(file) = self.file.as_ref() else {
                    return;
                };
                if let Err(error) = file.sync_data().await {
                    error!(
                        %error,
                        "Cannot fsync the append log with policy 'always'; \
                         exiting now to honor the durability contract."
                    );
                    std::process::exit(1);
                }
                self.last_fsync_at = Instant::now();
                self.last_incr_fsync_offset = self.last_incr_size;
                self.bio
                    .publish_durable(self.repl.offset.load(Ordering::Acquire));
            }
            FsyncPolicy::EverySec => {
                if self.bio.fsync_in_flight() || self.last_fsync_at.elapsed() < FSYNC_INTERVAL {
                    return;
                }
                let Some(file) = self.file.as_ref() else {
                    return;
                };
                match file.try_clone().await {
                    Ok(clone) => {
                        let std_file = clone.into_std().await;
                        self.bio
                            .submit_fsync(std_file, self.repl.offset.load(Ordering::Acquire));
                        self.last_fsync_at = Instant::now();
                        self.last_incr_fsync_offset = self.last_incr_size;
                    }
                    Err(error) => {
                        warn!(%error, "Failed to clone the tail descriptor for background fsync.");
                    }
                }
            }
            FsyncPolicy::Never => {}
        }
    }
}
