use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use snafu::{ResultExt, Snafu};
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    common::AofConfig,
    dataset::{DatasetSnapshot, SnapshotCodec},
    manifest::BaseFormat,
    serializer::serialize_dataset,
    writer::{WriterError, WriterState},
    Aof,
};

// Consecutive failures before automatic rewrites start backing off.
const FAILURE_THRESHOLD: u32 = 3;
const MAX_DELAY_MINUTES: u64 = 60;

/// Error that occurred while starting a rewrite.
#[derive(Debug, Snafu)]
pub enum RewriteError {
    /// A general I/O error occurred.
    #[snafu(display("rewrite I/O error: {}", source))]
    Io { source: io::Error },

    /// Automatic rewrites are currently backed off after repeated failures.
    #[snafu(display("rewrite rate-limited for {} more minute(s)", minutes))]
    RateLimited { minutes: u64 },

    /// Rotating the writer onto a fresh tail failed; nothing was started.
    #[snafu(display("failed to rotate the writer for rewrite: {}", source))]
    Rotate { source: WriterError },
}

/// How a rewrite request was handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RewriteStart {
    Started,
    /// A child is already running; a new rewrite will start when it exits.
    Scheduled,
}

pub(crate) enum ChildError {
    /// The designated clean-abort signal; not counted as a failure.
    Aborted,
    Io(io::Error),
}

pub(crate) struct RewriteChild {
    pub handle: JoinHandle<Result<(), ChildError>>,
    pub cancel: CancellationToken,
    pub temp_path: PathBuf,
    pub started: Instant,
    /// Replication offset drained to disk just before the child started;
    /// becomes the durable offset when a `WaitRewrite` rewrite completes.
    pub fsynced_reploff_pending: u64,
}

/// Exponential back-off applied to automatic rewrites after consecutive
/// failures. Manual triggers bypass it entirely.
#[derive(Debug, Default)]
pub(crate) struct RewriteBackoff {
    consecutive_failures: u32,
    delay_minutes: u64,
    delay_until: Option<Instant>,
}

impl RewriteBackoff {
    pub fn note_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= FAILURE_THRESHOLD {
            let exponent = (self.consecutive_failures - FAILURE_THRESHOLD).min(6);
            self.delay_minutes = (1u64 << exponent).min(MAX_DELAY_MINUTES);
            self.delay_until =
                Some(Instant::now() + Duration::from_secs(self.delay_minutes * 60));
            warn!(
                failures = self.consecutive_failures,
                delay_minutes = self.delay_minutes,
                "Rewrite failing repeatedly; delaying the next automatic attempt."
            );
        }
    }

    pub fn note_success(&mut self) {
        *self = RewriteBackoff::default();
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn current_delay_minutes(&self) -> u64 {
        self.delay_minutes
    }

    /// Remaining back-off, in whole minutes rounded up, if any.
    pub fn limited_minutes(&self) -> Option<u64> {
        let until = self.delay_until?;
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            None
        } else {
            Some((remaining.as_secs() + 59) / 60)
        }
    }
}

pub(crate) struct RewriteControl {
    pub child: Option<RewriteChild>,
    pub scheduled: bool,
    pub backoff: RewriteBackoff,
    pub last_status_ok: bool,
    /// Log size recorded at the last load or successful rewrite; the growth
    /// reference for automatic triggering.
    pub rewrite_base_size: u64,
    /// Shared with the writer for the `no_fsync_on_rewrite` check.
    pub child_active: Arc<AtomicBool>,
}

impl RewriteControl {
    pub fn new(child_active: Arc<AtomicBool>) -> Self {
        Self {
            child: None,
            scheduled: false,
            backoff: RewriteBackoff::default(),
            last_status_ok: true,
            rewrite_base_size: 0,
            child_active,
        }
    }

    /// Whether the log has outgrown the configured percentage over the last
    /// rewrite's size.
    pub fn growth_exceeded(&self, config: &AofConfig, current_size: u64) -> bool {
        if config.auto_rewrite_percentage == 0 {
            return false;
        }
        if current_size < config.auto_rewrite_min_size {
            return false;
        }
        let base = self.rewrite_base_size.max(1);
        let growth = current_size.saturating_sub(base).saturating_mul(100) / base;
        growth >= config.auto_rewrite_percentage
    }
}

impl Aof {
    /// Starts a background rewrite.
    ///
    /// With a child already running the request is recorded and honored when
    /// the child exits. `force` marks a manual trigger, which bypasses the
    /// failure back-off.
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn start_background_rewrite(
        &mut self,
        force: bool,
    ) -> Result<RewriteStart, RewriteError> {
        if self.rewrite.child.is_some() {
            debug!("Rewrite already in progress; scheduling another on completion.");
            self.rewrite.scheduled = true;
            return Ok(RewriteStart::Scheduled);
        }

        if !force {
            if let Some(minutes) = self.rewrite.backoff.limited_minutes() {
                return Err(RewriteError::RateLimited { minutes });
            }
        }

        fs::create_dir_all(self.config.aof_dir())
            .await
            .context(IoSnafu)?;

        // Pin the writer to a fresh tail: everything before this point will
        // be superseded by the new base, everything after lands in the new
        // incremental and survives the swap.
        self.writer.flush(true).await.context(RotateSnafu)?;
        self.writer.open_new_incr().await.context(RotateSnafu)?;

        // Stabilize the durable-offset watermark before snapshotting.
        self.bio.drain_fsync().await;
        let fsynced_reploff_pending =
            self.repl.offset.load(Ordering::Acquire);

        let snapshot = self.source.snapshot();
        let keys = snapshot.key_count();
        let temp_path = self.config.temp_rewrite_path();
        let cancel = CancellationToken::new();
        let codec = self.config.snapshot_codec.clone();

        let handle = tokio::spawn(run_child(
            temp_path.clone(),
            snapshot,
            codec,
            cancel.clone(),
        ));

        self.rewrite.child_active.store(true, Ordering::Release);
        self.rewrite.child = Some(RewriteChild {
            handle,
            cancel,
            temp_path,
            started: Instant::now(),
            fsynced_reploff_pending,
        });

        info!(keys, "Background append log rewrite started.");
        Ok(RewriteStart::Started)
    }

    /// Collects the rewrite child if it has exited (or waits for it when
    /// `wait` is set) and runs the completion protocol.
    pub(crate) async fn reap_rewrite_child(&mut self, wait: bool) {
        let finished = match &self.rewrite.child {
            Some(child) => wait || child.handle.is_finished(),
            None => return,
        };
        if !finished {
            return;
        }

        let child = self
            .rewrite
            .child
            .take()
            .expect("child presence checked above");
        self.rewrite.child_active.store(false, Ordering::Release);

        let RewriteChild {
            handle,
            cancel: _cancel,
            temp_path,
            started,
            fsynced_reploff_pending,
        } = child;

        match handle.await {
            Ok(Ok(())) => {
                self.install_rewritten_base(&temp_path, fsynced_reploff_pending, started)
                    .await;
            }
            Ok(Err(ChildError::Aborted)) => {
                info!("Background rewrite aborted by request.");
                self.cleanup_after_rewrite(&temp_path).await;
            }
            Ok(Err(ChildError::Io(error))) => {
                error!(%error, "Background rewrite child failed.");
                self.note_rewrite_failure(&temp_path).await;
            }
            Err(join_error) if join_error.is_cancelled() => {
                info!("Background rewrite task cancelled.");
                self.cleanup_after_rewrite(&temp_path).await;
            }
            Err(join_error) => {
                error!(%join_error, "Background rewrite task panicked.");
                self.note_rewrite_failure(&temp_path).await;
            }
        }
    }

    /// The parent-side commit: rename the dump over a freshly-allocated base
    /// name, finalize the temporary incremental when coming out of
    /// `WaitRewrite`, reclassify superseded segments, persist, swap.
    async fn install_rewritten_base(
        &mut self,
        temp_path: &Path,
        fsynced_reploff_pending: u64,
        started: Instant,
    ) {
        let was_wait = self.writer.state() == WriterState::WaitRewrite;
        let mut staged = self.manifest.load().dup();

        let format = if self.config.snapshot_codec.is_some() {
            BaseFormat::Rdb
        } else {
            BaseFormat::Aof
        };
        let base_name = staged.new_base_name(&self.config.file_prefix, format);
        let base_path = self.config.segment_path(&base_name);

        if let Err(error) = fs::rename(temp_path, &base_path).await {
            error!(%error, "Failed to rename the rewrite output into place.");
            self.note_rewrite_failure(temp_path).await;
            return;
        }

        if was_wait {
            let incr_name = staged.new_incr_name(&self.config.file_prefix);
            let incr_path = self.config.segment_path(&incr_name);
            if let Err(error) = fs::rename(self.config.temp_incr_path(), &incr_path).await {
                error!(%error, "Failed to finalize the temporary incremental segment.");
                let _ = fs::remove_file(&base_path).await;
                self.note_rewrite_failure(temp_path).await;
                return;
            }
        }

        staged.mark_rewritten_incrs_as_history(true);

        if let Err(error) = staged.persist(&self.config).await {
            error!(%error, "Failed to persist the manifest after rewrite.");
            let _ = fs::remove_file(&base_path).await;
            self.note_rewrite_failure(temp_path).await;
            return;
        }
        self.manifest.swap(Arc::new(staged));

        self.delete_history().await;

        if was_wait {
            self.writer.set_state(WriterState::On);
            self.bio.publish_durable(fsynced_reploff_pending);
        }

        let base_len = fs::metadata(&base_path).await.map(|m| m.len()).unwrap_or(0);
        let current = base_len + self.writer.last_incr_size();
        self.writer.set_current_size(current);
        self.rewrite.rewrite_base_size = current;

        self.rewrite.backoff.note_success();
        self.rewrite.last_status_ok = true;

        info!(
            base = %base_name,
            duration_ms = started.elapsed().as_millis() as u64,
            "Background rewrite finished successfully."
        );
    }

    /// Unlinks all history segments in the background and drops them from
    /// the manifest. Their supersession is already durable, so a failure
    /// here only leaves advisory entries behind.
    async fn delete_history(&mut self) {
        let live = self.manifest.load();
        if live.history_len() == 0 {
            return;
        }

        for segment in live.history() {
            self.bio
                .submit_unlink(self.config.segment_path(&segment.name));
        }

        let mut staged = live.dup();
        staged.clear_history();
        match staged.persist(&self.config).await {
            Ok(()) => self.manifest.swap(Arc::new(staged)),
            Err(error) => {
                warn!(%error, "Failed to drop history entries from the manifest; they remain advisory.");
            }
        }
    }

    async fn note_rewrite_failure(&mut self, temp_path: &Path) {
        self.rewrite.last_status_ok = false;
        self.rewrite.backoff.note_failure();
        self.cleanup_after_rewrite(temp_path).await;
    }

    /// Removes child temporaries. When the writer was accumulating into the
    /// never-installed temporary incremental, that file and the pending
    /// buffer go with it, and a retry is scheduled.
    async fn cleanup_after_rewrite(&mut self, temp_path: &Path) {
        let _ = fs::remove_file(temp_path).await;

        if self.writer.state() == WriterState::WaitRewrite {
            self.writer.drop_pending();
            self.writer.discard_tail();
            let _ = fs::remove_file(self.config.temp_incr_path()).await;
            self.rewrite.scheduled = true;
        }
    }
}

async fn run_child(
    temp_path: PathBuf,
    snapshot: DatasetSnapshot,
    codec: Option<Arc<dyn SnapshotCodec>>,
    cancel: CancellationToken,
) -> Result<(), ChildError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ChildError::Aborted),
        result = dump_snapshot(&temp_path, &snapshot, codec) => result.map_err(ChildError::Io),
    }
}

async fn dump_snapshot(
    path: &Path,
    snapshot: &DatasetSnapshot,
    codec: Option<Arc<dyn SnapshotCodec>>,
) -> io::Result<()> {
    let file = fs::File::create(path).await?;
    let mut out = BufWriter::new(file);

    match codec {
        Some(codec) => {
            let bytes = codec.encode(snapshot)?;
            out.write_all(&bytes).await?;
        }
        None => {
            serialize_dataset(&mut out, snapshot).await?;
        }
    }

    out.flush().await?;
    out.get_ref().sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_engages_on_third_failure() {
        let mut backoff = RewriteBackoff::default();

        backoff.note_failure();
        backoff.note_failure();
        assert_eq!(backoff.limited_minutes(), None);
        assert_eq!(backoff.current_delay_minutes(), 0);

        backoff.note_failure();
        assert_eq!(backoff.current_delay_minutes(), 1);
        assert!(backoff.limited_minutes().is_some());

        backoff.note_failure();
        assert_eq!(backoff.current_delay_minutes(), 2);
        backoff.note_failure();
        assert_eq!(backoff.current_delay_minutes(), 4);
    }

    #[test]
    fn backoff_delay_caps_at_sixty_minutes() {
        let mut backoff = RewriteBackoff::default();
        for _ in 0..20 {
            backoff.note_failure();
        }
        assert_eq!(backoff.current_delay_minutes(), MAX_DELAY_MINUTES);
    }

    #[test]
    fn backoff_resets_on_success() {
        let mut backoff = RewriteBackoff::default();
        for _ in 0..5 {
            backoff.note_failure();
        }
        backoff.note_success();
        assert_eq!(backoff.consecutive_failures(), 0);
        assert_eq!(backoff.limited_minutes(), None);
    }
}
