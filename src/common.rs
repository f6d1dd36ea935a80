use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::dataset::SnapshotCodec;

// The ceiling for a single manifest line; anything longer is rejected as corrupt.
pub const MANIFEST_MAX_LINE_BYTES: usize = 1024;

// Bulk insertions during rewrite are split so no single command carries more
// than this many items.
pub(crate) const REWRITE_ITEMS_PER_CMD: usize = 64;

// Five-byte magic marking a binary snapshot at the head of a base segment.
pub(crate) const SNAPSHOT_MAGIC: &[u8; 5] = b"REDIS";

// Under `EverySec` we coalesce fsyncs to roughly one per second.
pub(crate) const FSYNC_INTERVAL: Duration = Duration::from_millis(1000);

// How long a flush may be postponed while a background fsync is in flight
// before we force the write through anyway.
pub(crate) const FLUSH_POSTPONE_LIMIT: Duration = Duration::from_millis(2000);

// Once the pending buffer's capacity grows past this, it is released after a
// successful flush instead of being retained for reuse.
pub(crate) const PENDING_BUF_SHRINK_BYTES: usize = 64 * 1024;

pub(crate) const TEMP_FILE_PREFIX: &str = "temp-";

/// When the append log is flushed all the way to stable storage.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Leave syncing entirely to the operating system.
    Never,
    /// Coalesce fsyncs to roughly one per second, performed off-thread.
    EverySec,
    /// Fsync synchronously after every flushed write, before acknowledging.
    Always,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::EverySec
    }
}

/// Append-log configuration.
#[derive(Clone)]
pub struct AofConfig {
    /// Data directory of the owning store. The append log lives in a
    /// dedicated subdirectory of this.
    pub(crate) data_dir: PathBuf,
    /// Name of the dedicated subdirectory.
    pub(crate) dir_name: String,
    /// Basename prefix shared by the manifest and every segment.
    pub(crate) file_prefix: String,
    /// Fsync policy applied by the writer.
    pub(crate) fsync: FsyncPolicy,
    /// Whether `#TS:<epoch>` annotations are interleaved with commands.
    pub(crate) timestamp_annotations: bool,
    /// Whether a truncated tail segment is repaired and tolerated on load.
    pub(crate) load_truncated: bool,
    /// Skip the fsync stage entirely while a rewrite child is running.
    pub(crate) no_fsync_on_rewrite: bool,
    /// Growth percentage over the last rewrite's size that triggers an
    /// automatic rewrite. Zero disables automatic rewrites.
    pub(crate) auto_rewrite_percentage: u64,
    /// Automatic rewrites do not trigger below this total log size.
    pub(crate) auto_rewrite_min_size: u64,
    /// Whether the writer starts enabled, loading and appending immediately.
    pub(crate) start_enabled: bool,
    /// Optional binary snapshot codec. When present, base segments are
    /// written and read in the binary snapshot format.
    pub(crate) snapshot_codec: Option<Arc<dyn SnapshotCodec>>,
}

impl AofConfig {
    pub fn from_path<P>(data_dir: P) -> AofConfigBuilder
    where
        P: AsRef<Path>,
    {
        AofConfigBuilder {
            data_dir: data_dir.as_ref().to_path_buf(),
            dir_name: None,
            file_prefix: None,
            fsync: None,
            timestamp_annotations: None,
            load_truncated: None,
            no_fsync_on_rewrite: None,
            auto_rewrite_percentage: None,
            auto_rewrite_min_size: None,
            start_enabled: None,
            snapshot_codec: None,
        }
    }

    /// Directory holding the manifest and every segment file.
    pub fn aof_dir(&self) -> PathBuf {
        self.data_dir.join(&self.dir_name)
    }

    pub(crate) fn manifest_path(&self) -> PathBuf {
        self.aof_dir().join(format!("{}.manifest", self.file_prefix))
    }

    pub(crate) fn temp_manifest_path(&self) -> PathBuf {
        self.aof_dir()
            .join(format!("{}{}.manifest", TEMP_FILE_PREFIX, self.file_prefix))
    }

    pub(crate) fn segment_path(&self, name: &str) -> PathBuf {
        self.aof_dir().join(name)
    }

    /// Pre-manifest single-file log location, used by the upgrade path.
    pub(crate) fn legacy_path(&self) -> PathBuf {
        self.data_dir.join(&self.file_prefix)
    }

    pub(crate) fn temp_incr_path(&self) -> PathBuf {
        self.aof_dir()
            .join(format!("{}{}.incr", TEMP_FILE_PREFIX, self.file_prefix))
    }

    pub(crate) fn temp_rewrite_path(&self) -> PathBuf {
        self.aof_dir()
            .join(format!("temp-rewriteaof-bg-{}.aof", std::process::id()))
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.aof_dir().join("aof.lock")
    }
}

impl fmt::Debug for AofConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AofConfig")
            .field("data_dir", &self.data_dir)
            .field("dir_name", &self.dir_name)
            .field("file_prefix", &self.file_prefix)
            .field("fsync", &self.fsync)
            .field("timestamp_annotations", &self.timestamp_annotations)
            .field("load_truncated", &self.load_truncated)
            .field("no_fsync_on_rewrite", &self.no_fsync_on_rewrite)
            .field("auto_rewrite_percentage", &self.auto_rewrite_percentage)
            .field("auto_rewrite_min_size", &self.auto_rewrite_min_size)
            .field("start_enabled", &self.start_enabled)
            .field(
                "snapshot_codec",
                &self.snapshot_codec.as_ref().map(|_| "Arc<dyn SnapshotCodec>"),
            )
            .finish()
    }
}

/// Builder for [`AofConfig`].
pub struct AofConfigBuilder {
    data_dir: PathBuf,
    dir_name: Option<String>,
    file_prefix: Option<String>,
    fsync: Option<FsyncPolicy>,
    timestamp_annotations: Option<bool>,
    load_truncated: Option<bool>,
    no_fsync_on_rewrite: Option<bool>,
    auto_rewrite_percentage: Option<u64>,
    auto_rewrite_min_size: Option<u64>,
    start_enabled: Option<bool>,
    snapshot_codec: Option<Arc<dyn SnapshotCodec>>,
}

impl AofConfigBuilder {
    /// Sets the name of the dedicated log subdirectory.
    ///
    /// Defaults to `appendonlydir`.
    #[allow(dead_code)]
    pub fn dir_name<S: Into<String>>(mut self, name: S) -> Self {
        self.dir_name = Some(name.into());
        self
    }

    /// Sets the basename prefix shared by the manifest and every segment.
    ///
    /// Defaults to `appendonly.aof`.
    #[allow(dead_code)]
    pub fn file_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.file_prefix = Some(prefix.into());
        self
    }

    /// Sets the fsync policy.
    ///
    /// Defaults to [`FsyncPolicy::EverySec`].
    pub fn fsync(mut self, policy: FsyncPolicy) -> Self {
        self.fsync = Some(policy);
        self
    }

    /// Enables or disables `#TS:<epoch>` annotations in incremental segments.
    ///
    /// Defaults to disabled.
    #[allow(dead_code)]
    pub fn timestamp_annotations(mut self, enabled: bool) -> Self {
        self.timestamp_annotations = Some(enabled);
        self
    }

    /// Controls whether a truncated tail segment is repaired and tolerated
    /// on load rather than aborting startup.
    ///
    /// Defaults to enabled.
    pub fn load_truncated(mut self, enabled: bool) -> Self {
        self.load_truncated = Some(enabled);
        self
    }

    /// Skips the fsync stage while a rewrite child is running, trading
    /// durability for not competing with the rewrite's disk traffic.
    ///
    /// Defaults to disabled.
    #[allow(dead_code)]
    pub fn no_fsync_on_rewrite(mut self, enabled: bool) -> Self {
        self.no_fsync_on_rewrite = Some(enabled);
        self
    }

    /// Sets the growth percentage over the last rewrite's size that triggers
    /// an automatic rewrite. Zero disables automatic rewrites.
    ///
    /// Defaults to 100.
    #[allow(dead_code)]
    pub fn auto_rewrite_percentage(mut self, percentage: u64) -> Self {
        self.auto_rewrite_percentage = Some(percentage);
        self
    }

    /// Sets the minimum total log size below which automatic rewrites never
    /// trigger.
    ///
    /// Defaults to 64MB.
    #[allow(dead_code)]
    pub fn auto_rewrite_min_size(mut self, size: u64) -> Self {
        self.auto_rewrite_min_size = Some(size);
        self
    }

    /// Controls whether the log starts enabled. When disabled, no data is
    /// loaded and nothing is appended until `enable` is called.
    ///
    /// Defaults to enabled.
    #[allow(dead_code)]
    pub fn start_enabled(mut self, enabled: bool) -> Self {
        self.start_enabled = Some(enabled);
        self
    }

    /// Installs a binary snapshot codec, switching base segments to the
    /// binary snapshot format.
    #[allow(dead_code)]
    pub fn snapshot_codec(mut self, codec: Arc<dyn SnapshotCodec>) -> Self {
        self.snapshot_codec = Some(codec);
        self
    }

    /// Consumes this builder and constructs an `AofConfig`.
    pub fn build(self) -> AofConfig {
        AofConfig {
            data_dir: self.data_dir,
            dir_name: self.dir_name.unwrap_or_else(|| "appendonlydir".to_string()),
            file_prefix: self
                .file_prefix
                .unwrap_or_else(|| "appendonly.aof".to_string()),
            fsync: self.fsync.unwrap_or_default(),
            timestamp_annotations: self.timestamp_annotations.unwrap_or(false),
            load_truncated: self.load_truncated.unwrap_or(true),
            no_fsync_on_rewrite: self.no_fsync_on_rewrite.unwrap_or(false),
            auto_rewrite_percentage: self.auto_rewrite_percentage.unwrap_or(100),
            auto_rewrite_min_size: self
                .auto_rewrite_min_size
                .unwrap_or(64 * 1024 * 1024),
            start_enabled: self.start_enabled.unwrap_or(true),
            snapshot_codec: self.snapshot_codec,
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock seconds since the Unix epoch.
pub(crate) fn unix_seconds() -> i64 {
    (unix_ms() / 1000) as i64
}
