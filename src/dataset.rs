use std::{fmt, io, sync::Arc};

use bytes::Bytes;
use snafu::Snafu;

/// Error surfaced by the replay sink while applying a command.
///
/// Any of these is fatal during startup replay: a log that contains commands
/// the store cannot execute cannot be trusted to reconstruct the dataset.
#[derive(Debug, Snafu)]
pub enum ReplayError {
    #[snafu(display("unknown command '{}'", name))]
    UnknownCommand { name: String },

    #[snafu(display("wrong number of arguments for '{}'", name))]
    WrongArity { name: String },

    #[snafu(display("{}", reason))]
    Invalid { reason: String },
}

/// The command-execution hook the loader replays into.
///
/// Implementations stand in for a synthetic client on the store's command
/// path: they must never block and must discard replies. The sink owns the
/// notion of the currently selected database; `SELECT` arrives as an
/// ordinary command.
pub trait ReplaySink {
    fn apply_command(&mut self, argv: &[Bytes]) -> Result<(), ReplayError>;
}

/// Produces an immutable snapshot of the dataset for rewriting.
///
/// The snapshot must be fixed at call time: foreground mutations after
/// `snapshot` returns must not be visible through it. The rewrite child
/// serializes from the snapshot on a background task while the owning
/// thread keeps accepting writes.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> DatasetSnapshot;
}

/// Optional encoder/decoder for binary base segments.
///
/// When configured, new base segments are written with `encode` and any
/// segment starting with the snapshot magic is decoded with `decode`.
pub trait SnapshotCodec: Send + Sync {
    /// Encodes the full snapshot, including the leading magic.
    fn encode(&self, snapshot: &DatasetSnapshot) -> io::Result<Vec<u8>>;

    /// Decodes a snapshot prefix of `data` into `sink`, returning the number
    /// of bytes consumed. Anything after the returned offset is replayed as
    /// textual commands (the legacy combined-file layout).
    fn decode(&self, data: &[u8], sink: &mut dyn ReplaySink) -> io::Result<usize>;
}

/// Owned, immutable copy of the dataset at one instant.
#[derive(Clone, Debug, Default)]
pub struct DatasetSnapshot {
    /// Databases in ascending index order.
    pub databases: Vec<DatabaseSnapshot>,
}

impl DatasetSnapshot {
    pub fn key_count(&self) -> u64 {
        self.databases.iter().map(|db| db.entries.len() as u64).sum()
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseSnapshot {
    pub index: u32,
    pub entries: Vec<Entry>,
}

/// One key with its value and optional expiration.
#[derive(Clone, Debug)]
pub struct Entry {
    pub key: Bytes,
    pub value: Value,
    /// Absolute expiration in Unix milliseconds.
    pub expire_at_ms: Option<i64>,
}

/// Type-level view of a value, as consumed by the rewrite serializer.
#[derive(Clone, Debug)]
pub enum Value {
    String(Bytes),
    List(Vec<Bytes>),
    Set(Vec<Bytes>),
    SortedSet(Vec<ScoredMember>),
    Hash(Vec<HashField>),
    Stream(StreamValue),
    /// Extension type; reconstruction is delegated to the registrar's
    /// callback, which returns the argument vectors to emit for the key.
    Extension(ExtensionValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScoredMember {
    pub score: f64,
    pub member: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HashField {
    pub field: Bytes,
    pub value: Bytes,
    /// Field-level absolute expiration in Unix milliseconds.
    pub expire_at_ms: Option<i64>,
}

/// Command synthesis callback for an extension type's registrar.
pub type ExtensionDump = Arc<dyn Fn(&Bytes) -> Vec<Vec<Bytes>> + Send + Sync>;

#[derive(Clone)]
pub struct ExtensionValue {
    pub type_name: String,
    pub dump: ExtensionDump,
}

impl fmt::Debug for ExtensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Stream entry identifier, `<ms>-<seq>`.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn parse(text: &str) -> Option<StreamId> {
        let (ms, seq) = text.split_once('-')?;
        Some(StreamId {
            ms: ms.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamValue {
    pub entries: Vec<StreamEntry>,
    pub last_id: StreamId,
    pub max_deleted_id: StreamId,
    pub entries_added: u64,
    pub groups: Vec<StreamGroup>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(Bytes, Bytes)>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamGroup {
    pub name: Bytes,
    pub last_delivered: StreamId,
    pub entries_read: i64,
    pub consumers: Vec<StreamConsumer>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamConsumer {
    pub name: Bytes,
    pub pending: Vec<PendingEntry>,
}

/// One pending-entries-list item, enough to reconstruct delivery state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingEntry {
    pub id: StreamId,
    pub delivery_time_ms: i64,
    pub delivery_count: u64,
}
