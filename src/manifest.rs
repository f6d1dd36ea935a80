use std::{collections::VecDeque, fmt, io, path::Path, sync::Arc};

use parking_lot::RwLock;
use snafu::{ResultExt, Snafu};
use tokio::{fs, io::AsyncWriteExt};

use crate::common::{AofConfig, MANIFEST_MAX_LINE_BYTES};

const KEY_FILE_NAME: &str = "file";
const KEY_FILE_SEQ: &str = "seq";
const KEY_FILE_TYPE: &str = "type";

/// Error that occurred while loading or persisting the manifest.
#[derive(Debug, Snafu)]
pub enum ManifestError {
    /// A general I/O error occurred.
    #[snafu(display("manifest I/O error: {}", source))]
    Io { source: io::Error },

    /// The manifest file is not valid UTF-8.
    #[snafu(display("manifest is not valid UTF-8"))]
    NotUtf8,

    /// A line exceeded the fixed size ceiling.
    ///
    /// Manifest lines are tiny by construction, so an oversized line means
    /// the file was corrupted or hand-edited, and startup must not proceed
    /// on a guess.
    #[snafu(display(
        "manifest line {} exceeds {} bytes",
        line,
        MANIFEST_MAX_LINE_BYTES
    ))]
    OversizedLine { line: usize },

    /// A line failed to parse.
    #[snafu(display("manifest line {}: {}", line, reason))]
    Malformed { line: usize, reason: String },

    /// More than one base segment was declared.
    #[snafu(display("manifest line {}: duplicate base segment", line))]
    DuplicateBase { line: usize },

    /// Incremental sequence numbers must be strictly ascending.
    #[snafu(display(
        "manifest line {}: non-monotonic sequence {} (previous {})",
        line,
        seq,
        prev
    ))]
    NonMonotonicSequence { line: usize, seq: u64, prev: u64 },
}

/// The role a segment plays in the log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentKind {
    /// Snapshot-equivalent checkpoint of the dataset.
    Base,
    /// A superseded segment awaiting deletion.
    History,
    /// A textual command log appended after the base.
    Incr,
}

impl SegmentKind {
    fn as_token(self) -> &'static str {
        match self {
            SegmentKind::Base => "b",
            SegmentKind::History => "h",
            SegmentKind::Incr => "i",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "b" => Some(SegmentKind::Base),
            "h" => Some(SegmentKind::History),
            "i" => Some(SegmentKind::Incr),
            _ => None,
        }
    }
}

/// Encoding used for a base segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BaseFormat {
    /// Textual command framing.
    Aof,
    /// Binary snapshot, decoded through the configured codec.
    Rdb,
}

impl BaseFormat {
    fn suffix(self) -> &'static str {
        match self {
            BaseFormat::Aof => "aof",
            BaseFormat::Rdb => "rdb",
        }
    }
}

/// Immutable descriptor of one on-disk segment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    /// Basename of the segment file; never contains path separators.
    pub name: String,
    /// Monotonic sequence number, independent per kind.
    pub seq: u64,
    pub kind: SegmentKind,
}

/// Ordered view of the segments composing the log: at most one base, the
/// history of superseded segments, and the incremental chain.
///
/// Mutations are staged on a deep copy ([`Manifest::dup`]) which is only
/// committed by pointer swap after a successful [`Manifest::persist`], so
/// readers always observe a fully-constructed manifest.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    base: Option<Segment>,
    history: VecDeque<Segment>,
    incrs: Vec<Segment>,
    curr_base_seq: u64,
    curr_incr_seq: u64,
    dirty: bool,
}

impl Manifest {
    /// Parses the textual manifest format.
    ///
    /// Strict by design: any malformed line is an error, because guessing at
    /// which segments compose the dataset risks silently loading a subset.
    pub fn decode(text: &str) -> Result<Manifest, ManifestError> {
        let mut manifest = Manifest::default();

        for (idx, line) in text.lines().enumerate() {
            let lineno = idx + 1;
            if line.len() > MANIFEST_MAX_LINE_BYTES {
                return Err(ManifestError::OversizedLine { line: lineno });
            }

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let tokens = split_tokens(trimmed).map_err(|reason| ManifestError::Malformed {
                line: lineno,
                reason,
            })?;
            if tokens.len() < 6 {
                return Err(ManifestError::Malformed {
                    line: lineno,
                    reason: format!("expected at least 6 tokens, found {}", tokens.len()),
                });
            }

            let mut name: Option<String> = None;
            let mut seq: Option<u64> = None;
            let mut kind: Option<SegmentKind> = None;

            for pair in tokens.chunks(2) {
                let [key, value] = pair else {
                    return Err(ManifestError::Malformed {
                        line: lineno,
                        reason: "dangling key without a value".to_string(),
                    });
                };

                match key.as_str() {
                    KEY_FILE_NAME => {
                        if value.is_empty() {
                            return Err(ManifestError::Malformed {
                                line: lineno,
                                reason: "empty file name".to_string(),
                            });
                        }
                        if value.contains('/') || value.contains('\\') {
                            return Err(ManifestError::Malformed {
                                line: lineno,
                                reason: format!("file name '{value}' contains a path separator"),
                            });
                        }
                        name = Some(value.clone());
                    }
                    KEY_FILE_SEQ => {
                        let parsed = value.parse::<u64>().map_err(|_| {
                            ManifestError::Malformed {
                                line: lineno,
                                reason: format!("invalid sequence number '{value}'"),
                            }
                        })?;
                        if parsed == 0 {
                            return Err(ManifestError::Malformed {
                                line: lineno,
                                reason: "sequence number must be >= 1".to_string(),
                            });
                        }
                        seq = Some(parsed);
                    }
                    KEY_FILE_TYPE => {
                        kind = Some(SegmentKind::from_token(value).ok_or_else(|| {
                            ManifestError::Malformed {
                                line: lineno,
                                reason: format!("unknown segment type '{value}'"),
                            }
                        })?);
                    }
                    // Unknown keys are skipped for forward compatibility.
                    _ => {}
                }
            }

            let (Some(name), Some(seq), Some(kind)) = (name, seq, kind) else {
                return Err(ManifestError::Malformed {
                    line: lineno,
                    reason: "missing one of the file/seq/type keys".to_string(),
                });
            };

            let segment = Segment { name, seq, kind };
            match kind {
                SegmentKind::Base => {
                    if manifest.base.is_some() {
                        return Err(ManifestError::DuplicateBase { line: lineno });
                    }
                    manifest.curr_base_seq = seq;
                    manifest.base = Some(segment);
                }
                SegmentKind::History => manifest.history.push_back(segment),
                SegmentKind::Incr => {
                    if let Some(last) = manifest.incrs.last() {
                        if seq <= last.seq {
                            return Err(ManifestError::NonMonotonicSequence {
                                line: lineno,
                                seq,
                                prev: last.seq,
                            });
                        }
                    }
                    manifest.curr_incr_seq = seq;
                    manifest.incrs.push(segment);
                }
            }
        }

        Ok(manifest)
    }

    /// Serializes to the on-disk format: base first, then history, then
    /// incrementals.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut write_segment = |segment: &Segment| {
            out.push_str(KEY_FILE_NAME);
            out.push(' ');
            if needs_quoting(&segment.name) {
                out.push_str(&quote(&segment.name));
            } else {
                out.push_str(&segment.name);
            }
            out.push_str(&format!(
                " {} {} {} {}\n",
                KEY_FILE_SEQ,
                segment.seq,
                KEY_FILE_TYPE,
                segment.kind.as_token()
            ));
        };

        if let Some(base) = &self.base {
            write_segment(base);
        }
        for segment in &self.history {
            write_segment(segment);
        }
        for segment in &self.incrs {
            write_segment(segment);
        }

        out
    }

    /// Loads the manifest file at `path`, or `None` if it does not exist.
    pub async fn load(path: &Path) -> Result<Option<Manifest>, ManifestError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ManifestError::Io { source: e }),
        };

        let text = String::from_utf8(bytes).map_err(|_| ManifestError::NotUtf8)?;
        Self::decode(&text).map(Some)
    }

    /// Durably persists this manifest: the content is written to a temporary
    /// file in the same directory, fsynced, renamed over the target, and the
    /// directory itself is fsynced. Failure at any step leaves the previous
    /// on-disk manifest in place.
    pub async fn persist(&mut self, config: &AofConfig) -> Result<(), ManifestError> {
        let temp_path = config.temp_manifest_path();
        let final_path = config.manifest_path();

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .context(IoSnafu)?;
        file.write_all(self.encode().as_bytes())
            .await
            .context(IoSnafu)?;
        file.sync_all().await.context(IoSnafu)?;
        drop(file);

        fs::rename(&temp_path, &final_path).await.context(IoSnafu)?;

        // Make the rename itself durable before anyone depends on the files
        // this manifest references.
        let dir = fs::File::open(config.aof_dir()).await.context(IoSnafu)?;
        dir.sync_all().await.context(IoSnafu)?;

        self.dirty = false;
        trace!(path = ?final_path, "Persisted manifest.");

        Ok(())
    }

    /// Deep copy for staging mutations off the live manifest.
    pub fn dup(&self) -> Manifest {
        self.clone()
    }

    pub fn base(&self) -> Option<&Segment> {
        self.base.as_ref()
    }

    pub fn incrs(&self) -> &[Segment] {
        &self.incrs
    }

    pub fn history(&self) -> impl Iterator<Item = &Segment> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn curr_base_seq(&self) -> u64 {
        self.curr_base_seq
    }

    pub fn curr_incr_seq(&self) -> u64 {
        self.curr_incr_seq
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Every segment the loader will open, in replay order.
    pub(crate) fn active_segments(&self) -> impl Iterator<Item = &Segment> {
        self.base.iter().chain(self.incrs.iter())
    }

    /// Allocates the next base segment name, demoting any existing base to
    /// the front of the history list.
    pub fn new_base_name(&mut self, prefix: &str, format: BaseFormat) -> String {
        self.curr_base_seq += 1;
        if let Some(mut old) = self.base.take() {
            old.kind = SegmentKind::History;
            self.history.push_front(old);
        }
        let name = format!("{prefix}.{}.base.{}", self.curr_base_seq, format.suffix());
        self.base = Some(Segment {
            name: name.clone(),
            seq: self.curr_base_seq,
            kind: SegmentKind::Base,
        });
        self.dirty = true;
        name
    }

    /// Allocates and appends the next incremental segment.
    pub fn new_incr_name(&mut self, prefix: &str) -> String {
        self.curr_incr_seq += 1;
        let name = format!("{prefix}.{}.incr.aof", self.curr_incr_seq);
        self.incrs.push(Segment {
            name: name.clone(),
            seq: self.curr_incr_seq,
            kind: SegmentKind::Incr,
        });
        self.dirty = true;
        name
    }

    /// Returns the tail incremental's name, creating one if the list is
    /// empty.
    pub fn last_incr_name(&mut self, prefix: &str) -> String {
        match self.incrs.last() {
            Some(tail) => tail.name.clone(),
            None => self.new_incr_name(prefix),
        }
    }

    /// Moves every incremental except the active tail to the front of the
    /// history list. With no active writer, all incrementals move.
    pub fn mark_rewritten_incrs_as_history(&mut self, writer_active: bool) {
        if self.incrs.is_empty() {
            return;
        }

        let keep = usize::from(writer_active);
        while self.incrs.len() > keep {
            let mut segment = self.incrs.remove(0);
            segment.kind = SegmentKind::History;
            self.history.push_front(segment);
            self.dirty = true;
        }
    }

    /// Forgets all history segments. Called after their deletion has been
    /// scheduled; their presence is advisory only.
    pub fn clear_history(&mut self) {
        if !self.history.is_empty() {
            self.history.clear();
            self.dirty = true;
        }
    }

    /// Builds the single-base manifest used when migrating a legacy
    /// single-file log into the manifest layout.
    pub(crate) fn for_legacy_upgrade(prefix: &str) -> Manifest {
        let mut manifest = Manifest::default();
        manifest.curr_base_seq = 1;
        manifest.base = Some(Segment {
            name: prefix.to_string(),
            seq: 1,
            kind: SegmentKind::Base,
        });
        manifest.dirty = true;
        manifest
    }
}

/// Shared handle to the live manifest. Mutators stage a [`Manifest::dup`],
/// persist it, then commit with [`SharedManifest::swap`]; readers always see
/// either the old or the new manifest, never a partial one.
pub(crate) struct SharedManifest {
    inner: RwLock<Arc<Manifest>>,
}

impl SharedManifest {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            inner: RwLock::new(Arc::new(manifest)),
        }
    }

    pub fn load(&self) -> Arc<Manifest> {
        Arc::clone(&self.inner.read())
    }

    pub fn swap(&self, next: Arc<Manifest>) {
        *self.inner.write() = next;
    }
}

impl fmt::Debug for SharedManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedManifest")
            .field("manifest", &*self.inner.read())
            .finish()
    }
}

fn needs_quoting(name: &str) -> bool {
    name.bytes()
        .any(|b| b <= 0x20 || b == b'"' || b == b'\'' || b == b'\\' || b >= 0x7f)
}

fn quote(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for &b in name.as_bytes() {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('"');
    out
}

/// Splits a manifest line into tokens, honoring double-quoted strings with
/// backslash escapes.
fn split_tokens(line: &str) -> Result<Vec<String>, String> {
    let bytes = line.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        if bytes[i] == b'"' {
            i += 1;
            let mut token = Vec::new();
            let mut closed = false;
            while i < bytes.len() {
                match bytes[i] {
                    b'"' => {
                        i += 1;
                        closed = true;
                        break;
                    }
                    b'\\' => {
                        i += 1;
                        let escape = *bytes.get(i).ok_or("truncated escape sequence")?;
                        match escape {
                            b'\\' => token.push(b'\\'),
                            b'"' => token.push(b'"'),
                            b'n' => token.push(b'\n'),
                            b'r' => token.push(b'\r'),
                            b't' => token.push(b'\t'),
                            b'x' => {
                                let hex = bytes
                                    .get(i + 1..i + 3)
                                    .ok_or("truncated hex escape")?;
                                let hex = std::str::from_utf8(hex)
                                    .map_err(|_| "invalid hex escape".to_string())?;
                                let value = u8::from_str_radix(hex, 16)
                                    .map_err(|_| "invalid hex escape".to_string())?;
                                token.push(value);
                                i += 2;
                            }
                            other => return Err(format!("unknown escape '\\{}'", other as char)),
                        }
                        i += 1;
                    }
                    b => {
                        token.push(b);
                        i += 1;
                    }
                }
            }
            if !closed {
                return Err("unterminated quoted string".to_string());
            }
            if i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                return Err("closing quote not followed by whitespace".to_string());
            }
            let token =
                String::from_utf8(token).map_err(|_| "quoted token is not UTF-8".to_string())?;
            tokens.push(token);
        } else {
            let start = i;
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                if bytes[i] == b'"' {
                    return Err("quote inside unquoted token".to_string());
                }
                i += 1;
            }
            tokens.push(line[start..i].to_string());
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incr(seq: u64) -> String {
        format!("file x.{seq}.incr.aof seq {seq} type i\n")
    }

    #[test]
    fn decode_basic_layout() {
        let text = "# comment\nfile x.1.base.aof seq 1 type b\nfile x.3.incr.aof seq 3 type i\n";
        let manifest = Manifest::decode(text).expect("manifest should parse");
        assert_eq!(manifest.base().map(|s| s.name.as_str()), Some("x.1.base.aof"));
        assert_eq!(manifest.curr_base_seq(), 1);
        assert_eq!(manifest.curr_incr_seq(), 3);
        assert_eq!(manifest.incrs().len(), 1);
    }

    #[test]
    fn decode_rejects_non_monotonic_incrs() {
        let text = format!(
            "file x.1.base.aof seq 1 type b\n{}{}",
            incr(2),
            incr(1)
        );
        let err = Manifest::decode(&text).expect_err("decode should fail");
        assert!(err.to_string().contains("non-monotonic sequence"));
    }

    #[test]
    fn decode_rejects_duplicate_base() {
        let text = "file x.1.base.aof seq 1 type b\nfile x.2.base.aof seq 2 type b\n";
        let err = Manifest::decode(text).expect_err("decode should fail");
        assert!(matches!(err, ManifestError::DuplicateBase { line: 2 }));
    }

    #[test]
    fn decode_rejects_path_separators() {
        let text = "file ../evil.aof seq 1 type b\n";
        assert!(Manifest::decode(text).is_err());
    }

    #[test]
    fn decode_rejects_seq_zero() {
        let text = "file x.0.base.aof seq 0 type b\n";
        assert!(Manifest::decode(text).is_err());
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let text = "file x.1.base.aof seq 1 type z\n";
        assert!(Manifest::decode(text).is_err());
    }

    #[test]
    fn decode_rejects_short_lines() {
        let text = "file x.1.base.aof seq 1\n";
        assert!(Manifest::decode(text).is_err());
    }

    #[test]
    fn decode_rejects_oversized_lines() {
        let text = format!("file {} seq 1 type b\n", "a".repeat(2048));
        let err = Manifest::decode(&text).expect_err("decode should fail");
        assert!(matches!(err, ManifestError::OversizedLine { line: 1 }));
    }

    #[test]
    fn decode_skips_unknown_keys() {
        let text = "file x.1.base.aof seq 1 type b newkey newvalue\n";
        let manifest = Manifest::decode(text).expect("manifest should parse");
        assert!(manifest.base().is_some());
    }

    #[test]
    fn quoted_names_round_trip() {
        let mut manifest = Manifest::default();
        manifest.curr_base_seq = 1;
        manifest.base = Some(Segment {
            name: "my log.1.base.aof".to_string(),
            seq: 1,
            kind: SegmentKind::Base,
        });

        let encoded = manifest.encode();
        assert!(encoded.contains('"'));

        let decoded = Manifest::decode(&encoded).expect("quoted name should parse");
        assert_eq!(
            decoded.base().map(|s| s.name.as_str()),
            Some("my log.1.base.aof")
        );
    }

    #[test]
    fn encode_orders_base_history_incr() {
        let mut manifest = Manifest::default();
        manifest.new_base_name("x", BaseFormat::Aof);
        manifest.new_incr_name("x");
        manifest.new_incr_name("x");
        manifest.new_base_name("x", BaseFormat::Aof);
        manifest.mark_rewritten_incrs_as_history(true);

        let encoded = manifest.encode();
        let lines: Vec<&str> = encoded.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("type b"));
        assert!(lines[1].ends_with("type h"));
        assert!(lines[2].ends_with("type h"));
        assert!(lines[3].ends_with("type i"));
    }

    #[test]
    fn new_base_demotes_previous_base() {
        let mut manifest = Manifest::default();
        let first = manifest.new_base_name("x", BaseFormat::Aof);
        let second = manifest.new_base_name("x", BaseFormat::Rdb);

        assert_eq!(first, "x.1.base.aof");
        assert_eq!(second, "x.2.base.rdb");
        assert_eq!(manifest.history_len(), 1);
        assert_eq!(
            manifest.history().next().map(|s| s.kind),
            Some(SegmentKind::History)
        );
    }

    #[test]
    fn mark_rewritten_keeps_active_tail() {
        let mut manifest = Manifest::default();
        manifest.new_incr_name("x");
        manifest.new_incr_name("x");
        manifest.new_incr_name("x");

        manifest.mark_rewritten_incrs_as_history(true);
        assert_eq!(manifest.incrs().len(), 1);
        assert_eq!(manifest.incrs()[0].seq, 3);
        assert_eq!(manifest.history_len(), 2);
    }

    #[test]
    fn last_incr_creates_when_empty() {
        let mut manifest = Manifest::default();
        assert_eq!(manifest.last_incr_name("x"), "x.1.incr.aof");
        assert_eq!(manifest.last_incr_name("x"), "x.1.incr.aof");
        assert_eq!(manifest.curr_incr_seq(), 1);
    }
}
