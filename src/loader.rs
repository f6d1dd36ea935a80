use std::{
    collections::HashSet,
    io::{self, Cursor},
    path::Path,
};

use snafu::{ResultExt, Snafu};
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt},
};

use crate::{
    common::{AofConfig, SNAPSHOT_MAGIC, TEMP_FILE_PREFIX},
    dataset::{ReplayError, ReplaySink},
    manifest::{Manifest, ManifestError, SegmentKind},
    record::{CommandReader, FramingError, ReadOutcome},
};

/// Error that makes startup replay impossible.
#[derive(Debug, Snafu)]
pub enum LoaderError {
    /// A general I/O error occurred.
    #[snafu(display("loader I/O error: {}", source))]
    Io { source: io::Error },

    /// A segment referenced by the manifest could not be opened.
    #[snafu(display("failed to open segment '{}': {}", name, source))]
    OpenSegment { name: String, source: io::Error },

    /// The manifest itself failed to load or parse.
    #[snafu(display("invalid manifest: {}", source))]
    InvalidManifest { source: ManifestError },

    /// A segment contains bytes that are not valid command framing, in a
    /// position where truncation repair does not apply.
    #[snafu(display(
        "segment '{}' is corrupt: {}; run the log repair tool before restarting",
        name,
        reason
    ))]
    BadSegment { name: String, reason: String },

    /// A non-tail segment ended mid-command, or repair is disabled.
    #[snafu(display(
        "segment '{}' is truncated; run the log repair tool or enable truncated-load tolerance",
        name
    ))]
    TruncatedSegment { name: String },

    /// The store rejected a replayed command.
    #[snafu(display("error replaying segment '{}': {}", name, source))]
    Replay { name: String, source: ReplayError },

    /// A binary base segment was found but no codec is configured.
    #[snafu(display(
        "segment '{}' holds a binary snapshot but no snapshot codec is configured",
        name
    ))]
    MissingCodec { name: String },

    /// The snapshot codec failed to decode a binary base segment.
    #[snafu(display("failed to decode binary snapshot in '{}': {}", name, source))]
    Snapshot { name: String, source: io::Error },
}

/// Aggregate result of replaying the whole manifest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadOutcome {
    /// Every segment replayed fully.
    Ok,
    /// The tail segment ended mid-command and was truncated back to the last
    /// complete command.
    Truncated,
    /// The manifest exists but references no data.
    Empty,
    /// There is nothing on disk to load.
    NotExist,
}

/// What the loader found and replayed.
#[derive(Debug)]
pub struct LoadReport {
    pub outcome: LoadOutcome,
    /// Commands replayed into the sink.
    pub commands: u64,
    /// Combined size of all active segments after any repair.
    pub total_size: u64,
    /// Size of the base segment, if one exists.
    pub base_size: u64,
    pub(crate) manifest: Manifest,
}

struct SegmentResult {
    commands: u64,
    valid_len: u64,
    truncated: bool,
    damage: Option<String>,
}

/// Replays the on-disk log into `sink`, upgrading a legacy single-file log
/// into the manifest layout first if one is found.
pub(crate) async fn load_dataset(
    config: &AofConfig,
    sink: &mut dyn ReplaySink,
) -> Result<LoadReport, LoaderError> {
    upgrade_legacy_if_needed(config).await?;

    let manifest = match Manifest::load(&config.manifest_path())
        .await
        .context(InvalidManifestSnafu)?
    {
        Some(manifest) => manifest,
        None => {
            debug!("No manifest found; starting from an empty log.");
            return Ok(LoadReport {
                outcome: LoadOutcome::NotExist,
                commands: 0,
                total_size: 0,
                base_size: 0,
                manifest: Manifest::default(),
            });
        }
    };

    let segments: Vec<_> = manifest.active_segments().cloned().collect();
    let mut outcome = LoadOutcome::Ok;
    let mut commands = 0;
    let mut total_size = 0;
    let mut base_size = 0;

    for (idx, segment) in segments.iter().enumerate() {
        let is_last = idx + 1 == segments.len();
        let path = config.segment_path(&segment.name);
        let result = load_segment(config, &segment.name, &path, sink).await?;

        if result.truncated {
            if !(is_last && config.load_truncated) {
                return Err(match result.damage {
                    Some(reason) => LoaderError::BadSegment {
                        name: segment.name.clone(),
                        reason,
                    },
                    None => LoaderError::TruncatedSegment {
                        name: segment.name.clone(),
                    },
                });
            }

            warn!(
                segment = %segment.name,
                valid_len = result.valid_len,
                "Tail segment damaged past the last complete command; truncating and continuing."
            );
            repair_segment(&path, result.valid_len).await?;
            outcome = LoadOutcome::Truncated;
        }

        commands += result.commands;
        total_size += result.valid_len;
        if segment.kind == SegmentKind::Base {
            base_size = result.valid_len;
        }
    }

    if outcome == LoadOutcome::Ok && total_size == 0 {
        outcome = LoadOutcome::Empty;
    }

    cleanup_stale_files(config, &manifest).await;

    info!(
        ?outcome,
        commands, total_size, "Finished loading the append log."
    );

    Ok(LoadReport {
        outcome,
        commands,
        total_size,
        base_size,
        manifest,
    })
}

async fn load_segment(
    config: &AofConfig,
    name: &str,
    path: &Path,
    sink: &mut dyn ReplaySink,
) -> Result<SegmentResult, LoaderError> {
    let mut file = fs::File::open(path).await.map_err(|e| LoaderError::OpenSegment {
        name: name.to_string(),
        source: e,
    })?;
    let file_len = file.metadata().await.context(IoSnafu)?.len();
    if file_len == 0 {
        return Ok(SegmentResult {
            commands: 0,
            valid_len: 0,
            truncated: false,
            damage: None,
        });
    }

    let mut magic = [0u8; 5];
    let is_snapshot = if file_len >= SNAPSHOT_MAGIC.len() as u64 {
        file.read_exact(&mut magic).await.context(IoSnafu)?;
        &magic == SNAPSHOT_MAGIC
    } else {
        false
    };

    if is_snapshot {
        let codec = config
            .snapshot_codec
            .as_ref()
            .ok_or_else(|| LoaderError::MissingCodec {
                name: name.to_string(),
            })?;

        let mut data = Vec::with_capacity(file_len as usize);
        data.extend_from_slice(&magic);
        file.read_to_end(&mut data).await.context(IoSnafu)?;

        let consumed = codec
            .decode(&data, sink)
            .map_err(|e| LoaderError::Snapshot {
                name: name.to_string(),
                source: e,
            })?;

        debug!(segment = %name, consumed, "Decoded binary snapshot prefix.");

        // Legacy combined layout: textual commands may follow the snapshot.
        let remainder = data[consumed..].to_vec();
        let mut reader = CommandReader::new(Cursor::new(remainder));
        replay_textual(&mut reader, sink, consumed as u64, name).await
    } else {
        file.seek(io::SeekFrom::Start(0)).await.context(IoSnafu)?;
        let mut reader = CommandReader::new(file);
        replay_textual(&mut reader, sink, 0, name).await
    }
}

/// Replays textual command framing, tracking the offset of the last complete
/// command so a damaged tail can be cut back to it. `MULTI` records the
/// pre-transaction boundary; a stream ending inside the transaction rewinds
/// to it.
async fn replay_textual<R>(
    reader: &mut CommandReader<R>,
    sink: &mut dyn ReplaySink,
    base_offset: u64,
    name: &str,
) -> Result<SegmentResult, LoaderError>
where
    R: AsyncRead + Unpin,
{
    let mut commands = 0u64;
    let mut valid = base_offset;
    let mut valid_before_multi = base_offset;
    let mut in_multi = false;

    loop {
        match reader.next().await {
            Ok(ReadOutcome::Eof) => {
                if in_multi {
                    return Ok(SegmentResult {
                        commands,
                        valid_len: valid_before_multi,
                        truncated: true,
                        damage: None,
                    });
                }
                return Ok(SegmentResult {
                    commands,
                    valid_len: valid,
                    truncated: false,
                    damage: None,
                });
            }
            Ok(ReadOutcome::Annotation) => {
                valid = base_offset + reader.pos();
            }
            Ok(ReadOutcome::Command(argv)) => {
                let cmd = argv
                    .first()
                    .map(|arg| arg.to_ascii_uppercase())
                    .unwrap_or_default();
                if cmd == b"MULTI" {
                    valid_before_multi = valid;
                    in_multi = true;
                }

                sink.apply_command(&argv).map_err(|e| LoaderError::Replay {
                    name: name.to_string(),
                    source: e,
                })?;

                if cmd == b"EXEC" {
                    in_multi = false;
                }

                commands += 1;
                valid = base_offset + reader.pos();
            }
            Err(FramingError::Truncated) => {
                return Ok(SegmentResult {
                    commands,
                    valid_len: if in_multi { valid_before_multi } else { valid },
                    truncated: true,
                    damage: None,
                });
            }
            Err(FramingError::Malformed { reason }) => {
                return Ok(SegmentResult {
                    commands,
                    valid_len: if in_multi { valid_before_multi } else { valid },
                    truncated: true,
                    damage: Some(reason),
                });
            }
            Err(FramingError::Io { source }) => return Err(LoaderError::Io { source }),
        }
    }
}

async fn repair_segment(path: &Path, valid_len: u64) -> Result<(), LoaderError> {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .context(IoSnafu)?;
    let current = file.metadata().await.context(IoSnafu)?.len();
    if valid_len < current {
        file.set_len(valid_len).await.context(IoSnafu)?;
        file.sync_all().await.context(IoSnafu)?;
    }
    Ok(())
}

/// Migrates a pre-manifest single-file log into the manifest layout: create
/// the directory, persist a manifest whose single base references the legacy
/// name at sequence 1, then move the file in. Every step is idempotent, so a
/// crash mid-migration resumes on the next startup.
async fn upgrade_legacy_if_needed(config: &AofConfig) -> Result<(), LoaderError> {
    let legacy = config.legacy_path();
    if fs::metadata(&legacy).await.is_err() {
        return Ok(());
    }

    match Manifest::load(&config.manifest_path())
        .await
        .context(InvalidManifestSnafu)?
    {
        Some(manifest) => {
            let references_legacy = manifest
                .base()
                .map(|b| b.name == config.file_prefix)
                .unwrap_or(false);
            if references_legacy {
                let target = config.segment_path(&config.file_prefix);
                if fs::metadata(&target).await.is_err() {
                    fs::rename(&legacy, &target).await.context(IoSnafu)?;
                    info!("Resumed interrupted migration of the legacy append log.");
                }
            }
            Ok(())
        }
        None => {
            info!(
                file = %config.file_prefix,
                "Migrating legacy single-file append log into the manifest layout."
            );
            fs::create_dir_all(config.aof_dir()).await.context(IoSnafu)?;
            let mut manifest = Manifest::for_legacy_upgrade(&config.file_prefix);
            manifest.persist(config).await.context(InvalidManifestSnafu)?;
            fs::rename(&legacy, config.segment_path(&config.file_prefix))
                .await
                .context(IoSnafu)?;
            Ok(())
        }
    }
}

/// Removes leftovers from crashed rewrites: anything in the log directory
/// that looks like one of our files but is referenced by nothing. Failures
/// here are logged and ignored.
async fn cleanup_stale_files(config: &AofConfig, manifest: &Manifest) {
    let mut referenced: HashSet<String> = manifest
        .active_segments()
        .map(|s| s.name.clone())
        .collect();
    referenced.extend(manifest.history().map(|s| s.name.clone()));

    let manifest_name = format!("{}.manifest", config.file_prefix);
    let segment_prefix = format!("{}.", config.file_prefix);

    let mut entries = match fs::read_dir(config.aof_dir()).await {
        Ok(entries) => entries,
        Err(_) => return,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(file_name) = entry.file_name().into_string() else {
            continue;
        };
        if file_name == manifest_name || file_name == "aof.lock" {
            continue;
        }
        if referenced.contains(&file_name) {
            continue;
        }

        let ours = file_name.starts_with(TEMP_FILE_PREFIX)
            || file_name.starts_with(&segment_prefix);
        if !ours {
            continue;
        }

        match fs::remove_file(entry.path()).await {
            Ok(()) => debug!(file = %file_name, "Removed stale log file."),
            Err(error) => warn!(file = %file_name, %error, "Failed to remove stale log file."),
        }
    }
}
