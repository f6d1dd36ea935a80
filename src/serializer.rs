use std::{io, time::Instant};

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    common::{unix_seconds, REWRITE_ITEMS_PER_CMD},
    dataset::{DatasetSnapshot, Entry, StreamId, StreamValue, Value},
    record::{encode_command, encode_select, encode_ts_annotation},
};

// Progress is reported at most once per second, every this many keys.
const PROGRESS_KEY_INTERVAL: u64 = 1024;

/// Writes the minimal command sequence that reconstructs `snapshot`.
///
/// The output starts with a timestamp annotation and a `SELECT 0`, so even an
/// empty dataset produces a loadable base. Returns the number of keys
/// serialized.
pub(crate) async fn serialize_dataset<W>(
    out: &mut W,
    snapshot: &DatasetSnapshot,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut emitter = Emitter::new(out);

    emitter.annotation(unix_seconds()).await?;
    emitter.select(0).await?;
    let mut current_db = 0u32;

    let mut processed = 0u64;
    let mut last_report = Instant::now();

    for db in &snapshot.databases {
        if db.index != current_db {
            emitter.select(db.index).await?;
            current_db = db.index;
        }

        for entry in &db.entries {
            serialize_entry(&mut emitter, entry).await?;

            if let Some(ms) = entry.expire_at_ms {
                emitter
                    .command(&[
                        b"PEXPIREAT".to_vec(),
                        entry.key.to_vec(),
                        ms.to_string().into_bytes(),
                    ])
                    .await?;
            }

            processed += 1;
            if processed % PROGRESS_KEY_INTERVAL == 0
                && last_report.elapsed().as_secs() >= 1
            {
                info!(keys = processed, "Rewrite in progress.");
                last_report = Instant::now();
            }
        }
    }

    emitter.out.flush().await?;
    Ok(processed)
}

async fn serialize_entry<W>(emitter: &mut Emitter<'_, W>, entry: &Entry) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let key = entry.key.to_vec();
    match &entry.value {
        Value::String(value) => {
            emitter
                .command(&[b"SET".to_vec(), key, value.to_vec()])
                .await
        }
        Value::List(items) => {
            for chunk in items.chunks(REWRITE_ITEMS_PER_CMD) {
                let mut args = Vec::with_capacity(chunk.len() + 2);
                args.push(b"RPUSH".to_vec());
                args.push(key.clone());
                args.extend(chunk.iter().map(|item| item.to_vec()));
                emitter.command(&args).await?;
            }
            Ok(())
        }
        Value::Set(members) => {
            for chunk in members.chunks(REWRITE_ITEMS_PER_CMD) {
                let mut args = Vec::with_capacity(chunk.len() + 2);
                args.push(b"SADD".to_vec());
                args.push(key.clone());
                args.extend(chunk.iter().map(|member| member.to_vec()));
                emitter.command(&args).await?;
            }
            Ok(())
        }
        Value::SortedSet(members) => {
            for chunk in members.chunks(REWRITE_ITEMS_PER_CMD) {
                let mut args = Vec::with_capacity(chunk.len() * 2 + 2);
                args.push(b"ZADD".to_vec());
                args.push(key.clone());
                for scored in chunk {
                    args.push(format_double(scored.score).into_bytes());
                    args.push(scored.member.to_vec());
                }
                emitter.command(&args).await?;
            }
            Ok(())
        }
        Value::Hash(fields) => {
            for chunk in fields.chunks(REWRITE_ITEMS_PER_CMD) {
                let mut args = Vec::with_capacity(chunk.len() * 2 + 2);
                args.push(b"HMSET".to_vec());
                args.push(key.clone());
                for field in chunk {
                    args.push(field.field.to_vec());
                    args.push(field.value.to_vec());
                }
                emitter.command(&args).await?;
            }
            for field in fields {
                if let Some(ms) = field.expire_at_ms {
                    emitter
                        .command(&[
                            b"HPEXPIREAT".to_vec(),
                            key.clone(),
                            ms.to_string().into_bytes(),
                            b"FIELDS".to_vec(),
                            b"1".to_vec(),
                            field.field.to_vec(),
                        ])
                        .await?;
                }
            }
            Ok(())
        }
        Value::Stream(stream) => serialize_stream(emitter, &key, stream).await,
        Value::Extension(extension) => {
            for argv in (extension.dump)(&entry.key) {
                let args: Vec<Vec<u8>> = argv.iter().map(|arg| arg.to_vec()).collect();
                emitter.command(&args).await?;
            }
            Ok(())
        }
    }
}

async fn serialize_stream<W>(
    emitter: &mut Emitter<'_, W>,
    key: &[u8],
    stream: &StreamValue,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if stream.entries.is_empty() {
        // An empty stream still carries metadata. Add-and-trim leaves the
        // key in existence with zero entries, then XSETID restores its ids.
        let placeholder = if stream.last_id == StreamId::ZERO {
            StreamId { ms: 0, seq: 1 }
        } else {
            stream.last_id
        };
        emitter
            .command(&[
                b"XADD".to_vec(),
                key.to_vec(),
                b"MAXLEN".to_vec(),
                b"0".to_vec(),
                placeholder.to_string().into_bytes(),
                b"x".to_vec(),
                b"y".to_vec(),
            ])
            .await?;
    } else {
        for entry in &stream.entries {
            let mut args = Vec::with_capacity(entry.fields.len() * 2 + 3);
            args.push(b"XADD".to_vec());
            args.push(key.to_vec());
            args.push(entry.id.to_string().into_bytes());
            for (field, value) in &entry.fields {
                args.push(field.to_vec());
                args.push(value.to_vec());
            }
            emitter.command(&args).await?;
        }
    }

    emitter
        .command(&[
            b"XSETID".to_vec(),
            key.to_vec(),
            stream.last_id.to_string().into_bytes(),
            b"ENTRIESADDED".to_vec(),
            stream.entries_added.to_string().into_bytes(),
            b"MAXDELETEDID".to_vec(),
            stream.max_deleted_id.to_string().into_bytes(),
        ])
        .await?;

    for group in &stream.groups {
        emitter
            .command(&[
                b"XGROUP".to_vec(),
                b"CREATE".to_vec(),
                key.to_vec(),
                group.name.to_vec(),
                group.last_delivered.to_string().into_bytes(),
                b"ENTRIESREAD".to_vec(),
                group.entries_read.to_string().into_bytes(),
            ])
            .await?;

        for consumer in &group.consumers {
            if consumer.pending.is_empty() {
                emitter
                    .command(&[
                        b"XGROUP".to_vec(),
                        b"CREATECONSUMER".to_vec(),
                        key.to_vec(),
                        group.name.to_vec(),
                        consumer.name.to_vec(),
                    ])
                    .await?;
                continue;
            }

            for pending in &consumer.pending {
                emitter
                    .command(&[
                        b"XCLAIM".to_vec(),
                        key.to_vec(),
                        group.name.to_vec(),
                        consumer.name.to_vec(),
                        b"0".to_vec(),
                        pending.id.to_string().into_bytes(),
                        b"TIME".to_vec(),
                        pending.delivery_time_ms.to_string().into_bytes(),
                        b"RETRYCOUNT".to_vec(),
                        pending.delivery_count.to_string().into_bytes(),
                        b"JUSTID".to_vec(),
                        b"FORCE".to_vec(),
                    ])
                    .await?;
            }
        }
    }

    Ok(())
}

/// Formats a sorted-set score so it round-trips exactly through replay.
fn format_double(value: f64) -> String {
    if value == f64::INFINITY {
        "inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{value}")
    }
}

struct Emitter<'a, W> {
    out: &'a mut W,
    scratch: BytesMut,
}

impl<'a, W> Emitter<'a, W>
where
    W: AsyncWrite + Unpin,
{
    fn new(out: &'a mut W) -> Self {
        Self {
            out,
            scratch: BytesMut::with_capacity(16 * 1024),
        }
    }

    async fn command(&mut self, args: &[Vec<u8>]) -> io::Result<()> {
        self.scratch.clear();
        encode_command(&mut self.scratch, args);
        self.out.write_all(&self.scratch).await
    }

    async fn select(&mut self, db: u32) -> io::Result<()> {
        self.scratch.clear();
        encode_select(&mut self.scratch, db);
        self.out.write_all(&self.scratch).await
    }

    async fn annotation(&mut self, unix_sec: i64) -> io::Result<()> {
        self.scratch.clear();
        encode_ts_annotation(&mut self.scratch, unix_sec);
        self.out.write_all(&self.scratch).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::dataset::{DatabaseSnapshot, HashField};

    fn snapshot_of(index: u32, entries: Vec<Entry>) -> DatasetSnapshot {
        DatasetSnapshot {
            databases: vec![DatabaseSnapshot { index, entries }],
        }
    }

    #[tokio::test]
    async fn empty_dataset_emits_annotation_and_select_only() {
        let mut out = Vec::new();
        let keys = serialize_dataset(&mut out, &DatasetSnapshot::default())
            .await
            .expect("serialize should not fail");
        assert_eq!(keys, 0);

        let text = String::from_utf8(out).expect("output should be valid UTF-8");
        let mut lines = text.split("\r\n");
        assert!(lines.next().unwrap().starts_with("#TS:"));
        assert_eq!(lines.next(), Some("*2"));
        assert_eq!(lines.next(), Some("$6"));
        assert_eq!(lines.next(), Some("SELECT"));
        assert_eq!(lines.next(), Some("$1"));
        assert_eq!(lines.next(), Some("0"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn hash_with_field_expiration() {
        let entry = Entry {
            key: Bytes::from_static(b"h"),
            value: Value::Hash(vec![HashField {
                field: Bytes::from_static(b"f"),
                value: Bytes::from_static(b"v"),
                expire_at_ms: Some(1234567890),
            }]),
            expire_at_ms: None,
        };

        let mut out = Vec::new();
        serialize_dataset(&mut out, &snapshot_of(0, vec![entry]))
            .await
            .expect("serialize should not fail");

        let expected_hmset = b"*4\r\n$5\r\nHMSET\r\n$1\r\nh\r\n$1\r\nf\r\n$1\r\nv\r\n";
        let hmset_at = find(&out, expected_hmset).expect("HMSET framing should be present");

        let expected_expire = b"*7\r\n$10\r\nHPEXPIREAT\r\n$1\r\nh\r\n$10\r\n1234567890\r\n\
                                $6\r\nFIELDS\r\n$1\r\n1\r\n$1\r\nf\r\n";
        let expire_at = find(&out, expected_expire).expect("HPEXPIREAT framing should be present");
        assert!(expire_at > hmset_at);
    }

    #[tokio::test]
    async fn large_collections_are_batched() {
        let items: Vec<Bytes> = (0..150)
            .map(|i| Bytes::from(format!("item-{i}")))
            .collect();
        let entry = Entry {
            key: Bytes::from_static(b"biglist"),
            value: Value::List(items),
            expire_at_ms: None,
        };

        let mut out = Vec::new();
        serialize_dataset(&mut out, &snapshot_of(0, vec![entry]))
            .await
            .expect("serialize should not fail");

        let rpush_count = count(&out, b"$5\r\nRPUSH\r\n");
        assert_eq!(rpush_count, 3, "150 items should split into 64+64+22");
    }

    #[tokio::test]
    async fn extension_types_emit_through_their_callback() {
        use std::sync::Arc;

        use crate::dataset::ExtensionValue;

        let entry = Entry {
            key: Bytes::from_static(b"custom"),
            value: Value::Extension(ExtensionValue {
                type_name: "widget".to_string(),
                dump: Arc::new(|key| {
                    vec![vec![
                        Bytes::from_static(b"WIDGET.LOAD"),
                        key.clone(),
                        Bytes::from_static(b"payload"),
                    ]]
                }),
            }),
            expire_at_ms: None,
        };

        let mut out = Vec::new();
        serialize_dataset(&mut out, &snapshot_of(0, vec![entry]))
            .await
            .expect("serialize should not fail");

        assert!(find(&out, b"$11\r\nWIDGET.LOAD\r\n$6\r\ncustom\r\n$7\r\npayload\r\n").is_some());
    }

    #[tokio::test]
    async fn nonzero_database_gets_select() {
        let entry = Entry {
            key: Bytes::from_static(b"k"),
            value: Value::String(Bytes::from_static(b"v")),
            expire_at_ms: None,
        };

        let mut out = Vec::new();
        serialize_dataset(&mut out, &snapshot_of(3, vec![entry]))
            .await
            .expect("serialize should not fail");

        assert!(find(&out, b"$6\r\nSELECT\r\n$1\r\n3\r\n").is_some());
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    fn count(haystack: &[u8], needle: &[u8]) -> usize {
        haystack
            .windows(needle.len())
            .filter(|window| *window == needle)
            .count()
    }
}
