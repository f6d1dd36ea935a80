use bytes::BytesMut;
use proptest::prelude::*;
use temp_dir::TempDir;
use tokio::io::AsyncWriteExt;

use super::{argv, feed, open_with_model, test_config, with_temp_dir};
use crate::{
    assert_file_does_not_exist_async, assert_file_exists_async, record::encode_command, AofConfig,
    FsyncPolicy, LoadOutcome, LoaderError, OpenError,
};

async fn append_raw(path: &std::path::Path, bytes: &[u8]) {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .expect("tail should be openable");
    file.write_all(bytes).await.expect("append should not fail");
    file.sync_all().await.expect("sync should not fail");
}

#[tokio::test]
async fn truncated_tail_is_repaired_and_tolerated() {
    with_temp_dir(|dir| {
        let config = test_config(dir);

        async move {
            let (mut aof, store, _) = open_with_model(&config).await;
            feed(&mut aof, &store, 0, &["SET", "a", "1"]);
            feed(&mut aof, &store, 0, &["SET", "b", "2"]);
            aof.flush(true).await.expect("flush should not fail");

            let manifest = aof.manifest();
            let tail = config.segment_path(&manifest.incrs().last().unwrap().name);
            aof.close().await.expect("close should not fail");

            let valid_len = tokio::fs::metadata(&tail)
                .await
                .expect("tail should exist")
                .len();

            // A command cut off mid-payload.
            append_raw(&tail, b"*3\r\n$3\r\nSET\r\n$1\r\nx").await;

            let (aof, reloaded, report) = open_with_model(&config).await;
            assert_eq!(report.outcome, LoadOutcome::Truncated);
            assert_eq!(reloaded.string(0, b"a").as_deref(), Some(b"1".as_slice()));
            assert_eq!(reloaded.string(0, b"b").as_deref(), Some(b"2".as_slice()));
            assert_eq!(reloaded.value(0, b"x"), None);

            // The damaged tail was cut back to the last complete command.
            assert_eq!(
                tokio::fs::metadata(&tail).await.expect("tail").len(),
                valid_len
            );
            aof.close().await.expect("close should not fail");

            // A second reload sees a clean log.
            let (aof, _, report) = open_with_model(&config).await;
            assert_eq!(report.outcome, LoadOutcome::Ok);
            aof.close().await.expect("close should not fail");
        }
    })
    .await;
}

#[tokio::test]
async fn truncated_tail_is_fatal_when_tolerance_disabled() {
    with_temp_dir(|dir| {
        let config = AofConfig::from_path(dir)
            .fsync(FsyncPolicy::Always)
            .load_truncated(false)
            .build();

        async move {
            let (mut aof, store, _) = open_with_model(&config).await;
            feed(&mut aof, &store, 0, &["SET", "a", "1"]);
            aof.flush(true).await.expect("flush should not fail");
            let manifest = aof.manifest();
            let tail = config.segment_path(&manifest.incrs().last().unwrap().name);
            aof.close().await.expect("close should not fail");

            append_raw(&tail, b"*2\r\n$3\r\nDEL").await;

            let store = super::ModelStore::default();
            let mut sink = store.clone();
            let result =
                crate::Aof::open(config.clone(), &mut sink, std::sync::Arc::new(store)).await;
            assert!(matches!(
                result,
                Err(OpenError::Load {
                    source: LoaderError::TruncatedSegment { .. }
                })
            ));
        }
    })
    .await;
}

#[tokio::test]
async fn eof_inside_transaction_rewinds_to_before_multi() {
    with_temp_dir(|dir| {
        let config = test_config(dir);

        async move {
            let (mut aof, store, _) = open_with_model(&config).await;
            feed(&mut aof, &store, 0, &["SET", "a", "1"]);
            aof.flush(true).await.expect("flush should not fail");
            let manifest = aof.manifest();
            let tail = config.segment_path(&manifest.incrs().last().unwrap().name);
            aof.close().await.expect("close should not fail");

            let valid_len = tokio::fs::metadata(&tail).await.expect("tail").len();

            // A transaction that never saw EXEC: complete framing, but the
            // stream ends mid-transaction.
            let mut extra = BytesMut::new();
            encode_command(&mut extra, &argv(&["MULTI"]));
            encode_command(&mut extra, &argv(&["SET", "b", "2"]));
            append_raw(&tail, &extra).await;

            let (aof, reloaded, report) = open_with_model(&config).await;
            assert_eq!(report.outcome, LoadOutcome::Truncated);
            assert_eq!(reloaded.string(0, b"a").as_deref(), Some(b"1".as_slice()));
            assert_eq!(
                reloaded.value(0, b"b"),
                None,
                "commands inside an unfinished transaction must not apply"
            );
            assert_eq!(
                tokio::fs::metadata(&tail).await.expect("tail").len(),
                valid_len,
                "the file should be cut back to before MULTI"
            );
            aof.close().await.expect("close should not fail");
        }
    })
    .await;
}

#[tokio::test]
async fn completed_transaction_applies_on_reload() {
    with_temp_dir(|dir| {
        let config = test_config(dir);

        async move {
            let (mut aof, store, _) = open_with_model(&config).await;
            feed(&mut aof, &store, 0, &["MULTI"]);
            feed(&mut aof, &store, 0, &["SET", "t", "1"]);
            feed(&mut aof, &store, 0, &["EXEC"]);
            aof.flush(true).await.expect("flush should not fail");
            drop(aof);

            let (aof, reloaded, report) = open_with_model(&config).await;
            assert_eq!(report.outcome, LoadOutcome::Ok);
            assert_eq!(reloaded.string(0, b"t").as_deref(), Some(b"1".as_slice()));
            aof.close().await.expect("close should not fail");
        }
    })
    .await;
}

#[tokio::test]
async fn unknown_command_aborts_replay() {
    with_temp_dir(|dir| {
        let config = test_config(dir);

        async move {
            let (mut aof, store, _) = open_with_model(&config).await;
            feed(&mut aof, &store, 0, &["SET", "a", "1"]);
            aof.flush(true).await.expect("flush should not fail");
            let manifest = aof.manifest();
            let tail = config.segment_path(&manifest.incrs().last().unwrap().name);
            aof.close().await.expect("close should not fail");

            let mut extra = BytesMut::new();
            encode_command(&mut extra, &argv(&["BOGUS", "x"]));
            append_raw(&tail, &extra).await;

            let store = super::ModelStore::default();
            let mut sink = store.clone();
            let result =
                crate::Aof::open(config.clone(), &mut sink, std::sync::Arc::new(store)).await;
            let error = result.err().expect("replay must fail");
            assert!(
                matches!(
                    error,
                    OpenError::Load {
                        source: LoaderError::Replay { .. }
                    }
                ),
                "unexpected error: {error}"
            );
        }
    })
    .await;
}

#[tokio::test]
async fn non_monotonic_manifest_aborts_startup() {
    with_temp_dir(|dir| {
        let config = test_config(dir);

        async move {
            tokio::fs::create_dir_all(config.aof_dir())
                .await
                .expect("mkdir should not fail");
            tokio::fs::write(
                config.manifest_path(),
                "file x.1.base.aof seq 1 type b\n\
                 file x.2.incr.aof seq 2 type i\n\
                 file x.1.incr.aof seq 1 type i\n",
            )
            .await
            .expect("write should not fail");

            let store = super::ModelStore::default();
            let mut sink = store.clone();
            let result =
                crate::Aof::open(config.clone(), &mut sink, std::sync::Arc::new(store)).await;
            let error = result.err().expect("startup must abort");
            assert!(
                error.to_string().contains("non-monotonic sequence"),
                "unexpected error: {error}"
            );
        }
    })
    .await;
}

#[tokio::test]
async fn legacy_single_file_is_migrated_once() {
    with_temp_dir(|dir| {
        let config = test_config(dir);

        async move {
            let mut legacy = BytesMut::new();
            encode_command(&mut legacy, &argv(&["SET", "k", "legacy"]));
            tokio::fs::write(config.legacy_path(), &legacy)
                .await
                .expect("write should not fail");

            let (aof, store, report) = open_with_model(&config).await;
            assert_eq!(report.outcome, LoadOutcome::Ok);
            assert_eq!(
                store.string(0, b"k").as_deref(),
                Some(b"legacy".as_slice())
            );

            let manifest = aof.manifest();
            let base = manifest.base().expect("base should exist");
            assert_eq!(base.name, "appendonly.aof");
            assert_eq!(base.seq, 1);

            assert_file_exists_async!(&config.segment_path("appendonly.aof"));
            assert_file_does_not_exist_async!(&config.legacy_path());

            aof.close().await.expect("close should not fail");

            // Second startup: the directory exists, nothing to re-upgrade.
            let (aof, store, report) = open_with_model(&config).await;
            assert_eq!(report.outcome, LoadOutcome::Ok);
            assert_eq!(
                store.string(0, b"k").as_deref(),
                Some(b"legacy".as_slice())
            );
            let manifest = aof.manifest();
            assert_eq!(manifest.base().expect("base").seq, 1);
            aof.close().await.expect("close should not fail");
        }
    })
    .await;
}

#[tokio::test]
async fn binary_base_without_codec_is_fatal() {
    with_temp_dir(|dir| {
        let config = test_config(dir);

        async move {
            tokio::fs::create_dir_all(config.aof_dir())
                .await
                .expect("mkdir should not fail");
            tokio::fs::write(
                config.segment_path("appendonly.aof.1.base.rdb"),
                b"REDIS0011\x00\x00binary-payload",
            )
            .await
            .expect("write should not fail");
            tokio::fs::write(
                config.manifest_path(),
                "file appendonly.aof.1.base.rdb seq 1 type b\n",
            )
            .await
            .expect("write should not fail");

            let store = super::ModelStore::default();
            let mut sink = store.clone();
            let result =
                crate::Aof::open(config.clone(), &mut sink, std::sync::Arc::new(store)).await;
            assert!(matches!(
                result,
                Err(OpenError::Load {
                    source: LoaderError::MissingCodec { .. }
                })
            ));
        }
    })
    .await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // Appending arbitrary garbage to the tail and reloading with truncation
    // tolerance recovers exactly the dataset from before the damage.
    #[test]
    fn garbage_tail_recovers_prefix(garbage in proptest::collection::vec(any::<u8>(), 1..128)) {
        // A '*' lead-in could, in principle, frame random bytes as a
        // complete (and unknown) command; the property is about damage, not
        // about adversarially-valid framing.
        prop_assume!(garbage[0] != b'*');

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime should build");

        runtime.block_on(async move {
            let dir = TempDir::with_prefix("kv-aof-prop").expect("temp dir");
            let config = test_config(dir.path());

            let (mut aof, store, _) = open_with_model(&config).await;
            feed(&mut aof, &store, 0, &["SET", "alpha", "1"]);
            feed(&mut aof, &store, 0, &["RPUSH", "items", "a", "b", "c"]);
            feed(&mut aof, &store, 1, &["SET", "beta", "2"]);
            aof.flush(true).await.expect("flush should not fail");

            let manifest = aof.manifest();
            let tail = config.segment_path(&manifest.incrs().last().unwrap().name);
            let expected = store.databases();
            aof.close().await.expect("close should not fail");

            append_raw(&tail, &garbage).await;

            let (aof, reloaded, _) = open_with_model(&config).await;
            assert_eq!(reloaded.databases(), expected);
            aof.close().await.expect("close should not fail");
        });
    }
}
