use std::{future::Future, path::Path, sync::Arc, sync::Once};

use bytes::Bytes;
use temp_dir::TempDir;
use tracing_subscriber::EnvFilter;

use crate::{Aof, AofConfig, FsyncPolicy, LoadReport};

mod loading;

pub(crate) use model::{ModelStore, ModelValue};

#[macro_export]
macro_rules! assert_file_exists_async {
    ($file_path:expr) => {{
        let result = tokio::fs::metadata($file_path).await;
        assert!(
            result.is_ok() && result.expect("is_ok() was true").is_file(),
            "expected file to exist: {:?}",
            $file_path
        );
    }};
}

#[macro_export]
macro_rules! assert_file_does_not_exist_async {
    ($file_path:expr) => {{
        let result = tokio::fs::metadata($file_path).await;
        assert!(
            result.is_err(),
            "expected file to not exist: {:?}",
            $file_path
        );
    }};
}

static TRACING: Once = Once::new();

/// Installs a subscriber so `RUST_LOG`-filtered output shows up when a test
/// is run with `--nocapture`.
pub(crate) fn install_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub(crate) async fn with_temp_dir<F, Fut, V>(f: F) -> V
where
    F: FnOnce(&Path) -> Fut,
    Fut: Future<Output = V>,
{
    let dir = TempDir::with_prefix("kv-aof")
        .expect("cannot recover from failure to create temp dir");
    f(dir.path()).await
}

/// Default test configuration: `Always` so durability is synchronous and
/// deterministic. Tests exercising the background fsync path override it.
pub(crate) fn test_config(data_dir: &Path) -> AofConfig {
    AofConfig::from_path(data_dir)
        .fsync(FsyncPolicy::Always)
        .build()
}

pub(crate) fn argv(args: &[&str]) -> Vec<Bytes> {
    args.iter()
        .map(|a| Bytes::copy_from_slice(a.as_bytes()))
        .collect()
}

/// Opens the log against a fresh model store that serves as both the replay
/// sink and the snapshot source.
pub(crate) async fn open_with_model(config: &AofConfig) -> (Aof, ModelStore, LoadReport) {
    let store = ModelStore::default();
    let mut sink = store.clone();
    let (aof, report) = Aof::open(config.clone(), &mut sink, Arc::new(store.clone()))
        .await
        .expect("open should not fail");
    (aof, store, report)
}

/// Applies a command to the model and propagates it to the log, the way the
/// command dispatch layer would.
pub(crate) fn feed(aof: &mut Aof, store: &ModelStore, db: u32, args: &[&str]) {
    let argv = argv(args);
    store.apply(db, &argv);
    aof.feed_command(db, &argv);
}
