//! Durable key/value store shared between the server and the producer process.
//!
//! Writes are coalesced in memory and flushed periodically; reads always go to disk so
//! that another process observes the last flushed value.
//!
//! On-disk format: one pretty-printed JSON object. Each flush writes `<file>.tmp` and
//! renames it over the canonical path, so a reader never sees a partial file. A missing
//! or corrupt file reads as an empty map.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// File name used when the store is opened from a data directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Key holding the R register index the producer mirrors the TCP velocity into.
pub const TCP_VELOCITY_R_INDEX_KEY: &str = "tcp_velocity_r_index";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub flush_interval: Duration,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_interval: Duration::from_secs(5),
        }
    }

    /// Store at `<dir>/state.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(STATE_FILE_NAME))
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to prepare state directory {path}: {source}")]
    Prepare { path: PathBuf, source: io::Error },
    #[error("failed to write state file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Default)]
struct Pending {
    entries: Map<String, Value>,
    dirty: bool,
}

pub struct DurableKvStore {
    path: PathBuf,
    tmp_path: PathBuf,
    flush_interval: Duration,
    pending: Mutex<Pending>,
    /// Serializes flushes so two writers never race on the temp file.
    flushing: Mutex<()>,
}

impl DurableKvStore {
    /// Open the store, creating the parent directory if needed. Nothing is read yet.
    pub fn open(config: StoreConfig) -> Result<Arc<Self>, StoreError> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StoreError::Prepare {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut tmp = config.path.clone().into_os_string();
        tmp.push(".tmp");

        tracing::debug!(path = %config.path.display(), "Opened state store");

        Ok(Arc::new(Self {
            path: config.path,
            tmp_path: PathBuf::from(tmp),
            flush_interval: config.flush_interval,
            pending: Mutex::new(Pending::default()),
            flushing: Mutex::new(()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a write. Becomes visible to `get` after the next flush.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut pending = self.lock_pending();
        pending.entries.insert(key.into(), value.into());
        pending.dirty = true;
    }

    /// Read `key` from the last flushed snapshot on disk.
    pub fn get(&self, key: &str) -> Option<Value> {
        read_snapshot(&self.path).remove(key)
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Read and deserialize `key`. A value of the wrong shape reads as `None`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, error = %e, "Stored value has unexpected type");
                None
            }
        }
    }

    /// Full on-disk snapshot.
    pub fn snapshot(&self) -> Map<String, Value> {
        read_snapshot(&self.path)
    }

    pub fn is_dirty(&self) -> bool {
        self.lock_pending().dirty
    }

    /// Merge pending writes into the on-disk snapshot.
    ///
    /// Returns `Ok(false)` when there was nothing to write. On a write failure the
    /// entries that were not overwritten in the meantime are queued again.
    pub fn flush(&self) -> Result<bool, StoreError> {
        let _flushing = self.flushing.lock().unwrap_or_else(PoisonError::into_inner);

        let (merged, written) = {
            let mut pending = self.lock_pending();
            if !pending.dirty {
                return Ok(false);
            }
            let mut data = read_snapshot(&self.path);
            let written = std::mem::take(&mut pending.entries);
            for (k, v) in &written {
                data.insert(k.clone(), v.clone());
            }
            pending.dirty = false;
            (data, written)
        };

        if let Err(e) = self.write_snapshot(&merged) {
            let mut pending = self.lock_pending();
            for (k, v) in written {
                pending.entries.entry(k).or_insert(v);
            }
            pending.dirty = true;
            return Err(e);
        }

        tracing::debug!(keys = merged.len(), path = %self.path.display(), "Flushed state");
        Ok(true)
    }

    fn write_snapshot(&self, data: &Map<String, Value>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(data)?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let mut file = File::create(&self.tmp_path).map_err(write_err)?;
        file.write_all(&bytes).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);
        fs::rename(&self.tmp_path, &self.path).map_err(write_err)
    }

    async fn flush_off_thread(self: &Arc<Self>) {
        let store = Arc::clone(self);
        match tokio::task::spawn_blocking(move || store.flush()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "State flush failed; will retry"),
            Err(e) => tracing::error!(error = %e, "State flush task panicked"),
        }
    }

    /// Flush every `flush_interval` until `cancel` fires, then flush once more.
    pub fn spawn_flusher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => store.flush_off_thread().await,
                }
            }

            store.flush_off_thread().await;
            tracing::debug!("State flusher stopped");
        })
    }

    /// Final flush on shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        self.flush_off_thread().await;
    }
}

fn read_snapshot(path: &Path) -> Map<String, Value> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Map::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read state file, treating as empty");
            return Map::new();
        }
    };

    match serde_json::from_slice::<Map<String, Value>>(&bytes) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "State file is corrupt, treating as empty");
            Map::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_in(dir: &tempfile::TempDir) -> Arc<DurableKvStore> {
        DurableKvStore::open(StoreConfig::in_dir(dir.path())).unwrap()
    }

    #[test]
    fn get_on_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir);
        assert_eq!(store.get("r_index"), None);
        assert_eq!(store.get_or("r_index", json!(0)), json!(0));
    }

    #[test]
    fn set_is_invisible_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir);

        store.set("r_index", 5);
        assert!(store.is_dirty());
        assert_eq!(store.get("r_index"), None);
        assert!(!store.path().exists());

        assert!(store.flush().unwrap());
        assert_eq!(store.get("r_index"), Some(json!(5)));
        assert!(!store.is_dirty());
    }

    #[test]
    fn get_before_flush_returns_previous_on_disk_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir);
        store.set("r_index", 3);
        store.flush().unwrap();

        store.set("r_index", 7);
        assert_eq!(store.get_as::<i64>("r_index"), Some(3));
        store.flush().unwrap();
        assert_eq!(store.get_as::<i64>("r_index"), Some(7));
    }

    #[test]
    fn last_set_before_flush_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir);
        store.set("k", "a");
        store.set("k", "b");
        store.set("k", "c");
        store.flush().unwrap();
        assert_eq!(store.get("k"), Some(json!("c")));
    }

    #[test]
    fn flush_without_changes_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir);
        assert!(!store.flush().unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn flush_merges_with_existing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        fs::write(&path, r#"{"kept": true, "replaced": 1}"#).unwrap();

        let store = open_in(&dir);
        store.set("replaced", 2);
        store.set("added", json!({"nested": [1, 2]}));
        store.flush().unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.get("kept"), Some(&json!(true)));
        assert_eq!(snapshot.get("replaced"), Some(&json!(2)));
        assert_eq!(snapshot.get("added"), Some(&json!({"nested": [1, 2]})));
    }

    #[test]
    fn corrupt_file_reads_as_empty_and_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        fs::write(&path, "{\"r_index\": 4").unwrap();

        let store = open_in(&dir);
        assert_eq!(store.get("r_index"), None);

        store.set("other", 1);
        store.flush().unwrap();
        let on_disk: Map<String, Value> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk.get("other"), Some(&json!(1)));
    }

    #[test]
    fn non_object_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE_NAME), "[1, 2, 3]").unwrap();
        let store = open_in(&dir);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn flush_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir);
        store.set("a", 1);
        store.flush().unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![STATE_FILE_NAME.to_string()]);
    }

    #[test]
    fn second_instance_sees_flushed_value() {
        let dir = tempfile::tempdir().unwrap();
        let writer = open_in(&dir);
        let reader = open_in(&dir);

        writer.set(TCP_VELOCITY_R_INDEX_KEY, 12);
        assert_eq!(reader.get_as::<i64>(TCP_VELOCITY_R_INDEX_KEY), None);
        writer.flush().unwrap();
        assert_eq!(reader.get_as::<i64>(TCP_VELOCITY_R_INDEX_KEY), Some(12));
    }

    #[test]
    fn failed_write_requeues_pending_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join(STATE_FILE_NAME);
        let store = DurableKvStore::open(StoreConfig::new(&path)).unwrap();
        fs::remove_dir(path.parent().unwrap()).unwrap();

        store.set("k", 1);
        assert!(store.flush().is_err());
        assert!(store.is_dirty());

        fs::create_dir(path.parent().unwrap()).unwrap();
        assert!(store.flush().unwrap());
        assert_eq!(store.get("k"), Some(json!(1)));
    }

    #[test]
    fn get_as_wrong_type_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir);
        store.set("r_index", "five");
        store.flush().unwrap();
        assert_eq!(store.get_as::<i64>("r_index"), None);
    }

    #[tokio::test]
    async fn flusher_persists_after_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableKvStore::open(
            StoreConfig::in_dir(dir.path()).with_flush_interval(Duration::from_millis(50)),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let flusher = store.spawn_flusher(cancel.clone());

        store.set("r_index", 5);
        assert_eq!(store.get("r_index"), None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get("r_index"), Some(json!(5)));

        cancel.cancel();
        flusher.await.unwrap();
    }

    #[tokio::test]
    async fn flusher_flushes_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableKvStore::open(
            StoreConfig::in_dir(dir.path()).with_flush_interval(Duration::from_secs(3600)),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let flusher = store.spawn_flusher(cancel.clone());

        store.set("k", "v");
        cancel.cancel();
        flusher.await.unwrap();
        assert_eq!(store.get("k"), Some(json!("v")));
    }

    #[tokio::test]
    async fn shutdown_flushes_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir);
        store.set("k", 1);
        store.shutdown().await;
        assert_eq!(store.get("k"), Some(json!(1)));
    }
}
