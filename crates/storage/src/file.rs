//! File-backed store: the in-memory map plus a JSON snapshot persisted on
//! every applied write.
//!
//! The snapshot lives at `<dir>/store.json` and is written atomically
//! (write to a temp file in the same directory, fsync, rename) so a crash
//! mid-write leaves the previous snapshot intact. On open the snapshot is
//! reloaded verbatim, stamps included, so last-writer-wins reconciliation
//! keeps working across restarts.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::memory::{lww_put, prefix_range};
use crate::store::{Stamp, Store, StoreResult, VersionedValue};

const SNAPSHOT_FILENAME: &str = "store.json";

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: RwLock<BTreeMap<String, VersionedValue>>,
}

impl FileStore {
    /// Open (or create) the store under `dir`, loading an existing snapshot
    /// if one is present.
    pub fn open(dir: &Path) -> StoreResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(SNAPSHOT_FILENAME);

        let map = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let map: BTreeMap<String, VersionedValue> = serde_json::from_str(&raw)?;
            debug!(entries = map.len(), "loaded store snapshot");
            map
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            inner: RwLock::new(map),
        })
    }

    fn persist(&self, map: &BTreeMap<String, VersionedValue>) -> StoreResult<()> {
        let body = serde_json::to_vec_pretty(map)?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f: File = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(&body)?;
            f.flush()?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Store for FileStore {
    fn put(&self, key: &str, value: serde_json::Value, stamp: Stamp) -> StoreResult<bool> {
        let mut map = self.inner.write();
        if !lww_put(&mut map, key, value, stamp) {
            return Ok(false);
        }
        self.persist(&map)?;
        Ok(true)
    }

    fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        Ok(self.inner.read().get(key).map(|v| v.value.clone()))
    }

    fn range(&self, prefix: &str) -> StoreResult<Vec<(String, serde_json::Value)>> {
        Ok(prefix_range(&self.inner.read(), prefix))
    }

    fn len(&self) -> usize {
        self.inner.read().len()
    }
}
