//! Volatile in-memory store backend. The reference backing for tests and
//! for nodes that accept losing replicated state on restart (peers re-decide
//! it back into existence over time).

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::store::{Stamp, Store, StoreResult, VersionedValue};

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<BTreeMap<String, VersionedValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared last-writer-wins gate for both backends.
pub(crate) fn lww_put(
    map: &mut BTreeMap<String, VersionedValue>,
    key: &str,
    value: serde_json::Value,
    stamp: Stamp,
) -> bool {
    match map.get(key) {
        Some(existing) if existing.stamp >= stamp => false,
        _ => {
            map.insert(key.to_string(), VersionedValue { stamp, value });
            true
        }
    }
}

pub(crate) fn prefix_range(
    map: &BTreeMap<String, VersionedValue>,
    prefix: &str,
) -> Vec<(String, serde_json::Value)> {
    map.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.value.clone()))
        .collect()
}

impl Store for MemoryStore {
    fn put(&self, key: &str, value: serde_json::Value, stamp: Stamp) -> StoreResult<bool> {
        Ok(lww_put(&mut self.inner.write(), key, value, stamp))
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn stamp(ts: u64, nibble: &str) -> Stamp {
        let op_id = Uuid::parse_str(&format!("00000000-0000-4000-8000-00000000000{}", nibble))
            .expect("uuid");
        Stamp::new(ts, op_id)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.put("tasks/t1", json!({"status": "assigned"}), stamp(1, "1")).expect("put"));
        assert_eq!(
            store.get("tasks/t1").expect("get"),
            Some(json!({"status": "assigned"}))
        );
        assert_eq!(store.get("tasks/nope").expect("get"), None);
    }

    #[test]
    fn test_older_stamp_never_overwrites() {
        let store = MemoryStore::new();
        assert!(store.put("k", json!("new"), stamp(10, "1")).expect("put"));
        assert!(!store.put("k", json!("old"), stamp(5, "2")).expect("put"));
        assert_eq!(store.get("k").expect("get"), Some(json!("new")));
    }

    #[test]
    fn test_equal_timestamp_breaks_ties_by_op_id() {
        let store = MemoryStore::new();
        assert!(store.put("k", json!("low"), stamp(7, "1")).expect("put"));
        assert!(store.put("k", json!("high"), stamp(7, "2")).expect("put"));
        // Same stamp replayed: idempotent no-op.
        assert!(!store.put("k", json!("replay"), stamp(7, "2")).expect("put"));
        assert_eq!(store.get("k").expect("get"), Some(json!("high")));
    }

    #[test]
    fn test_range_is_prefix_scoped_and_ordered() {
        let store = MemoryStore::new();
        store.put("tasks/b", json!(2), stamp(1, "1")).expect("put");
        store.put("tasks/a", json!(1), stamp(1, "2")).expect("put");
        store.put("peers/x", json!(0), stamp(1, "3")).expect("put");

        let tasks = store.range("tasks/").expect("range");
        let keys: Vec<&str> = tasks.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["tasks/a", "tasks/b"]);
    }
}
