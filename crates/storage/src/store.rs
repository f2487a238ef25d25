use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Write version for last-writer-wins reconciliation.
///
/// Ordering is derived from field order: timestamp first, then `op_id`
/// ascending as the tie-break. Two decided writes to one key always have a
/// total order because `op_id` is globally unique.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub timestamp: u64,
    pub op_id: Uuid,
}

impl Stamp {
    pub fn new(timestamp: u64, op_id: Uuid) -> Self {
        Self { timestamp, op_id }
    }
}

/// A stored value together with the stamp of the write that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedValue {
    pub stamp: Stamp,
    pub value: serde_json::Value,
}

/// Ordered key/value store of replicated records.
///
/// `put` must only be invoked from the consensus decision handler; nothing
/// else in the process is allowed to mutate replicated state. Reads are
/// consistent with the last applied decision.
pub trait Store: Debug + Send + Sync {
    /// Apply a decided write. Returns `Ok(true)` when the value was
    /// installed and `Ok(false)` when an equal-or-newer stamp already holds
    /// the key (the write is superseded and dropped).
    fn put(&self, key: &str, value: serde_json::Value, stamp: Stamp) -> StoreResult<bool>;

    fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;

    /// All entries whose key starts with `prefix`, in lexicographic key
    /// order.
    fn range(&self, prefix: &str) -> StoreResult<Vec<(String, serde_json::Value)>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_orders_by_timestamp_then_op_id() {
        let low = Uuid::parse_str("00000000-0000-4000-8000-000000000001").expect("uuid");
        let high = Uuid::parse_str("ffffffff-ffff-4fff-bfff-ffffffffffff").expect("uuid");

        assert!(Stamp::new(1, high) < Stamp::new(2, low));
        assert!(Stamp::new(5, low) < Stamp::new(5, high));
        assert_eq!(Stamp::new(5, low), Stamp::new(5, low));
    }
}
