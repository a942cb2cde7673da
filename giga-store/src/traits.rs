use crate::error::StoreError;
use crate::key::Key;
use std::path::Path;

/// The abstract contract `spec.md` §4.1 calls `OrderedStore`: a sorted KV
/// engine with point ops, a range scan, and a bulk-ingest operation that
/// atomically installs externally-built sorted runs.
///
/// This is the seam the rest of the workspace is written against; the
/// concrete `LogStore` in this crate is one implementation, kept simple
/// enough to reason about rather than tuned for production throughput.
pub trait OrderedStore: Send + Sync {
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &Key, value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &Key) -> Result<(), StoreError>;

    fn exists(&self, key: &Key) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Inclusive `[start, end]` range scan in ascending key order.
    fn scan_range(&self, start: Key, end: Key) -> Result<Vec<(Key, Vec<u8>)>, StoreError>;

    /// Atomically installs the sorted run(s) found directly under
    /// `sst_dir` into the store. `min_seq`/`max_seq` identify the
    /// sequence-number range the source server assigned these keys, so
    /// the destination can log/assert continuity; this implementation
    /// does not need them for correctness since ingested segments never
    /// overlap keys already live in the destination store (a split only
    /// ever moves names into a partition index the destination has not
    /// seen before).
    fn bulk_ingest(&self, sst_dir: &Path, min_seq: i64, max_seq: i64) -> Result<(), StoreError>;
}
