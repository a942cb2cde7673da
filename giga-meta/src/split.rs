//! `BulkExtractor`: the split primitive from `spec.md` §4.3. Moves every
//! dentry satisfying the migration predicate out of partition `p` and
//! into partition `c`, either by shipping a sorted run to a remote
//! destination or, when source and destination are the same server, by
//! rewriting keys in place.

use crate::error::MetaError;
use crate::keys::{dentry_key, partition_range};
use crate::metadb::MetaDB;
use giga_index::DirectoryIndex;
use giga_store::{sst, Key};
use std::path::{Path, PathBuf};

/// Output of the extract phase: a sorted run ready to ship, plus the
/// source keys that must be deleted once the destination has ingested it.
pub struct ExtractResult {
    pub sst_dir: PathBuf,
    pub min_seq: i64,
    pub max_seq: i64,
    pub num_entries: u64,
    moved_keys: Vec<Key>,
}

/// Two-phase bulk extractor for a remote split (spec §4.3, invariant I4):
/// `extract` builds the sorted run without touching the store; `commit`
/// deletes the moved keys from the source only after the destination has
/// confirmed ingestion. If the process crashes between the two, the
/// source still has every name (Extract was never committed) — never
/// both copies, never neither.
pub struct BulkExtractor<'a> {
    source: &'a MetaDB,
    dir_id: i64,
    parent_index: u16,
    child_index: u16,
}

impl<'a> BulkExtractor<'a> {
    pub fn new(source: &'a MetaDB, dir_id: i64, parent_index: u16, child_index: u16) -> Self {
        BulkExtractor {
            source,
            dir_id,
            parent_index,
            child_index,
        }
    }

    /// Builds the sorted run under `temp_dir` from every dentry in the
    /// parent partition whose name satisfies the migration predicate for
    /// `child_index`. Does not mutate the source store.
    pub fn extract(&self, temp_dir: &Path) -> Result<ExtractResult, MetaError> {
        let (start, end) = partition_range(self.dir_id, self.parent_index as i16);
        let entries = self.source.store().scan_range(start, end)?;

        let mut builder = sst::Builder::create(temp_dir)?;
        let mut moved_keys = Vec::new();
        for (key, value) in &entries {
            let dentry = crate::dentry::Dentry::decode(value)?;
            if !DirectoryIndex::belongs_to_child(&dentry.name, self.child_index) {
                continue;
            }
            let (_, _, hash) = crate::keys::decode_key(key);
            let new_key = dentry_key(self.dir_id, self.child_index as i16, hash);
            builder.append(&new_key, value)?;
            moved_keys.push(*key);
        }
        let num_entries = builder.count();
        builder.finish()?;

        Ok(ExtractResult {
            sst_dir: temp_dir.to_path_buf(),
            min_seq: 0,
            max_seq: (num_entries as i64 - 1).max(0),
            num_entries,
            moved_keys,
        })
    }

    /// Deletes the moved keys from the source store. Safe to call only
    /// after the destination has durably ingested the sorted run,
    /// preserving I4.
    pub fn commit(&self, result: &ExtractResult) -> Result<(), MetaError> {
        for key in &result.moved_keys {
            self.source.store().delete(key)?;
        }
        if result.sst_dir.exists() {
            std::fs::remove_dir_all(&result.sst_dir).ok();
        }
        Ok(())
    }
}

/// Same-server fast path (spec §4.3: "A local extractor variant ... skips
/// the sorted-run step and simply rewrites keys in a single write
/// batch"). Source and destination are the same `MetaDB`.
pub fn extract_local(
    db: &MetaDB,
    dir_id: i64,
    parent_index: u16,
    child_index: u16,
) -> Result<u64, MetaError> {
    let (start, end) = partition_range(dir_id, parent_index as i16);
    let entries = db.store().scan_range(start, end)?;
    let mut moved = 0u64;
    for (key, value) in entries {
        let dentry = crate::dentry::Dentry::decode(&value)?;
        if !DirectoryIndex::belongs_to_child(&dentry.name, child_index) {
            continue;
        }
        let (_, _, hash) = crate::keys::decode_key(&key);
        let new_key = dentry_key(dir_id, child_index as i16, hash);
        db.store().put(&new_key, &value)?;
        db.store().delete(&key)?;
        moved += 1;
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::dentry_key;
    use giga_store::{LogStore, OrderedStore};
    use std::sync::Arc;

    fn db_with_names(names: &[&str]) -> (tempfile::TempDir, MetaDB) {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn OrderedStore> = Arc::new(LogStore::open(tmp.path()).unwrap());
        let db = MetaDB::open(store, 0).unwrap();
        for name in names {
            let hash = giga_index::hash::hash_name(name);
            db.new_file(dentry_key(1, 0, hash), name, 0o644, 0, 0, 0)
                .unwrap();
        }
        (tmp, db)
    }

    #[test]
    fn remote_split_preserves_total_count_and_predicate() {
        let names: Vec<String> = (0..40).map(|i| format!("file-{i}")).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let (_tmp, db) = db_with_names(&name_refs);

        let before = db.list_entries(1, 0, 0).unwrap().len();
        let child = 1u16; // splitting radix-0 partition 0 -> child 1

        let extractor = BulkExtractor::new(&db, 1, 0, child);
        let run_dir = tempfile::tempdir().unwrap();
        let result = extractor.extract(run_dir.path()).unwrap();
        extractor.commit(&result).unwrap();

        let remaining = db.list_entries(1, 0, 0).unwrap();
        assert_eq!(remaining.len() as u64 + result.num_entries, before as u64); // P4
        for d in &remaining {
            assert!(!DirectoryIndex::belongs_to_child(&d.name, child));
        }
        assert!(!run_dir.path().join(giga_store::sst::RUN_FILE_NAME).exists());
    }

    #[test]
    fn local_split_rewrites_keys_in_place() {
        let names: Vec<String> = (0..20).map(|i| format!("n{i}")).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let (_tmp, db) = db_with_names(&name_refs);

        let before = db.list_entries(1, 0, 0).unwrap().len();
        let moved = extract_local(&db, 1, 0, 1).unwrap();
        let remaining = db.list_entries(1, 0, 0).unwrap().len();
        let in_child = db.list_entries(1, 1, 0).unwrap().len();

        assert_eq!(remaining as u64 + moved, before as u64);
        assert_eq!(in_child as u64, moved);
    }
}
