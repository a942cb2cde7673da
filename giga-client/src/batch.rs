//! The pre-split batch-ingest mode (spec.md §4.7): a client that has been
//! handed a whole, not-yet-owned partition accumulates its subtree in a
//! local `MetaDB` and ships it as one sorted run once done, instead of
//! paying a round trip per `Mknod`.
//!
//! The remote side of the shipment reuses `InsertSplit` (spec.md §4.4)
//! rather than a dedicated RPC: `InsertSplit`'s handler already does
//! exactly what a batch-ingest destination needs — bulk-load a sorted run
//! and merge a directory-index delta — and the spec names no RPC of its
//! own for this path (see DESIGN.md).

use crate::error::ClientError;
use giga_index::{hash::hash_name, DirectoryIndex};
use giga_meta::{dentry_key, MetaDB};
use giga_rpc::conn::ConnectionManager;
use giga_rpc::pb::InsertSplitRequest;
use giga_store::{sst, LogStore, OrderedStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Local accumulator for one partition's worth of not-yet-shipped
/// dentries.
pub struct BatchClient {
    dir_id: i64,
    partition_index: u16,
    zeroth_server: i16,
    meta: MetaDB,
}

impl BatchClient {
    /// Opens a fresh local store under `local_dir` for `partition_index`
    /// of `dir_id`. `zeroth_server` is carried through unchanged into the
    /// directory-index delta this partition ships with, since the batch
    /// client never owns partition 0 itself.
    pub fn open(
        local_dir: &Path,
        dir_id: i64,
        partition_index: u16,
        zeroth_server: i16,
    ) -> Result<Self, ClientError> {
        let store: Arc<dyn OrderedStore> = Arc::new(LogStore::open(local_dir)?);
        let meta = MetaDB::open(store, 0)?;
        Ok(BatchClient {
            dir_id,
            partition_index,
            zeroth_server,
            meta,
        })
    }

    /// Buffers a new file locally; never touches the network.
    pub fn create(&self, name: &str, mode: u32, uid: i32, gid: i32, now: i64) -> Result<(), ClientError> {
        let key = dentry_key(self.dir_id, self.partition_index as i16, hash_name(name));
        self.meta.new_file(key, name, mode, uid, gid, now)?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, ClientError> {
        Ok(self.meta.list_entries(self.dir_id, self.partition_index as i16, 0)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, ClientError> {
        Ok(self.len()? == 0)
    }

    /// Builds a sorted run from everything accumulated so far and ships
    /// it to `dest_server` via `InsertSplit`, with `parent_index ==
    /// child_index == partition_index`: the destination has never seen
    /// this partition, so there is nothing to split away from, only a
    /// fresh range to bulk-load.
    ///
    /// `run_dir` must be a path the destination server can also read (the
    /// same assumption `giga-server`'s split coordinator makes for a
    /// same-host or shared-filesystem deployment).
    pub async fn ship(
        &self,
        conn: &ConnectionManager,
        dest_server: i32,
        run_dir: &Path,
    ) -> Result<(), ClientError> {
        let keys = self.build_run(run_dir)?;

        let mut dmap = DirectoryIndex::new(self.dir_id, self.zeroth_server);
        dmap.set_bit(self.partition_index);

        let mut client = conn.client(dest_server).await?;
        client
            .insert_split(InsertSplitRequest {
                dir_id: self.dir_id,
                parent_index: self.partition_index as i32,
                child_index: self.partition_index as i32,
                sst_dir: run_dir.to_string_lossy().to_string(),
                dmap: dmap.encode(),
                min_seq: 0,
                max_seq: (keys as i64 - 1).max(0),
                num_entries: keys as i64,
            })
            .await
            .map_err(|s| crate::error::translate_status(dest_server, s))?;
        Ok(())
    }

    fn build_run(&self, run_dir: &Path) -> Result<u64, ClientError> {
        let (start, end) = giga_meta::partition_range(self.dir_id, self.partition_index as i16);
        let entries = self.meta.store().scan_range(start, end)?;
        let mut builder = sst::Builder::create(run_dir)?;
        for (key, value) in &entries {
            builder.append(key, value)?;
        }
        let count = builder.count();
        builder.finish()?;
        Ok(count)
    }
}

/// Convenience for callers that want a throwaway local directory rather
/// than managing one themselves.
pub fn temp_local_dir() -> std::io::Result<(tempfile::TempDir, PathBuf)> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().to_path_buf();
    Ok((tmp, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_len_counts_local_entries() {
        let (_tmp, dir) = temp_local_dir().unwrap();
        let batch = BatchClient::open(&dir, 9, 3, 0).unwrap();
        assert!(batch.is_empty().unwrap());
        batch.create("a", 0o644, 0, 0, 0).unwrap();
        batch.create("b", 0o644, 0, 0, 0).unwrap();
        assert_eq!(batch.len().unwrap(), 2);
    }

    #[test]
    fn build_run_writes_every_entry_in_key_order() {
        let (_tmp, dir) = temp_local_dir().unwrap();
        let batch = BatchClient::open(&dir, 9, 3, 0).unwrap();
        for i in 0..20 {
            batch.create(&format!("f{i}"), 0o644, 0, 0, 0).unwrap();
        }
        let (_run_tmp, run_dir) = temp_local_dir().unwrap();
        let count = batch.build_run(&run_dir).unwrap();
        assert_eq!(count, 20);
        let entries = sst::read_dir_sorted(&run_dir).unwrap();
        assert_eq!(entries.len(), 20);
    }
}
