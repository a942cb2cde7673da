//! `spec.md` §4.3: the per-directory inode/dentry/mapping schema layered
//! on top of an `OrderedStore`.

use crate::dentry::Dentry;
use crate::error::MetaError;
use crate::keys::{dentry_key, inode_counter_key, mapping_key, partition_range};
use giga_index::DirectoryIndex;
use giga_store::{Key, OrderedStore};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Default cap on embedded-data reads/writes (spec §4.3, §9 "64 KiB cap").
pub const DEFAULT_EMBEDDED_DATA_CAP: u32 = 64 * 1024;

/// Schema layered on an `OrderedStore`. One instance per server process;
/// shared (behind `Arc`) by every RPC handler thread.
pub struct MetaDB {
    store: Arc<dyn OrderedStore>,
    inode_counter: Mutex<i64>,
    embedded_data_cap: u32,
}

impl MetaDB {
    /// Opens the schema over `store`. `server_id` seeds the inode counter
    /// when no counter record exists yet; the seed-and-stride-by-N scheme
    /// is the one this workspace picked between the two that coexisted in
    /// the original implementation (spec §9 Open Questions) so that inode
    /// numbers are cluster-wide unique without any cross-server
    /// coordination.
    pub fn open(store: Arc<dyn OrderedStore>, server_id: i64) -> Result<Self, MetaError> {
        let counter = match store.get(&inode_counter_key())? {
            Some(bytes) => i64::from_le_bytes(bytes.try_into().map_err(|_| {
                MetaError::Corrupt("inode counter record is not 8 bytes".to_string())
            })?),
            None => server_id,
        };
        let db = MetaDB {
            store,
            inode_counter: Mutex::new(counter),
            embedded_data_cap: DEFAULT_EMBEDDED_DATA_CAP,
        };
        if db.store.get(&inode_counter_key())?.is_none() {
            db.persist_counter(counter)?;
        }
        Ok(db)
    }

    fn persist_counter(&self, value: i64) -> Result<(), MetaError> {
        self.store
            .put(&inode_counter_key(), &value.to_le_bytes())
            .map_err(MetaError::from)
    }

    /// Advances the counter by `n_servers` first, then returns the
    /// post-increment value, so no two servers with distinct seeds ever
    /// collide *and* inode 0 (the root directory) is never handed out to
    /// a new file or directory. Persistence happens before the value is
    /// handed back, per the spec's own ordering requirement.
    pub fn reserve_next_inode_no(&self, n_servers: i64) -> Result<i64, MetaError> {
        let mut counter = self.inode_counter.lock();
        let next = *counter + n_servers;
        self.persist_counter(next)?;
        *counter = next;
        Ok(next)
    }

    /// Idempotent-but-erroring: fails with `AlreadyExists` if `key` is
    /// already present.
    pub fn new_file(
        &self,
        key: Key,
        name: &str,
        mode: u32,
        uid: i32,
        gid: i32,
        now: i64,
    ) -> Result<(), MetaError> {
        if self.store.exists(&key)? {
            return Err(MetaError::AlreadyExists);
        }
        let dentry = Dentry::new_file(name, mode, uid, gid, now);
        self.store.put(&key, &dentry.encode())?;
        Ok(())
    }

    /// Analogous to `new_file`, for directories (spec §4.3).
    pub fn new_directory(
        &self,
        key: Key,
        name: &str,
        mode: u32,
        uid: i32,
        gid: i32,
        now: i64,
        inode: i64,
        zeroth_server: i16,
    ) -> Result<(), MetaError> {
        if self.store.exists(&key)? {
            return Err(MetaError::AlreadyExists);
        }
        let dentry = Dentry::new_directory(name, mode, uid, gid, now, inode, zeroth_server);
        self.store.put(&key, &dentry.encode())?;
        Ok(())
    }

    pub fn get_entry(&self, key: &Key) -> Result<Dentry, MetaError> {
        let bytes = self.store.get(key)?.ok_or(MetaError::NotFound)?;
        Dentry::decode(&bytes)
    }

    pub fn put_entry(&self, key: &Key, dentry: &Dentry) -> Result<(), MetaError> {
        self.store.put(key, &dentry.encode())?;
        Ok(())
    }

    /// Reads, applies `f`, writes back. The caller is expected to hold
    /// the directory lock (spec §4.4) around this; `MetaDB` itself has no
    /// notion of directories or locking.
    pub fn update_entry(
        &self,
        key: &Key,
        f: impl FnOnce(&mut Dentry),
    ) -> Result<Dentry, MetaError> {
        let mut dentry = self.get_entry(key)?;
        f(&mut dentry);
        self.put_entry(key, &dentry)?;
        Ok(dentry)
    }

    pub fn delete_entry(&self, key: &Key) -> Result<(), MetaError> {
        if !self.store.exists(key)? {
            return Err(MetaError::NotFound);
        }
        self.store.delete(key)?;
        Ok(())
    }

    /// `SetFileMode`/`PutEntryWithMode`: overwrites only the permission
    /// bits, preserving the file/dir type discriminator.
    pub fn set_file_mode(&self, key: &Key, perm: u32) -> Result<Dentry, MetaError> {
        self.update_entry(key, |d| d.set_mode_bits(perm))
    }

    pub fn get_mapping(&self, dir_id: i64) -> Result<DirectoryIndex, MetaError> {
        let bytes = self
            .store
            .get(&mapping_key(dir_id))?
            .ok_or(MetaError::MappingNotFound(dir_id))?;
        Ok(DirectoryIndex::decode(&bytes)?)
    }

    /// Writes a brand-new mapping (installed alongside `CreateZeroth`).
    pub fn insert_mapping(&self, di: &DirectoryIndex) -> Result<(), MetaError> {
        self.store.put(&mapping_key(di.dir_id()), &di.encode())?;
        Ok(())
    }

    /// Merges `incoming` into whatever mapping is on disk (or installs it
    /// fresh if none exists yet), per the DI's own merge-idempotence (P1).
    pub fn update_mapping(&self, incoming: &DirectoryIndex) -> Result<DirectoryIndex, MetaError> {
        let mut current = match self.get_mapping(incoming.dir_id()) {
            Ok(di) => di,
            Err(MetaError::MappingNotFound(_)) => incoming.clone(),
            Err(e) => return Err(e),
        };
        current.update(incoming);
        self.store.put(&mapping_key(current.dir_id()), &current.encode())?;
        Ok(current)
    }

    /// `Mkdir_Presplit`: installs every partition in `indices` in one
    /// merged write, backing the full-width DI push to every server.
    pub fn install_partitions(
        &self,
        dir_id: i64,
        zeroth_server: i16,
        indices: &[u16],
    ) -> Result<DirectoryIndex, MetaError> {
        let mut di = match self.get_mapping(dir_id) {
            Ok(di) => di,
            Err(MetaError::MappingNotFound(_)) => DirectoryIndex::new(dir_id, zeroth_server),
            Err(e) => return Err(e),
        };
        for &i in indices {
            di.set_bit(i);
        }
        self.store.put(&mapping_key(dir_id), &di.encode())?;
        Ok(di)
    }

    /// `ListEntries`/`Readdir`: every dentry in `(dir_id, part_id)` with
    /// hash `>= start_hash`, in ascending hash order (invariant P5).
    pub fn list_entries(
        &self,
        dir_id: i64,
        part_id: i16,
        start_hash: u64,
    ) -> Result<Vec<Dentry>, MetaError> {
        let (_, end) = partition_range(dir_id, part_id);
        let start = dentry_key(dir_id, part_id, start_hash);
        self.store
            .scan_range(start, end)?
            .into_iter()
            .map(|(_, value)| Dentry::decode(&value))
            .collect()
    }

    /// Reads the embedded-data byte range `[offset, offset+len)`,
    /// truncated to whatever is actually stored, respecting the
    /// per-system embedded-IO cap.
    pub fn fetch_data(&self, key: &Key, offset: u32, len: u32) -> Result<Vec<u8>, MetaError> {
        self.check_embedded_bounds(offset, len)?;
        let dentry = self.get_entry(key)?;
        let start = (offset as usize).min(dentry.data.len());
        let end = ((offset + len) as usize).min(dentry.data.len());
        Ok(dentry.data[start..end].to_vec())
    }

    /// Patches the embedded-data byte range in place (copy-on-write at
    /// the value level: the whole value is rewritten, per spec §4.3).
    pub fn write_data(&self, key: &Key, offset: u32, bytes: &[u8]) -> Result<(), MetaError> {
        self.check_embedded_bounds(offset, bytes.len() as u32)?;
        self.update_entry(key, |d| {
            let end = offset as usize + bytes.len();
            if d.data.len() < end {
                d.data.resize(end, 0);
            }
            d.data[offset as usize..end].copy_from_slice(bytes);
            d.size = d.data.len() as i64;
            d.status_flags |= crate::dentry::STATUS_EMBEDDED_DATA;
        })?;
        Ok(())
    }

    fn check_embedded_bounds(&self, offset: u32, len: u32) -> Result<(), MetaError> {
        if offset.checked_add(len).unwrap_or(u32::MAX) > self.embedded_data_cap {
            return Err(MetaError::EmbeddedDataTooLarge {
                offset,
                len,
                max: self.embedded_data_cap,
            });
        }
        Ok(())
    }

    /// Delegates to the store's bulk-ingest (the destination side of a
    /// split, or a cold-start import of pre-existing sorted runs).
    pub fn bulk_insert(&self, min_seq: i64, max_seq: i64, sst_dir: &Path) -> Result<(), MetaError> {
        self.store.bulk_ingest(sst_dir, min_seq, max_seq)?;
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn OrderedStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use giga_store::LogStore;

    fn open_db(server_id: i64) -> (tempfile::TempDir, MetaDB) {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn OrderedStore> = Arc::new(LogStore::open(tmp.path()).unwrap());
        let db = MetaDB::open(store, server_id).unwrap();
        (tmp, db)
    }

    #[test]
    fn new_file_then_getattr_has_default_values() {
        let (_tmp, db) = open_db(0);
        let key = dentry_key(1, 0, 7);
        db.new_file(key, "f", 0o644, 0, 0, 100).unwrap();
        let d = db.get_entry(&key).unwrap();
        assert_eq!(d.mode & 0o777, 0o644); // S1
        assert_eq!(d.size, 0);
        assert!(!d.is_dir());
    }

    #[test]
    fn new_file_twice_is_already_exists() {
        let (_tmp, db) = open_db(0);
        let key = dentry_key(1, 0, 7);
        db.new_file(key, "f", 0o644, 0, 0, 0).unwrap();
        assert!(matches!(
            db.new_file(key, "f", 0o644, 0, 0, 0),
            Err(MetaError::AlreadyExists)
        ));
    }

    #[test]
    fn reserve_next_inode_no_strides_by_server_count() {
        let (_tmp, db) = open_db(2);
        assert_eq!(db.reserve_next_inode_no(4).unwrap(), 6);
        assert_eq!(db.reserve_next_inode_no(4).unwrap(), 10);
        assert_eq!(db.reserve_next_inode_no(4).unwrap(), 14);
    }

    #[test]
    fn reserve_next_inode_no_never_hands_out_root_inode_zero() {
        let (_tmp, db) = open_db(0);
        assert_ne!(db.reserve_next_inode_no(1).unwrap(), 0);
    }

    #[test]
    fn reopen_preserves_inode_counter() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store: Arc<dyn OrderedStore> = Arc::new(LogStore::open(tmp.path()).unwrap());
            let db = MetaDB::open(store, 1).unwrap();
            db.reserve_next_inode_no(4).unwrap();
            db.reserve_next_inode_no(4).unwrap();
        }
        let store: Arc<dyn OrderedStore> = Arc::new(LogStore::open(tmp.path()).unwrap());
        let db = MetaDB::open(store, 1).unwrap();
        assert_eq!(db.reserve_next_inode_no(4).unwrap(), 13); // S6
    }

    #[test]
    fn list_entries_is_hash_ordered_within_partition() {
        let (_tmp, db) = open_db(0);
        for (hash, name) in [(30u64, "c"), (10, "a"), (20, "b")] {
            db.new_file(dentry_key(5, 0, hash), name, 0o644, 0, 0, 0)
                .unwrap();
        }
        let names: Vec<String> = db
            .list_entries(5, 0, 0)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]); // P5
    }

    #[test]
    fn write_then_fetch_embedded_data() {
        let (_tmp, db) = open_db(0);
        let key = dentry_key(1, 0, 1);
        db.new_file(key, "f", 0o644, 0, 0, 0).unwrap();
        db.write_data(&key, 0, b"hello").unwrap();
        assert_eq!(db.fetch_data(&key, 0, 5).unwrap(), b"hello");
        assert_eq!(db.fetch_data(&key, 1, 3).unwrap(), b"ell");
    }

    #[test]
    fn embedded_write_beyond_cap_is_rejected() {
        let (_tmp, db) = open_db(0);
        let key = dentry_key(1, 0, 1);
        db.new_file(key, "f", 0o644, 0, 0, 0).unwrap();
        let err = db.write_data(&key, DEFAULT_EMBEDDED_DATA_CAP, b"x").unwrap_err();
        assert!(matches!(err, MetaError::EmbeddedDataTooLarge { .. }));
    }

    #[test]
    fn update_mapping_merges_idempotently() {
        let (_tmp, db) = open_db(0);
        let mut di = DirectoryIndex::new(9, 0);
        di.set_bit(1);
        db.insert_mapping(&di).unwrap();

        let mut delta = DirectoryIndex::new(9, 0);
        delta.set_bit(3);
        let once = db.update_mapping(&delta).unwrap();
        let twice = db.update_mapping(&delta).unwrap();
        assert_eq!(once, twice); // P1
        assert!(twice.bit_is_set(1) && twice.bit_is_set(3));
    }
}
