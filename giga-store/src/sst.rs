//! On-disk sorted-run files: the unit `bulk_ingest` consumes and the unit
//! the split extractor (`giga-meta`) produces.
//!
//! Format is intentionally simple: a flat sequence of
//! `[key: 16 bytes][value_len: u32 LE][value bytes]` records in strictly
//! ascending key order, no index block. Segment sizes in this system are
//! bounded by `FS_BULK_SIZE`/`FS_DIR_BULK_SIZE`, so a full linear scan on
//! load is cheap enough and keeps the format trivial to reason about.

use crate::error::StoreError;
use crate::key::Key;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Default name for a single sorted-run file inside a split/compaction
/// directory (`spec.md` §6: "a directory ... containing one or more
/// immutable sorted-run files plus a manifest").
pub const RUN_FILE_NAME: &str = "run-000.dat";

/// Builds one sorted-run file from entries presented in ascending key
/// order. Used by `BulkExtractor::extract` and by store compaction.
pub struct Builder {
    path: PathBuf,
    writer: BufWriter<File>,
    last_key: Option<Key>,
    count: u64,
}

impl Builder {
    pub fn create(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        let path = dir.join(RUN_FILE_NAME);
        let file = File::create(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(Builder {
            path,
            writer: BufWriter::new(file),
            last_key: None,
            count: 0,
        })
    }

    /// Appends one entry. Entries must arrive in strictly ascending key
    /// order; violating that is a programmer error in the caller (the
    /// extractor drives a prefix-ordered range scan), so this asserts
    /// rather than returning a recoverable error.
    pub fn append(&mut self, key: &Key, value: &[u8]) -> Result<(), StoreError> {
        if let Some(last) = self.last_key {
            assert!(
                key > &last,
                "sorted-run builder received out-of-order key"
            );
        }
        self.writer
            .write_all(key)
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.writer
            .write_u32::<LittleEndian>(value.len() as u32)
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.writer
            .write_all(value)
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.last_key = Some(*key);
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn finish(mut self) -> Result<PathBuf, StoreError> {
        self.writer
            .flush()
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(self.path)
    }
}

/// Reads every record out of every `.dat` file directly under `dir`,
/// merging them (they are expected to already be globally sorted, one
/// file per builder invocation) and validating strict ordering.
pub fn read_dir_sorted(dir: &Path) -> Result<Vec<(Key, Vec<u8>)>, StoreError> {
    let mut entries = Vec::new();
    if !dir.exists() {
        return Ok(entries);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| StoreError::io(dir, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "dat").unwrap_or(false))
        .collect();
    paths.sort();

    for path in paths {
        let file = File::open(&path).map_err(|e| StoreError::io(&path, e))?;
        let mut reader = BufReader::new(file);
        loop {
            let mut key = [0u8; 16];
            match reader.read_exact(&mut key) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(StoreError::io(&path, e)),
            }
            let vlen = reader
                .read_u32::<LittleEndian>()
                .map_err(|e| StoreError::io(&path, e))? as usize;
            let mut value = vec![0u8; vlen];
            reader
                .read_exact(&mut value)
                .map_err(|e| StoreError::io(&path, e))?;
            entries.push((key, value));
        }
    }

    for pair in entries.windows(2) {
        if pair[0].0 >= pair[1].0 {
            return Err(StoreError::UnsortedRun(dir.to_path_buf()));
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_then_reader_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = Builder::create(tmp.path()).unwrap();
        b.append(&[0u8; 16], b"first").unwrap();
        let mut k2 = [0u8; 16];
        k2[15] = 1;
        b.append(&k2, b"second").unwrap();
        b.finish().unwrap();

        let entries = read_dir_sorted(tmp.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, b"first");
        assert_eq!(entries[1].1, b"second");
    }

    #[test]
    #[should_panic]
    fn builder_rejects_out_of_order_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = Builder::create(tmp.path()).unwrap();
        let mut k2 = [0u8; 16];
        k2[15] = 1;
        b.append(&k2, b"second").unwrap();
        b.append(&[0u8; 16], b"first").unwrap();
    }
}
