//! A BitCask-family log-structured store: an append-only value log plus an
//! in-memory key index, with bulk-ingest of externally-built sorted runs
//! layered in as immutable segments. Grounded on the pack's own bitcask
//! storage-engine examples (simplified: single log file, no hint files,
//! full-segment loads rather than block indexes — the same simplifications
//! those examples make, for the same reason: the metadata this system
//! stores is small per key and per directory).

use crate::error::StoreError;
use crate::key::Key;
use crate::sst;
use crate::traits::OrderedStore;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

struct Segment {
    entries: Vec<(Key, Vec<u8>)>,
    min_seq: i64,
    max_seq: i64,
}

impl Segment {
    fn get(&self, key: &Key) -> Option<&Vec<u8>> {
        self.entries
            .binary_search_by_key(key, |(k, _)| *k)
            .ok()
            .map(|idx| &self.entries[idx].1)
    }
}

struct Inner {
    log_path: PathBuf,
    log_file: File,
    live: BTreeMap<Key, Option<Vec<u8>>>,
    segments: Vec<Segment>,
    next_seq: i64,
}

/// A single-process, single-writer log-structured store rooted at one
/// directory (`db_home` in the config file, spec §6).
pub struct LogStore {
    inner: RwLock<Inner>,
}

impl LogStore {
    pub fn open(db_home: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(db_home).map_err(|e| StoreError::io(db_home, e))?;
        let log_path = db_home.join("store.log");
        let mut log_file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| StoreError::io(&log_path, e))?;

        let live = replay_log(&mut log_file, &log_path)?;

        Ok(LogStore {
            inner: RwLock::new(Inner {
                log_path,
                log_file,
                live,
                segments: Vec::new(),
                next_seq: 0,
            }),
        })
    }

    /// Number of live (non-tombstoned) keys, used by tests and by startup
    /// logging to confirm recovery picked up the expected key count (S6).
    pub fn live_key_count(&self) -> usize {
        let inner = self.inner.read();
        inner.live.values().filter(|v| v.is_some()).count()
    }
}

fn replay_log(file: &mut File, path: &Path) -> Result<BTreeMap<Key, Option<Vec<u8>>>, StoreError> {
    file.seek(SeekFrom::Start(0)).map_err(|e| StoreError::io(path, e))?;
    let mut reader = BufReader::new(&mut *file);
    let mut live = BTreeMap::new();

    loop {
        let mut op_buf = [0u8; 1];
        match reader.read_exact(&mut op_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(StoreError::io(path, e)),
        }
        let mut key = [0u8; 16];
        reader.read_exact(&mut key).map_err(|e| StoreError::io(path, e))?;
        match op_buf[0] {
            OP_PUT => {
                let vlen = reader.read_u32::<LittleEndian>().map_err(|e| StoreError::io(path, e))? as usize;
                let mut value = vec![0u8; vlen];
                reader.read_exact(&mut value).map_err(|e| StoreError::io(path, e))?;
                live.insert(key, Some(value));
            }
            OP_DELETE => {
                live.insert(key, None);
            }
            other => {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("unknown log opcode {other}"),
                });
            }
        }
    }

    file.seek(SeekFrom::End(0)).map_err(|e| StoreError::io(path, e))?;
    log::info!("recovered {} live keys from {}", live.values().filter(|v| v.is_some()).count(), path.display());
    Ok(live)
}

impl OrderedStore for LogStore {
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.read();
        if let Some(v) = inner.live.get(key) {
            return Ok(v.clone());
        }
        for seg in inner.segments.iter().rev() {
            if let Some(v) = seg.get(key) {
                return Ok(Some(v.clone()));
            }
        }
        Ok(None)
    }

    fn put(&self, key: &Key, value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .log_file
            .write_all(&[OP_PUT])
            .map_err(|e| StoreError::io(&inner.log_path, e))?;
        inner
            .log_file
            .write_all(key)
            .map_err(|e| StoreError::io(&inner.log_path, e))?;
        inner
            .log_file
            .write_u32::<LittleEndian>(value.len() as u32)
            .map_err(|e| StoreError::io(&inner.log_path, e))?;
        inner
            .log_file
            .write_all(value)
            .map_err(|e| StoreError::io(&inner.log_path, e))?;
        inner.log_file.flush().map_err(|e| StoreError::io(&inner.log_path, e))?;
        inner.live.insert(*key, Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .log_file
            .write_all(&[OP_DELETE])
            .map_err(|e| StoreError::io(&inner.log_path, e))?;
        inner
            .log_file
            .write_all(key)
            .map_err(|e| StoreError::io(&inner.log_path, e))?;
        inner.log_file.flush().map_err(|e| StoreError::io(&inner.log_path, e))?;
        inner.live.insert(*key, None);
        Ok(())
    }

    fn scan_range(&self, start: Key, end: Key) -> Result<Vec<(Key, Vec<u8>)>, StoreError> {
        let inner = self.inner.read();
        let mut merged: BTreeMap<Key, Option<Vec<u8>>> = BTreeMap::new();

        for seg in inner.segments.iter() {
            for (k, v) in &seg.entries {
                if *k >= start && *k <= end {
                    merged.insert(*k, Some(v.clone()));
                }
            }
        }
        for (k, v) in inner.live.range(start..=end) {
            merged.insert(*k, v.clone());
        }

        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    fn bulk_ingest(&self, sst_dir: &Path, min_seq: i64, max_seq: i64) -> Result<(), StoreError> {
        let entries = sst::read_dir_sorted(sst_dir)?;
        let mut inner = self.inner.write();
        log::info!(
            "bulk-ingesting {} entries from {} (seq {}..={})",
            entries.len(),
            sst_dir.display(),
            min_seq,
            max_seq
        );
        inner.segments.push(Segment {
            entries,
            min_seq,
            max_seq,
        });
        inner.next_seq = inner.next_seq.max(max_seq + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sst::Builder;

    fn key(n: u8) -> Key {
        let mut k = [0u8; 16];
        k[15] = n;
        k
    }

    #[test]
    fn put_get_delete_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LogStore::open(tmp.path()).unwrap();
        store.put(&key(1), b"hello").unwrap();
        assert_eq!(store.get(&key(1)).unwrap(), Some(b"hello".to_vec()));
        store.delete(&key(1)).unwrap();
        assert_eq!(store.get(&key(1)).unwrap(), None);
    }

    #[test]
    fn restart_recovers_live_keys() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = LogStore::open(tmp.path()).unwrap();
            for n in 0..10u8 {
                store.put(&key(n), format!("v{n}").as_bytes()).unwrap();
            }
            store.delete(&key(3)).unwrap();
        }
        let reopened = LogStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.live_key_count(), 9);
        assert!(reopened.get(&key(3)).unwrap().is_none());
        assert_eq!(reopened.get(&key(7)).unwrap(), Some(b"v7".to_vec()));
    }

    #[test]
    fn bulk_ingest_makes_keys_visible_and_scan_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LogStore::open(tmp.path()).unwrap();

        let run_dir = tmp.path().join("incoming");
        let mut builder = Builder::create(&run_dir).unwrap();
        builder.append(&key(2), b"two").unwrap();
        builder.append(&key(4), b"four").unwrap();
        builder.finish().unwrap();

        store.bulk_ingest(&run_dir, 100, 101).unwrap();

        assert_eq!(store.get(&key(2)).unwrap(), Some(b"two".to_vec()));
        let scanned = store.scan_range(key(0), key(255)).unwrap();
        assert_eq!(scanned, vec![(key(2), b"two".to_vec()), (key(4), b"four".to_vec())]);
    }
}
