//! Per-directory lock table and the read/write lease table it carries
//! (spec.md §4.4, §5). All handler bodies run under the directory lock;
//! lease transitions happen inside that same critical section.

use giga_index::DirectoryIndex;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `spec.md` §5: the skew allowance a lease wait is bounded by.
pub const LEASE_EPSILON_MICROS: i64 = giga_rpc::LEASE_EPSILON_MICROS;
/// `spec.md` §4.4: the default read-lease renewal window.
pub const LEASE_WINDOW_MICROS: i64 = giga_rpc::LEASE_WINDOW_MICROS;

pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Free,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseRecord {
    pub state: LeaseState,
    pub lease_due: i64,
}

impl Default for LeaseRecord {
    fn default() -> Self {
        LeaseRecord {
            state: LeaseState::Free,
            lease_due: 0,
        }
    }
}

/// Mutable state protected by one directory's lock: the in-memory
/// `DirectoryIndex` (mirrors whatever `MetaDB` has persisted), the
/// partition size counters used to trigger splits, the `disable_splitting`
/// flag a split coordinator sets while it works, and the per-name lease
/// records.
pub struct DirLockState {
    pub di: DirectoryIndex,
    pub partition_size_map: HashMap<u16, u64>,
    pub disable_splitting: bool,
    pub leases: HashMap<String, LeaseRecord>,
}

struct DirLock {
    state: Mutex<DirLockState>,
    condvar: Condvar,
}

/// RAII handle pairing the acquired directory lock with its protected
/// state. Borrowed for the duration of one call to
/// `DirLockTable::with_dir`; that scoping is what makes the lock
/// provably released on every exit path, including early returns and
/// panics, without resorting to unsafe lifetime extension.
pub struct DirGuard<'a> {
    lock: &'a DirLock,
    guard: MutexGuard<'a, DirLockState>,
}

impl<'a> std::ops::Deref for DirGuard<'a> {
    type Target = DirLockState;
    fn deref(&self) -> &DirLockState {
        &self.guard
    }
}

impl<'a> std::ops::DerefMut for DirGuard<'a> {
    fn deref_mut(&mut self) -> &mut DirLockState {
        &mut self.guard
    }
}

impl<'a> DirGuard<'a> {
    /// Releases the lock and blocks on the directory's condition
    /// variable; reacquires before returning. Used by the split
    /// coordinator (waiting out writers) and would be used by any future
    /// writer-waits-for-splitter path.
    pub fn wait(&mut self) {
        self.lock.condvar.wait(&mut self.guard);
    }

    pub fn wait_timeout(&mut self, timeout: Duration) {
        self.lock.condvar.wait_for(&mut self.guard, timeout);
    }

    pub fn notify_all(&self) {
        self.lock.condvar.notify_all();
    }
}

/// Per-dir_id table of `DirLock`s. Directories stay in the table for the
/// life of the process once first touched — unlike the client-side index
/// cache, a server never needs to evict the directories it is
/// responsible for.
#[derive(Default)]
pub struct DirLockTable {
    locks: Mutex<HashMap<i64, Arc<DirLock>>>,
}

impl DirLockTable {
    pub fn new() -> Self {
        DirLockTable::default()
    }

    /// Acquires the lock for `dir_id` (creating its `DirectoryIndex` with
    /// `make_di` on first touch) and runs `f` with it held, releasing the
    /// lock as soon as `f` returns.
    pub fn with_dir<R>(
        &self,
        dir_id: i64,
        make_di: impl FnOnce() -> DirectoryIndex,
        f: impl FnOnce(&mut DirGuard<'_>) -> R,
    ) -> R {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(dir_id)
                .or_insert_with(|| {
                    Arc::new(DirLock {
                        state: Mutex::new(DirLockState {
                            di: make_di(),
                            partition_size_map: HashMap::new(),
                            disable_splitting: false,
                            leases: HashMap::new(),
                        }),
                        condvar: Condvar::new(),
                    })
                })
                .clone()
        };
        let guard = lock.state.lock();
        let mut dir_guard = DirGuard {
            lock: &lock,
            guard,
        };
        f(&mut dir_guard)
    }
}

/// Blocks until `name`'s read lease (if any) has drained past its
/// `lease_due + ε`, then invalidates it, per `spec.md` §4.4's `WriteLock`:
/// "waits for readers to drain ... sleeping, then reacquiring the dir
/// lock to retry." Runs the drain loop itself so `f` only ever sees the
/// lease already invalidated.
pub fn with_write_lease<R>(
    table: &DirLockTable,
    dir_id: i64,
    name: &str,
    make_di: impl Fn() -> DirectoryIndex,
    f: impl FnOnce(&mut DirGuard<'_>) -> R,
) -> R {
    loop {
        let wait_until = table.with_dir(dir_id, &make_di, |guard| {
            match guard.leases.get(name) {
                Some(record)
                    if record.state == LeaseState::Read
                        && now_micros() < record.lease_due + LEASE_EPSILON_MICROS =>
                {
                    Some(record.lease_due + LEASE_EPSILON_MICROS)
                }
                _ => None,
            }
        });
        match wait_until {
            Some(due) => {
                let now = now_micros();
                if due > now {
                    std::thread::sleep(Duration::from_micros((due - now) as u64));
                }
            }
            None => {
                return table.with_dir(dir_id, &make_di, |guard| {
                    guard.leases.insert(
                        name.to_string(),
                        LeaseRecord {
                            state: LeaseState::Free,
                            lease_due: 0,
                        },
                    );
                    f(guard)
                });
            }
        }
    }
}

/// Grants (or renews) a read lease on `name` and returns its new due
/// time, per `spec.md` §4.4's `ReadLock`: "successful reads bump
/// lease_due forward by a fixed lease window."
pub fn grant_read_lease(guard: &mut DirGuard<'_>, name: &str) -> i64 {
    let record = guard.leases.entry(name.to_string()).or_default();
    record.state = LeaseState::Read;
    record.lease_due = now_micros() + LEASE_WINDOW_MICROS;
    record.lease_due
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_serialises_partition_size_updates() {
        let table = Arc::new(DirLockTable::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    table.with_dir(1, || DirectoryIndex::new(1, 0), |guard| {
                        *guard.partition_size_map.entry(0).or_insert(0) += 1;
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        table.with_dir(1, || DirectoryIndex::new(1, 0), |guard| {
            assert_eq!(guard.partition_size_map[&0], 8000);
        });
    }

    #[test]
    fn read_lease_bumps_due_forward() {
        let table = DirLockTable::new();
        let due = table.with_dir(1, || DirectoryIndex::new(1, 0), |guard| {
            grant_read_lease(guard, "d")
        });
        assert!(due > now_micros());
    }

    #[test]
    fn write_lease_blocks_until_read_lease_drains() {
        let table = Arc::new(DirLockTable::new());
        let start = now_micros();
        let due = start + 50_000; // 50ms out, instead of the real 1s window
        table.with_dir(1, || DirectoryIndex::new(1, 0), |guard| {
            guard.leases.insert(
                "d".to_string(),
                LeaseRecord {
                    state: LeaseState::Read,
                    lease_due: due,
                },
            );
        });

        with_write_lease(&table, 1, "d", || DirectoryIndex::new(1, 0), |_guard| {});
        let elapsed = now_micros() - start;
        assert!(elapsed + 5_000 >= due - start); // blocked at least until lease_due (+ some slack)
    }
}
