//! `ServerCore`: the shared state every RPC handler method operates on,
//! and the common preamble spec.md §4.6 describes for every handler:
//! fetch the directory guard, acquire the lock, route on the current DI,
//! execute inside the lock.

use crate::error::HandlerError;
use crate::locktable::{grant_read_lease, now_micros, with_write_lease, DirGuard, DirLockTable};
use crate::split_coordinator::SplitCoordinator;
use giga_index::{hash::hash_name, DirectoryIndex};
use giga_meta::MetaDB;
use giga_rpc::conn::ConnectionManager;
use giga_rpc::DEFAULT_MAX_PART_SIZE;
use std::sync::Arc;

/// The outcome of routing a name-keyed operation under its directory's
/// lock: either it ran on this server, or the DI says someone else owns
/// the partition and the caller should retry there.
pub enum Routed<T> {
    Ok(T),
    Redirect(Vec<u8>),
}

pub struct ServerCore {
    pub server_id: i32,
    pub n_servers: i64,
    pub meta: Arc<MetaDB>,
    pub locks: Arc<DirLockTable>,
    pub conn: Arc<ConnectionManager>,
    pub split: Arc<SplitCoordinator>,
    pub max_part_size: u64,
}

impl ServerCore {
    pub fn di_for(&self, dir_id: i64) -> DirectoryIndex {
        self.meta
            .get_mapping(dir_id)
            .unwrap_or_else(|_| DirectoryIndex::new(dir_id, self.server_id as i16))
    }

    /// The shared preamble: acquire `dir_id`'s lock, compute which
    /// partition `name` hashes into under the current DI, and either run
    /// `op` (this server owns that partition) or hand back a redirect
    /// carrying the DI so the client can retry elsewhere.
    pub fn route<T>(
        &self,
        dir_id: i64,
        name: &str,
        op: impl FnOnce(&mut DirGuard<'_>, u16) -> Result<T, HandlerError>,
    ) -> Result<Routed<T>, HandlerError> {
        self.locks.with_dir(dir_id, || self.di_for(dir_id), |guard| {
            let idx = guard.di.get_index(name);
            let owner = guard.di.server_for_index(idx, self.n_servers);
            if owner as i32 != self.server_id {
                return Ok(Routed::Redirect(guard.di.encode()));
            }
            op(guard, idx).map(Routed::Ok)
        })
    }

    /// Like `route`, but for requests that already name a partition index
    /// directly (`Readdir`) instead of a child name to hash.
    pub fn route_partition<T>(
        &self,
        dir_id: i64,
        partition_index: u16,
        op: impl FnOnce(&mut DirGuard<'_>) -> Result<T, HandlerError>,
    ) -> Result<Routed<T>, HandlerError> {
        self.locks.with_dir(dir_id, || self.di_for(dir_id), |guard| {
            let owner = guard.di.server_for_index(partition_index, self.n_servers);
            if owner as i32 != self.server_id {
                return Ok(Routed::Redirect(guard.di.encode()));
            }
            op(guard).map(Routed::Ok)
        })
    }

    /// Bumps the partition counter for `idx` and, if it now exceeds
    /// `max_part_size` and the partition is still splittable and no split
    /// is already running, dispatches a split. Called from inside the
    /// same lock acquisition `route` used, per spec.md §4.4.
    pub fn bump_and_maybe_split(&self, guard: &mut DirGuard<'_>, dir_id: i64, idx: u16) {
        let count = guard.partition_size_map.entry(idx).or_insert(0);
        *count += 1;
        let over_threshold = *count > self.max_part_size;
        if over_threshold
            && !guard.disable_splitting
            && guard.di.is_splittable(idx, self.split.max_virtual_servers())
        {
            self.split.spawn(dir_id, idx);
        }
    }

    /// `Access`/`Renew`: takes a read lease on `(dir_id, name)` and
    /// returns the fresh lookup info. Raises `DirectoryExpected` if the
    /// target is not a directory.
    pub fn lookup_and_lease(&self, dir_id: i64, name: &str) -> Result<Routed<(giga_meta::Dentry, i64)>, HandlerError> {
        self.route(dir_id, name, |guard, idx| {
            let hash = hash_name(name);
            let key = giga_meta::dentry_key(dir_id, idx as i16, hash);
            let dentry = self.meta.get_entry(&key)?;
            if !dentry.is_dir() {
                return Err(HandlerError::DirectoryExpected);
            }
            let due = grant_read_lease(guard, name);
            Ok((dentry, due))
        })
    }

    /// `Chmod`/`Chown`: if the target is a directory, takes a write lease
    /// (blocking until any live read lease drains) before persisting;
    /// otherwise persists directly. Returns whether the target was a
    /// directory.
    pub fn mutate_attrs(
        &self,
        dir_id: i64,
        name: &str,
        f: impl FnOnce(&mut giga_meta::Dentry),
    ) -> Result<Routed<bool>, HandlerError> {
        // First pass under the ordinary lock: find out if this is even
        // our partition, and whether the target is a directory.
        let routed = self.route(dir_id, name, |_guard, idx| {
            let hash = hash_name(name);
            let key = giga_meta::dentry_key(dir_id, idx as i16, hash);
            let dentry = self.meta.get_entry(&key)?;
            Ok((key, dentry.is_dir()))
        })?;
        let (key, is_dir) = match routed {
            Routed::Redirect(dmap) => return Ok(Routed::Redirect(dmap)),
            Routed::Ok(v) => v,
        };

        if !is_dir {
            self.meta.update_entry(&key, f)?;
            return Ok(Routed::Ok(false));
        }

        let di_for = || self.di_for(dir_id);
        with_write_lease(&self.locks, dir_id, name, di_for, |_guard| {
            self.meta.update_entry(&key, f)
        })?;
        Ok(Routed::Ok(true))
    }

    pub fn now(&self) -> i64 {
        now_micros() / 1_000_000
    }
}

impl Default for ServerCoreBuilder {
    fn default() -> Self {
        ServerCoreBuilder {
            max_part_size: DEFAULT_MAX_PART_SIZE,
        }
    }
}

/// Only the one knob spec.md §6 names (`FS_DIR_SPLIT_THR`) needs a
/// builder; everything else is a plain constructor argument.
pub struct ServerCoreBuilder {
    max_part_size: u64,
}

impl ServerCoreBuilder {
    pub fn max_part_size(mut self, v: u64) -> Self {
        self.max_part_size = v;
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        self,
        server_id: i32,
        n_servers: i64,
        meta: Arc<MetaDB>,
        locks: Arc<DirLockTable>,
        conn: Arc<ConnectionManager>,
        split: Arc<SplitCoordinator>,
    ) -> ServerCore {
        ServerCore {
            server_id,
            n_servers,
            meta,
            locks,
            conn,
            split,
            max_part_size: self.max_part_size,
        }
    }
}
