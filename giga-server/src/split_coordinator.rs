//! The background split coordinator (spec.md §4.4): migrates half of a
//! hot partition to a new server (or a new partition on the same server)
//! by shipping a sorted table and bulk-loading it at the destination.

use crate::locktable::DirLockTable;
use giga_index::DirectoryIndex;
use giga_meta::{BulkExtractor, MetaDB};
use giga_rpc::conn::ConnectionManager;
use giga_rpc::pb::{giga_meta_client::GigaMetaClient, InsertSplitRequest, UpdateBitmapRequest};
use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::Channel;

pub struct SplitCoordinator {
    server_id: i32,
    n_servers: i64,
    meta: Arc<MetaDB>,
    locks: Arc<DirLockTable>,
    conn: Arc<ConnectionManager>,
    pool: rayon::ThreadPool,
    rt: tokio::runtime::Handle,
    split_dir: PathBuf,
}

impl SplitCoordinator {
    pub fn new(
        server_id: i32,
        n_servers: i64,
        meta: Arc<MetaDB>,
        locks: Arc<DirLockTable>,
        conn: Arc<ConnectionManager>,
        rt: tokio::runtime::Handle,
        split_dir: PathBuf,
    ) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .thread_name(|i| format!("giga-split-{i}"))
            .build()
            .expect("split thread pool");
        SplitCoordinator {
            server_id,
            n_servers,
            meta,
            locks,
            conn,
            pool,
            rt,
            split_dir,
        }
    }

    fn di_for(&self, dir_id: i64) -> DirectoryIndex {
        self.meta
            .get_mapping(dir_id)
            .unwrap_or_else(|_| DirectoryIndex::new(dir_id, self.server_id as i16))
    }

    /// Dispatches `SplitTask(dir_id, parent_index)` onto the split thread
    /// pool. Non-blocking: the caller (a handler holding the dir lock for
    /// the mknod/mkdir that triggered this) returns immediately.
    pub fn spawn(self: &Arc<Self>, dir_id: i64, parent_index: u16) {
        let this = self.clone();
        self.pool.spawn(move || {
            if let Err(e) = this.run_split(dir_id, parent_index) {
                log::error!("split of dir {dir_id} partition {parent_index} failed: {e}");
            }
        });
    }

    fn run_split(&self, dir_id: i64, parent_index: u16) -> Result<(), anyhow::Error> {
        // (1) acquire the dir lock; (2) compute the child index and its
        // owner; (3) disable splitting while we work.
        let plan = self
            .locks
            .with_dir(dir_id, || self.di_for(dir_id), |guard| {
                if guard.disable_splitting
                    || !guard.di.is_splittable(parent_index, self.max_virtual_servers())
                {
                    return None;
                }
                let child = guard.di.new_index_for_splitting(parent_index);
                let owner = guard.di.server_for_index(child, self.n_servers);
                guard.disable_splitting = true;
                Some((child, owner, guard.di.zeroth_server()))
            });
        let Some((child_index, owner, zeroth_server)) = plan else {
            return Ok(());
        };

        log::info!(
            "splitting dir {dir_id} partition {parent_index} -> {child_index} (owner server {owner})"
        );

        // (4) Extract, (5)-(7) install at destination.
        let result = self.extract_and_install(dir_id, parent_index, child_index, owner, zeroth_server);

        // (8) clear disable_splitting, whether or not the split succeeded.
        self.locks.with_dir(dir_id, || self.di_for(dir_id), |guard| {
            guard.disable_splitting = false;
            guard.notify_all();
        });

        let moved = result?;
        log::info!("split of dir {dir_id} partition {parent_index} committed, moved {moved} entries");

        // (9) push the merged DI to the zeroth server, if that isn't us.
        if zeroth_server as i32 != self.server_id {
            let di = self.di_for(dir_id);
            self.rt.block_on(self.push_bitmap(zeroth_server as i32, dir_id, &di))?;
        }
        Ok(())
    }

    pub fn max_virtual_servers(&self) -> u32 {
        // No explicit ceiling is given beyond MAX_RADIX in the spec; this
        // workspace bounds virtual partitions to a generous multiple of
        // the live cluster size rather than leaving splitting unbounded
        // (see DESIGN.md).
        (self.n_servers.max(1) as u32).saturating_mul(1024)
    }

    fn extract_and_install(
        &self,
        dir_id: i64,
        parent_index: u16,
        child_index: u16,
        owner: i16,
        zeroth_server: i16,
    ) -> Result<u64, anyhow::Error> {
        if owner as i32 == self.server_id {
            let moved = giga_meta::extract_local(&self.meta, dir_id, parent_index, child_index)?;
            let di_snapshot = self.locks.with_dir(dir_id, || self.di_for(dir_id), |guard| {
                guard.di.set_bit(child_index);
                guard.partition_size_map.insert(child_index, moved);
                // P4: count_before(p) == count_after(p) + count_after(c).
                let parent_count = guard.partition_size_map.entry(parent_index).or_insert(0);
                *parent_count = parent_count.saturating_sub(moved);
                guard.di.clone()
            });
            self.meta.insert_mapping(&di_snapshot)?;
            return Ok(moved);
        }

        let run_dir = self.split_dir.join(format!(
            "d{dir_id}-p{parent_index}p{child_index}-s{src}s{dst}",
            src = self.server_id,
            dst = owner
        ));
        let extractor = BulkExtractor::new(&self.meta, dir_id, parent_index, child_index);
        let extract_result = extractor.extract(&run_dir)?;

        let mut di_delta = DirectoryIndex::new(dir_id, zeroth_server);
        di_delta.set_bit(child_index);

        self.rt.block_on(self.send_insert_split(
            owner as i32,
            dir_id,
            parent_index,
            child_index,
            &run_dir,
            &di_delta,
            extract_result.min_seq,
            extract_result.max_seq,
            extract_result.num_entries,
        ))?;

        // Only delete the source's copy once the destination has
        // confirmed ingestion (invariant I4).
        extractor.commit(&extract_result)?;

        self.locks.with_dir(dir_id, || self.di_for(dir_id), |guard| {
            guard.di.set_bit(child_index);
            // P4: count_before(p) == count_after(p) + count_after(c). The
            // child's count lives on `owner`'s lock table, not ours.
            let parent_count = guard.partition_size_map.entry(parent_index).or_insert(0);
            *parent_count = parent_count.saturating_sub(extract_result.num_entries);
        });
        self.meta.update_mapping(&di_delta)?;

        Ok(extract_result.num_entries)
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_insert_split(
        &self,
        owner: i32,
        dir_id: i64,
        parent_index: u16,
        child_index: u16,
        run_dir: &std::path::Path,
        dmap: &DirectoryIndex,
        min_seq: i64,
        max_seq: i64,
        num_entries: u64,
    ) -> Result<(), anyhow::Error> {
        let mut client: GigaMetaClient<Channel> = self.conn.client(owner).await?;
        client
            .insert_split(InsertSplitRequest {
                dir_id,
                parent_index: parent_index as i32,
                child_index: child_index as i32,
                sst_dir: run_dir.to_string_lossy().to_string(),
                dmap: dmap.encode(),
                min_seq,
                max_seq,
                num_entries: num_entries as i64,
            })
            .await?;
        Ok(())
    }

    async fn push_bitmap(&self, zeroth: i32, dir_id: i64, di: &DirectoryIndex) -> Result<(), anyhow::Error> {
        let mut client: GigaMetaClient<Channel> = self.conn.client(zeroth).await?;
        client
            .update_bitmap(UpdateBitmapRequest {
                dir_id,
                dmap: di.encode(),
            })
            .await?;
        Ok(())
    }
}
