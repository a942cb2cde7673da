//! `Client`: path resolution, the lookup and index caches, buffered
//! mknod, and the redirect-retry loop that backs every routed RPC
//! (spec.md §4.7).

use crate::conn_context::ConnContext;
use crate::error::{translate_status, ClientError};
use crate::index_cache::IndexCache;
use crate::lookup_cache::{LookupCache, LookupCacheEntry};
use crate::path::{split_path, PathResolution, Resolved, ResolvedDir};
use giga_index::DirectoryIndex;
use giga_rpc::conn::ReconnectPolicy;
use giga_rpc::membership::Membership;
use giga_rpc::pb::{self, ReadBitmapRequest};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;

/// Tunables spec.md §6 names for the client side of the cluster.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub dmap_cache_size: usize,
    pub dent_cache_size: usize,
    pub mknod_bufsize: usize,
    /// Selects `ConnContext::ThreadLocal` instead of `ConnContext::Shared`
    /// (spec.md §9's "thread-local client handles" note).
    pub thread_local_conn: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            dmap_cache_size: giga_rpc::config::DEFAULT_DMAP_CACHE_SIZE,
            dent_cache_size: giga_rpc::config::DEFAULT_DENT_CACHE_SIZE,
            mknod_bufsize: giga_rpc::DEFAULT_MKNOD_BUFSIZE,
            thread_local_conn: false,
        }
    }
}

enum RedirectOr<T> {
    Ok(T),
    Redirect(Vec<u8>),
}

/// Every routed RPC's response is a `oneof { ok, redirect }`
/// (spec.md §9's redesign of `ServerRedirectionException` into response
/// data); this trait lets `Client::call_with_redirect` stay generic
/// across the otherwise-unrelated `prost`-generated enum types.
trait RedirectOneof {
    type Ok;
    fn into_redirect_or(self) -> RedirectOr<Self::Ok>;
}

macro_rules! impl_redirect_oneof {
    ($ty:path, $ok_variant:ident, $ok_ty:ty) => {
        impl RedirectOneof for $ty {
            type Ok = $ok_ty;
            fn into_redirect_or(self) -> RedirectOr<$ok_ty> {
                match self {
                    Self::$ok_variant(v) => RedirectOr::Ok(v),
                    Self::Redirect(r) => RedirectOr::Redirect(r.dmap_data),
                }
            }
        }
    };
}

impl_redirect_oneof!(pb::mknod_response::Result, Ok, bool);
impl_redirect_oneof!(pb::mkdir_response::Result, OkInode, i64);
impl_redirect_oneof!(pb::mkdir_presplit_response::Result, OkInode, i64);
impl_redirect_oneof!(pb::chmod_response::Result, OkWasDir, bool);
impl_redirect_oneof!(pb::chown_response::Result, OkWasDir, bool);
impl_redirect_oneof!(pb::access_response::Result, Ok, pb::LookupInfo);
impl_redirect_oneof!(pb::renew_response::Result, Ok, pb::LookupInfo);
impl_redirect_oneof!(pb::getattr_response::Result, Ok, pb::StatInfo);
impl_redirect_oneof!(pb::fetch_data_response::Result, Ok, pb::FetchDataOk);
impl_redirect_oneof!(pb::write_data_response::Result, Ok, bool);
impl_redirect_oneof!(pb::readdir_response::Result, Ok, pb::ReaddirOk);

/// Per-directory, per-destination-server buffer of pending creates
/// (spec.md §4.7 "Client-buffered mknod"): `(name, perm)` pairs waiting
/// for a flush.
type MknodBuffers = HashMap<i64, HashMap<i32, Vec<(String, u32)>>>;

pub struct Client {
    n_servers: i64,
    conn_ctx: ConnContext,
    lookup_cache: LookupCache,
    index_cache: IndexCache,
    mknod_buffers: Mutex<MknodBuffers>,
    mknod_bufsize: usize,
}

impl Client {
    pub fn new(membership: Membership, policy: ReconnectPolicy, opts: ClientOptions) -> Self {
        let n_servers = membership.n_servers();
        let conn_ctx = if opts.thread_local_conn {
            ConnContext::thread_local(membership, policy)
        } else {
            ConnContext::shared(membership, policy)
        };
        Client {
            n_servers,
            conn_ctx,
            lookup_cache: LookupCache::new(opts.dent_cache_size),
            index_cache: IndexCache::new(opts.dmap_cache_size),
            mknod_buffers: Mutex::new(HashMap::new()),
            mknod_bufsize: opts.mknod_bufsize,
        }
    }

    fn route_by_name(&self, di: &DirectoryIndex, name: &str) -> i32 {
        di.server_for_index(di.get_index(name), self.n_servers) as i32
    }

    fn route_by_partition(&self, di: &DirectoryIndex, idx: u16) -> i32 {
        di.server_for_index(idx, self.n_servers) as i32
    }

    /// The index cache's `FetchIndex(dir_id, zeroth_server)` (spec.md
    /// §4.7): returns the cached DI on hit, else reads it fresh from
    /// `zeroth_server` and installs it.
    async fn di_for(&self, dir_id: i64, zeroth_server: i16) -> Result<DirectoryIndex, ClientError> {
        if let Some(di) = self.index_cache.get(dir_id) {
            return Ok(di);
        }
        let conn = self.conn_ctx.conn();
        let server = zeroth_server as i32;
        let mut client = conn.client(server).await?;
        let resp = client
            .read_bitmap(ReadBitmapRequest { dir_id })
            .await
            .map_err(|s| translate_status(server, s))?;
        let di = DirectoryIndex::decode(&resp.into_inner().dmap)?;
        self.index_cache.insert(di.clone());
        Ok(di)
    }

    /// The shared retry loop: fetch (or reuse the cached) DI, route the
    /// call, and on a `Redirect` response merge the DI it carries and
    /// try again, up to `kNumRedirect` attempts (spec.md §4.5/§9).
    async fn call_with_redirect<R, F, Fut>(
        &self,
        dir_id: i64,
        zeroth_server: i16,
        route: impl Fn(&DirectoryIndex) -> i32,
        make_call: F,
    ) -> Result<R::Ok, ClientError>
    where
        R: RedirectOneof,
        F: Fn(i32) -> Fut,
        Fut: Future<Output = Result<R, ClientError>>,
    {
        let mut di = self.di_for(dir_id, zeroth_server).await?;
        for _ in 0..giga_rpc::NUM_REDIRECT {
            let server = route(&di);
            match make_call(server).await?.into_redirect_or() {
                RedirectOr::Ok(v) => return Ok(v),
                RedirectOr::Redirect(dmap) => {
                    let incoming = DirectoryIndex::decode(&dmap)?;
                    di = self.index_cache.merge(&incoming);
                }
            }
        }
        Err(ClientError::RedirectsExhausted(giga_rpc::NUM_REDIRECT))
    }

    pub async fn access(
        &self,
        dir_id: i64,
        zeroth_server: i16,
        name: &str,
    ) -> Result<pb::LookupInfo, ClientError> {
        self.call_with_redirect::<pb::access_response::Result, _, _>(
            dir_id,
            zeroth_server,
            |di| self.route_by_name(di, name),
            |server| {
                let conn = self.conn_ctx.conn();
                let name = name.to_string();
                async move {
                    let mut client = conn.client(server).await?;
                    let resp = client
                        .access(pb::AccessRequest {
                            oid: Some(pb::Oid { dir_id, path_depth: 0, name }),
                        })
                        .await
                        .map_err(|s| translate_status(server, s))?;
                    resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                }
            },
        )
        .await
    }

    pub async fn renew(
        &self,
        dir_id: i64,
        zeroth_server: i16,
        name: &str,
    ) -> Result<pb::LookupInfo, ClientError> {
        self.call_with_redirect::<pb::renew_response::Result, _, _>(
            dir_id,
            zeroth_server,
            |di| self.route_by_name(di, name),
            |server| {
                let conn = self.conn_ctx.conn();
                let name = name.to_string();
                async move {
                    let mut client = conn.client(server).await?;
                    let resp = client
                        .renew(pb::RenewRequest {
                            oid: Some(pb::Oid { dir_id, path_depth: 0, name }),
                        })
                        .await
                        .map_err(|s| translate_status(server, s))?;
                    resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                }
            },
        )
        .await
    }

    fn cache_entry(info: &pb::LookupInfo) -> LookupCacheEntry {
        LookupCacheEntry {
            inode: info.inode,
            uid: info.uid,
            gid: info.gid,
            perm: info.perm,
            zeroth_server: info.zeroth_server as i16,
            lease_due: info.lease_due_micros,
        }
    }

    async fn lookup_component(&self, parent: ResolvedDir, name: &str) -> Result<ResolvedDir, ClientError> {
        if let Some(cached) = self.lookup_cache.get(parent.inode, name) {
            if cached.is_fresh() {
                return Ok(ResolvedDir {
                    inode: cached.inode,
                    zeroth_server: cached.zeroth_server,
                });
            }
            let info = self.renew(parent.inode, parent.zeroth_server, name).await?;
            self.lookup_cache.insert(parent.inode, name, Self::cache_entry(&info));
            return Ok(ResolvedDir {
                inode: info.inode,
                zeroth_server: info.zeroth_server as i16,
            });
        }
        let info = self.access(parent.inode, parent.zeroth_server, name).await?;
        self.lookup_cache.insert(parent.inode, name, Self::cache_entry(&info));
        Ok(ResolvedDir {
            inode: info.inode,
            zeroth_server: info.zeroth_server as i16,
        })
    }

    /// Walks every intermediate path component (spec.md §4.7), leaving
    /// the leaf unresolved: the caller supplies the operation that turns
    /// `(parent, leaf)` into an `Oid`.
    pub async fn resolve(&self, path: &str) -> Result<Resolved, ClientError> {
        let components = match split_path(path)? {
            None => return Ok(Resolved::Root),
            Some(c) => c,
        };
        let mut current = ResolvedDir::ROOT;
        let (intermediates, leaf) = components.split_at(components.len() - 1);
        for name in intermediates {
            current = self.lookup_component(current, name).await?;
        }
        Ok(Resolved::Child(PathResolution {
            parent: current,
            leaf: leaf[0].to_string(),
        }))
    }

    pub async fn mknod(&self, dir_id: i64, zeroth_server: i16, name: &str, perm: u32) -> Result<(), ClientError> {
        self.call_with_redirect::<pb::mknod_response::Result, _, _>(
            dir_id,
            zeroth_server,
            |di| self.route_by_name(di, name),
            |server| {
                let conn = self.conn_ctx.conn();
                let name = name.to_string();
                async move {
                    let mut client = conn.client(server).await?;
                    let resp = client
                        .mknod(pb::MknodRequest {
                            oid: Some(pb::Oid { dir_id, path_depth: 0, name }),
                            perm,
                        })
                        .await
                        .map_err(|s| translate_status(server, s))?;
                    resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                }
            },
        )
        .await
        .map(|_ok| ())
    }

    /// Adds `(name, perm)` to the per-destination buffer for `dir_id`,
    /// flushing that bucket immediately if it has reached
    /// `FLAGS_mknod_bufsize` (spec.md §4.7).
    pub async fn mknod_buffered(
        &self,
        dir_id: i64,
        zeroth_server: i16,
        name: &str,
        perm: u32,
    ) -> Result<(), ClientError> {
        let di = self.di_for(dir_id, zeroth_server).await?;
        let server = self.route_by_name(&di, name);
        let should_flush = {
            let mut buffers = self.mknod_buffers.lock();
            let bucket = buffers.entry(dir_id).or_default().entry(server).or_default();
            bucket.push((name.to_string(), perm));
            bucket.len() >= self.mknod_bufsize
        };
        if should_flush {
            self.flush_mknod_bucket(dir_id, server).await?;
        }
        Ok(())
    }

    /// Flushes every buffered bucket for `dir_id`, each becoming one
    /// `Mknod_Bulk` RPC (spec.md §4.7).
    pub async fn flush_mknod(&self, dir_id: i64) -> Result<(), ClientError> {
        let servers: Vec<i32> = {
            let buffers = self.mknod_buffers.lock();
            buffers.get(&dir_id).map(|m| m.keys().copied().collect()).unwrap_or_default()
        };
        for server in servers {
            self.flush_mknod_bucket(dir_id, server).await?;
        }
        Ok(())
    }

    async fn flush_mknod_bucket(&self, dir_id: i64, server: i32) -> Result<(), ClientError> {
        let batch = {
            let mut buffers = self.mknod_buffers.lock();
            buffers.get_mut(&dir_id).and_then(|m| m.remove(&server))
        };
        let Some(batch) = batch else { return Ok(()) };
        if batch.is_empty() {
            return Ok(());
        }
        // `MknodBulkRequest` carries one `perm` for the whole batch; a
        // buffer only ever accumulates the mode the caller passed at
        // enqueue time, so the first entry's mode stands for all of them
        // (see DESIGN.md).
        let perm = batch[0].1;
        let oids = batch
            .into_iter()
            .map(|(name, _)| pb::Oid { dir_id, path_depth: 0, name })
            .collect();
        let conn = self.conn_ctx.conn();
        let mut client = conn.client(server).await?;
        let resp = client
            .mknod_bulk(pb::MknodBulkRequest { oids, perm })
            .await
            .map_err(|s| translate_status(server, s))?
            .into_inner();
        match resp.result {
            Some(pb::mknod_bulk_response::Result::Ok(ok)) => {
                for outcome in ok.outcomes {
                    if !outcome.ok {
                        log::warn!("buffered mknod of {:?} under dir {dir_id} failed: {}", outcome.name, outcome.error);
                    }
                }
                Ok(())
            }
            Some(pb::mknod_bulk_response::Result::Redirect(_)) => {
                // The DI moved between buffering and flushing; the spec
                // does not describe re-bucketing a partially-sent batch,
                // so this surfaces as an ordinary redirect exhaustion
                // for the caller to retry at a higher level.
                Err(ClientError::RedirectsExhausted(1))
            }
            None => Err(ClientError::EmptyResponse),
        }
    }

    pub async fn mkdir(
        &self,
        dir_id: i64,
        zeroth_server: i16,
        name: &str,
        perm: u32,
        hint_srv1: i32,
    ) -> Result<i64, ClientError> {
        self.call_with_redirect::<pb::mkdir_response::Result, _, _>(
            dir_id,
            zeroth_server,
            |di| self.route_by_name(di, name),
            |server| {
                let conn = self.conn_ctx.conn();
                let name = name.to_string();
                async move {
                    let mut client = conn.client(server).await?;
                    let resp = client
                        .mkdir(pb::MkdirRequest {
                            oid: Some(pb::Oid { dir_id, path_depth: 0, name }),
                            perm,
                            hint_srv1,
                            hint_srv2: -1,
                        })
                        .await
                        .map_err(|s| translate_status(server, s))?;
                    resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                }
            },
        )
        .await
    }

    pub async fn mkdir_presplit(
        &self,
        dir_id: i64,
        zeroth_server: i16,
        name: &str,
        perm: u32,
        hint_srv1: i32,
    ) -> Result<i64, ClientError> {
        self.call_with_redirect::<pb::mkdir_presplit_response::Result, _, _>(
            dir_id,
            zeroth_server,
            |di| self.route_by_name(di, name),
            |server| {
                let conn = self.conn_ctx.conn();
                let name = name.to_string();
                async move {
                    let mut client = conn.client(server).await?;
                    let resp = client
                        .mkdir_presplit(pb::MkdirPresplitRequest {
                            oid: Some(pb::Oid { dir_id, path_depth: 0, name }),
                            perm,
                            hint_srv1,
                            hint_srv2: -1,
                        })
                        .await
                        .map_err(|s| translate_status(server, s))?;
                    resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                }
            },
        )
        .await
    }

    pub async fn chmod(&self, dir_id: i64, zeroth_server: i16, name: &str, perm: u32) -> Result<bool, ClientError> {
        self.call_with_redirect::<pb::chmod_response::Result, _, _>(
            dir_id,
            zeroth_server,
            |di| self.route_by_name(di, name),
            |server| {
                let conn = self.conn_ctx.conn();
                let name = name.to_string();
                async move {
                    let mut client = conn.client(server).await?;
                    let resp = client
                        .chmod(pb::ChmodRequest {
                            oid: Some(pb::Oid { dir_id, path_depth: 0, name }),
                            perm,
                        })
                        .await
                        .map_err(|s| translate_status(server, s))?;
                    resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                }
            },
        )
        .await
    }

    pub async fn chown(
        &self,
        dir_id: i64,
        zeroth_server: i16,
        name: &str,
        uid: i32,
        gid: i32,
    ) -> Result<bool, ClientError> {
        self.call_with_redirect::<pb::chown_response::Result, _, _>(
            dir_id,
            zeroth_server,
            |di| self.route_by_name(di, name),
            |server| {
                let conn = self.conn_ctx.conn();
                let name = name.to_string();
                async move {
                    let mut client = conn.client(server).await?;
                    let resp = client
                        .chown(pb::ChownRequest {
                            oid: Some(pb::Oid { dir_id, path_depth: 0, name }),
                            uid,
                            gid,
                        })
                        .await
                        .map_err(|s| translate_status(server, s))?;
                    resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                }
            },
        )
        .await
    }

    pub async fn getattr(&self, dir_id: i64, zeroth_server: i16, name: &str) -> Result<pb::StatInfo, ClientError> {
        self.call_with_redirect::<pb::getattr_response::Result, _, _>(
            dir_id,
            zeroth_server,
            |di| self.route_by_name(di, name),
            |server| {
                let conn = self.conn_ctx.conn();
                let name = name.to_string();
                async move {
                    let mut client = conn.client(server).await?;
                    let resp = client
                        .getattr(pb::GetattrRequest {
                            oid: Some(pb::Oid { dir_id, path_depth: 0, name }),
                        })
                        .await
                        .map_err(|s| translate_status(server, s))?;
                    resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                }
            },
        )
        .await
    }

    pub async fn fetch_data(
        &self,
        dir_id: i64,
        zeroth_server: i16,
        name: &str,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, ClientError> {
        let ok = self
            .call_with_redirect::<pb::fetch_data_response::Result, _, _>(
                dir_id,
                zeroth_server,
                |di| self.route_by_name(di, name),
                |server| {
                    let conn = self.conn_ctx.conn();
                    let name = name.to_string();
                    async move {
                        let mut client = conn.client(server).await?;
                        let resp = client
                            .fetch_data(pb::FetchDataRequest {
                                oid: Some(pb::Oid { dir_id, path_depth: 0, name }),
                                offset,
                                len,
                            })
                            .await
                            .map_err(|s| translate_status(server, s))?;
                        resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                    }
                },
            )
            .await?;
        Ok(ok.data)
    }

    pub async fn write_data(
        &self,
        dir_id: i64,
        zeroth_server: i16,
        name: &str,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<(), ClientError> {
        self.call_with_redirect::<pb::write_data_response::Result, _, _>(
            dir_id,
            zeroth_server,
            |di| self.route_by_name(di, name),
            |server| {
                let conn = self.conn_ctx.conn();
                let name = name.to_string();
                let data = data.clone();
                async move {
                    let mut client = conn.client(server).await?;
                    let resp = client
                        .write_data(pb::WriteDataRequest {
                            oid: Some(pb::Oid { dir_id, path_depth: 0, name }),
                            offset,
                            data,
                        })
                        .await
                        .map_err(|s| translate_status(server, s))?;
                    resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                }
            },
        )
        .await
        .map(|_ok| ())
    }

    /// `Unlink` carries no `Redirect` variant in the wire schema (spec.md
    /// §9 Open Questions leaves delete unspecified for a split-aware
    /// directory), so this calls the parent's zeroth server directly
    /// rather than through `call_with_redirect`; the server currently
    /// always answers `Unimplemented`.
    pub async fn unlink(&self, dir_id: i64, zeroth_server: i16, name: &str) -> Result<(), ClientError> {
        let conn = self.conn_ctx.conn();
        let mut client = conn.client(zeroth_server as i32).await?;
        client
            .unlink(pb::UnlinkRequest {
                oid: Some(pb::Oid { dir_id, path_depth: 0, name: name.to_string() }),
            })
            .await
            .map_err(|s| translate_status(zeroth_server as i32, s))?;
        Ok(())
    }

    /// Enumerates every partition of `dir_id`, following the DI each
    /// `Readdir` hands back to discover partitions created after the
    /// initial fetch (spec.md §4.6 `Readdir`'s "snapshot of the DI").
    pub async fn list_dir(&self, dir_id: i64, zeroth_server: i16) -> Result<Vec<String>, ClientError> {
        let mut entries = Vec::new();
        let mut visited: HashSet<u16> = HashSet::new();
        let mut di = self.di_for(dir_id, zeroth_server).await?;
        loop {
            let pending: Vec<u16> = di
                .present_partitions()
                .into_iter()
                .filter(|p| !visited.contains(p))
                .collect();
            if pending.is_empty() {
                break;
            }
            for idx in pending {
                visited.insert(idx);
                let ok = self
                    .call_with_redirect::<pb::readdir_response::Result, _, _>(
                        dir_id,
                        zeroth_server,
                        |d| self.route_by_partition(d, idx),
                        |server| {
                            let conn = self.conn_ctx.conn();
                            async move {
                                let mut client = conn.client(server).await?;
                                let resp = client
                                    .readdir(pb::ReaddirRequest { dir_id, partition_index: idx as i32 })
                                    .await
                                    .map_err(|s| translate_status(server, s))?;
                                resp.into_inner().result.ok_or(ClientError::EmptyResponse)
                            }
                        },
                    )
                    .await?;
                entries.extend(ok.entries);
                let incoming = DirectoryIndex::decode(&ok.dmap)?;
                di = self.index_cache.merge(&incoming);
            }
        }
        Ok(entries)
    }
}
