//! The `GigaMeta` gRPC service implementation (spec.md §4.6): one method
//! per RPC in `proto/giga.proto`, each following the shared
//! route-then-execute preamble `ServerCore` provides.

use crate::core::{Routed, ServerCore};
use crate::error::HandlerError;
use giga_index::{hash::hash_name, DirectoryIndex};
use giga_meta::dentry_key;
use giga_rpc::pb::giga_meta_server::GigaMeta;
use giga_rpc::pb::*;
use tonic::{Request, Response, Status};

fn redirect(dmap: Vec<u8>) -> Redirect {
    Redirect { dmap_data: dmap }
}

fn require_oid(oid: Option<Oid>) -> Result<Oid, Status> {
    oid.ok_or_else(|| Status::invalid_argument("missing oid"))
}

#[tonic::async_trait]
impl GigaMeta for ServerCore {
    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse {}))
    }

    async fn flush_db(
        &self,
        _request: Request<FlushDbRequest>,
    ) -> Result<Response<FlushDbResponse>, Status> {
        // `LogStore::put`/`delete` flush their log file on every write, so
        // there is nothing left to do here beyond confirming liveness.
        Ok(Response::new(FlushDbResponse {}))
    }

    async fn mknod(&self, request: Request<MknodRequest>) -> Result<Response<MknodResponse>, Status> {
        let req = request.into_inner();
        let oid = require_oid(req.oid)?;
        let now = self.now();
        let routed = self.route(oid.dir_id, &oid.name, |guard, idx| {
            let key = dentry_key(oid.dir_id, idx as i16, hash_name(&oid.name));
            self.meta.new_file(key, &oid.name, req.perm, 0, 0, now)?;
            self.bump_and_maybe_split(guard, oid.dir_id, idx);
            Ok(())
        })?;
        let result = match routed {
            Routed::Ok(()) => mknod_response::Result::Ok(true),
            Routed::Redirect(dmap) => mknod_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(MknodResponse { result: Some(result) }))
    }

    async fn mknod_bulk(
        &self,
        request: Request<MknodBulkRequest>,
    ) -> Result<Response<MknodBulkResponse>, Status> {
        let req = request.into_inner();
        if req.oids.is_empty() {
            return Ok(Response::new(MknodBulkResponse {
                result: Some(mknod_bulk_response::Result::Ok(MknodBulkOk { outcomes: vec![] })),
            }));
        }
        // Every OID in one `Mknod_Bulk` call names the same directory
        // (spec.md §4.7: the client groups by destination before
        // flushing its mknod buffer), so one dir lock covers the batch.
        let dir_id = req.oids[0].dir_id;
        let now = self.now();
        let perm = req.perm;
        let routed = self.route(dir_id, &req.oids[0].name, |guard, _first_idx| {
            let mut outcomes = Vec::with_capacity(req.oids.len());
            for oid in &req.oids {
                let idx = guard.di.get_index(&oid.name);
                let owner = guard.di.server_for_index(idx, self.n_servers);
                if owner as i32 != self.server_id {
                    outcomes.push(MknodBulkOutcome {
                        name: oid.name.clone(),
                        ok: false,
                        error: format!("wrong server: owned by {owner}"),
                    });
                    continue;
                }
                let key = dentry_key(dir_id, idx as i16, hash_name(&oid.name));
                match self.meta.new_file(key, &oid.name, perm, 0, 0, now) {
                    Ok(()) => {
                        self.bump_and_maybe_split(guard, dir_id, idx);
                        outcomes.push(MknodBulkOutcome {
                            name: oid.name.clone(),
                            ok: true,
                            error: String::new(),
                        });
                    }
                    Err(e) => outcomes.push(MknodBulkOutcome {
                        name: oid.name.clone(),
                        ok: false,
                        error: e.to_string(),
                    }),
                }
            }
            Ok::<_, HandlerError>(outcomes)
        })?;
        let result = match routed {
            Routed::Ok(outcomes) => mknod_bulk_response::Result::Ok(MknodBulkOk { outcomes }),
            Routed::Redirect(dmap) => mknod_bulk_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(MknodBulkResponse { result: Some(result) }))
    }

    async fn mkdir(&self, request: Request<MkdirRequest>) -> Result<Response<MkdirResponse>, Status> {
        let req = request.into_inner();
        let resp = self.make_directory(req.oid, req.perm, req.hint_srv1, false).await?;
        let result = match resp {
            Routed::Ok(inode) => mkdir_response::Result::OkInode(inode),
            Routed::Redirect(dmap) => mkdir_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(MkdirResponse { result: Some(result) }))
    }

    async fn mkdir_presplit(
        &self,
        request: Request<MkdirPresplitRequest>,
    ) -> Result<Response<MkdirPresplitResponse>, Status> {
        let req = request.into_inner();
        // Unlike plain `Mkdir`, every partition 0..n_servers is installed
        // up front, one per server (spec.md §4.6); `hint_srv2` is the
        // teacher-era second hint field, unused once the full-width DI
        // push makes every server's ownership explicit.
        let resp = self.make_directory(req.oid, req.perm, req.hint_srv1, true).await?;
        let result = match resp {
            Routed::Ok(inode) => mkdir_presplit_response::Result::OkInode(inode),
            Routed::Redirect(dmap) => mkdir_presplit_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(MkdirPresplitResponse { result: Some(result) }))
    }

    async fn chmod(&self, request: Request<ChmodRequest>) -> Result<Response<ChmodResponse>, Status> {
        let req = request.into_inner();
        let oid = require_oid(req.oid)?;
        let perm = req.perm;
        let routed = self.mutate_attrs(oid.dir_id, &oid.name, move |d| d.set_mode_bits(perm))?;
        let result = match routed {
            Routed::Ok(was_dir) => chmod_response::Result::OkWasDir(was_dir),
            Routed::Redirect(dmap) => chmod_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(ChmodResponse { result: Some(result) }))
    }

    async fn chown(&self, request: Request<ChownRequest>) -> Result<Response<ChownResponse>, Status> {
        let req = request.into_inner();
        let oid = require_oid(req.oid)?;
        let (uid, gid) = (req.uid, req.gid);
        let routed = self.mutate_attrs(oid.dir_id, &oid.name, move |d| {
            d.uid = uid;
            d.gid = gid;
        })?;
        let result = match routed {
            Routed::Ok(was_dir) => chown_response::Result::OkWasDir(was_dir),
            Routed::Redirect(dmap) => chown_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(ChownResponse { result: Some(result) }))
    }

    async fn access(&self, request: Request<AccessRequest>) -> Result<Response<AccessResponse>, Status> {
        let oid = require_oid(request.into_inner().oid)?;
        let routed = self.lookup_and_lease(oid.dir_id, &oid.name)?;
        let result = match routed {
            Routed::Ok((dentry, due)) => access_response::Result::Ok(LookupInfo {
                inode: dentry.inode,
                uid: dentry.uid,
                gid: dentry.gid,
                perm: dentry.mode & 0o7777,
                zeroth_server: dentry.zeroth_server as i32,
                lease_due_micros: due,
            }),
            Routed::Redirect(dmap) => access_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(AccessResponse { result: Some(result) }))
    }

    async fn renew(&self, request: Request<RenewRequest>) -> Result<Response<RenewResponse>, Status> {
        let oid = require_oid(request.into_inner().oid)?;
        let routed = self.lookup_and_lease(oid.dir_id, &oid.name)?;
        let result = match routed {
            Routed::Ok((dentry, due)) => renew_response::Result::Ok(LookupInfo {
                inode: dentry.inode,
                uid: dentry.uid,
                gid: dentry.gid,
                perm: dentry.mode & 0o7777,
                zeroth_server: dentry.zeroth_server as i32,
                lease_due_micros: due,
            }),
            Routed::Redirect(dmap) => renew_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(RenewResponse { result: Some(result) }))
    }

    async fn getattr(&self, request: Request<GetattrRequest>) -> Result<Response<GetattrResponse>, Status> {
        let oid = require_oid(request.into_inner().oid)?;
        let routed = self.route(oid.dir_id, &oid.name, |_guard, idx| {
            let key = dentry_key(oid.dir_id, idx as i16, hash_name(&oid.name));
            Ok(self.meta.get_entry(&key)?)
        })?;
        let result = match routed {
            Routed::Ok(d) => getattr_response::Result::Ok(StatInfo {
                inode: d.inode,
                size: d.size,
                mode: d.mode,
                status_flags: d.status_flags as u32,
                zeroth_server: d.zeroth_server as i32,
                uid: d.uid,
                gid: d.gid,
                ctime: d.ctime,
                mtime: d.mtime,
            }),
            Routed::Redirect(dmap) => getattr_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(GetattrResponse { result: Some(result) }))
    }

    async fn fetch_data(
        &self,
        request: Request<FetchDataRequest>,
    ) -> Result<Response<FetchDataResponse>, Status> {
        let req = request.into_inner();
        let oid = require_oid(req.oid)?;
        let (offset, len) = (req.offset, req.len);
        let routed = self.route(oid.dir_id, &oid.name, |_guard, idx| {
            let key = dentry_key(oid.dir_id, idx as i16, hash_name(&oid.name));
            Ok(self.meta.fetch_data(&key, offset, len)?)
        })?;
        let result = match routed {
            Routed::Ok(data) => fetch_data_response::Result::Ok(FetchDataOk { data }),
            Routed::Redirect(dmap) => fetch_data_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(FetchDataResponse { result: Some(result) }))
    }

    async fn write_data(
        &self,
        request: Request<WriteDataRequest>,
    ) -> Result<Response<WriteDataResponse>, Status> {
        let req = request.into_inner();
        let oid = require_oid(req.oid)?;
        let (offset, data) = (req.offset, req.data);
        let routed = self.route(oid.dir_id, &oid.name, |_guard, idx| {
            let key = dentry_key(oid.dir_id, idx as i16, hash_name(&oid.name));
            self.meta.write_data(&key, offset, &data)?;
            Ok(())
        })?;
        let result = match routed {
            Routed::Ok(()) => write_data_response::Result::Ok(true),
            Routed::Redirect(dmap) => write_data_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(WriteDataResponse { result: Some(result) }))
    }

    async fn readdir(&self, request: Request<ReaddirRequest>) -> Result<Response<ReaddirResponse>, Status> {
        let req = request.into_inner();
        let partition_index = req.partition_index as u16;
        let routed = self.route_partition(req.dir_id, partition_index, |guard| {
            let entries = self
                .meta
                .list_entries(req.dir_id, partition_index as i16, 0)?
                .into_iter()
                .map(|d| d.name)
                .collect();
            Ok((entries, guard.di.encode()))
        })?;
        let result = match routed {
            Routed::Ok((entries, dmap)) => {
                readdir_response::Result::Ok(ReaddirOk { entries, dmap })
            }
            Routed::Redirect(dmap) => readdir_response::Result::Redirect(redirect(dmap)),
        };
        Ok(Response::new(ReaddirResponse { result: Some(result) }))
    }

    async fn read_bitmap(
        &self,
        request: Request<ReadBitmapRequest>,
    ) -> Result<Response<ReadBitmapResponse>, Status> {
        let dir_id = request.into_inner().dir_id;
        let dmap = self
            .locks
            .with_dir(dir_id, || self.di_for(dir_id), |guard| guard.di.encode());
        Ok(Response::new(ReadBitmapResponse { dmap }))
    }

    async fn update_bitmap(
        &self,
        request: Request<UpdateBitmapRequest>,
    ) -> Result<Response<UpdateBitmapResponse>, Status> {
        let req = request.into_inner();
        let incoming = DirectoryIndex::decode(&req.dmap).map_err(HandlerError::from)?;
        self.meta.update_mapping(&incoming).map_err(HandlerError::from)?;
        self.locks.with_dir(req.dir_id, || incoming.clone(), |guard| {
            guard.di.update(&incoming);
        });
        Ok(Response::new(UpdateBitmapResponse {}))
    }

    async fn create_zeroth(
        &self,
        request: Request<CreateZerothRequest>,
    ) -> Result<Response<CreateZerothResponse>, Status> {
        let req = request.into_inner();
        if req.zeroth_server != self.server_id {
            return Err(HandlerError::WrongServer {
                given: req.zeroth_server as i16,
                self_id: self.server_id,
            }
            .into());
        }
        let di = DirectoryIndex::new(req.dir_id, req.zeroth_server as i16);
        self.meta.insert_mapping(&di).map_err(HandlerError::from)?;
        self.locks.with_dir(req.dir_id, || di.clone(), |guard| guard.di.update(&di));
        Ok(Response::new(CreateZerothResponse {}))
    }

    async fn insert_split(
        &self,
        request: Request<InsertSplitRequest>,
    ) -> Result<Response<InsertSplitResponse>, Status> {
        let req = request.into_inner();
        let dmap = DirectoryIndex::decode(&req.dmap).map_err(HandlerError::from)?;
        self.meta
            .bulk_insert(req.min_seq, req.max_seq, std::path::Path::new(&req.sst_dir))
            .map_err(HandlerError::from)?;
        self.meta.update_mapping(&dmap).map_err(HandlerError::from)?;
        self.locks.with_dir(req.dir_id, || dmap.clone(), |guard| {
            guard.di.update(&dmap);
            guard
                .partition_size_map
                .insert(req.child_index as u16, req.num_entries as u64);
        });
        Ok(Response::new(InsertSplitResponse {}))
    }

    async fn rename(&self, _request: Request<RenameRequest>) -> Result<Response<RenameResponse>, Status> {
        Err(HandlerError::NotSupported("Rename").into())
    }

    async fn unlink(&self, _request: Request<UnlinkRequest>) -> Result<Response<UnlinkResponse>, Status> {
        Err(HandlerError::NotSupported("Unlink").into())
    }
}

impl ServerCore {
    /// Shared body of `Mkdir`/`Mkdir_Presplit`: allocate an inode for the
    /// new subdirectory, install its dentry in the parent partition, and
    /// seed the new directory's own `DirectoryIndex`.
    ///
    /// Plain `Mkdir` only brings partition 0 into existence and pushes it
    /// to the zeroth server via `CreateZeroth` (spec.md §4.6). `Mkdir_
    /// Presplit` instead brings every partition `0..n_servers` into
    /// existence at once — since `(i + zeroth) mod n_servers` is a
    /// bijection over that range, every server ends up owning exactly one
    /// of them — and pushes the resulting full-width DI to every other
    /// server with one `UpdateBitmap` RPC each.
    async fn make_directory(
        &self,
        oid: Option<Oid>,
        perm: u32,
        hint_zeroth: i32,
        presplit: bool,
    ) -> Result<Routed<i64>, Status> {
        let oid = require_oid(oid)?;
        let now = self.now();
        let zeroth_server = if hint_zeroth >= 0 {
            hint_zeroth
        } else {
            self.server_id
        };
        let new_inode = self.meta.reserve_next_inode_no(self.n_servers).map_err(HandlerError::from)?;

        let routed = self.route(oid.dir_id, &oid.name, |_guard, idx| {
            let key = dentry_key(oid.dir_id, idx as i16, hash_name(&oid.name));
            self.meta.new_directory(
                key,
                &oid.name,
                perm,
                0,
                0,
                now,
                new_inode,
                zeroth_server as i16,
            )?;
            Ok(())
        })?;
        match routed {
            Routed::Redirect(dmap) => return Ok(Routed::Redirect(dmap)),
            Routed::Ok(()) => {}
        }

        if presplit {
            let indices: Vec<u16> = (0..self.n_servers as u16).collect();
            let di = self
                .meta
                .install_partitions(new_inode, zeroth_server as i16, &indices)
                .map_err(HandlerError::from)?;
            self.locks
                .with_dir(new_inode, || di.clone(), |guard| guard.di.update(&di));
            for srv in 0..self.n_servers as i32 {
                if srv == self.server_id {
                    continue;
                }
                let mut client = self.conn.client(srv).await.map_err(|e| {
                    Status::unavailable(format!("could not reach server {srv}: {e}"))
                })?;
                client
                    .update_bitmap(UpdateBitmapRequest {
                        dir_id: new_inode,
                        dmap: di.encode(),
                    })
                    .await?;
            }
        } else {
            let di = self
                .meta
                .install_partitions(new_inode, zeroth_server as i16, &[0])
                .map_err(HandlerError::from)?;
            self.locks
                .with_dir(new_inode, || di.clone(), |guard| guard.di.update(&di));
            if zeroth_server != self.server_id {
                let mut client = self.conn.client(zeroth_server).await.map_err(|e| {
                    Status::unavailable(format!("could not reach zeroth server {zeroth_server}: {e}"))
                })?;
                client
                    .create_zeroth(CreateZerothRequest {
                        dir_id: new_inode,
                        zeroth_server,
                    })
                    .await?;
            }
        }
        Ok(Routed::Ok(new_inode))
    }
}
