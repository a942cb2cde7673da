//! `gigad`: the GigaMeta server binary (spec.md §6). Reads the membership
//! and config files, opens the local metadata store, and serves the
//! `GigaMeta` RPC surface until killed.

use clap::Parser;
use giga_index::DirectoryIndex;
use giga_meta::{MetaDB, MetaError};
use giga_rpc::config::ServerConfig;
use giga_rpc::conn::{ConnectionManager, ReconnectPolicy};
use giga_rpc::membership::Membership;
use giga_rpc::pb::giga_meta_server::GigaMetaServer;
use giga_server::{DirLockTable, ServerCoreBuilder, SplitCoordinator};
use giga_store::{LogStore, OrderedStore};
use std::path::PathBuf;
use std::sync::Arc;

/// Command-line flags, one per file `gigad` needs to find itself and its
/// cluster (spec.md §6): a membership file (`server_id -> host:port`)
/// and a `key value` config file.
#[derive(Parser)]
#[command(name = "gigad", about = "GigaMeta scale-out metadata server")]
struct Args {
    /// This process's index into the membership file.
    #[arg(long)]
    server_id: i32,

    #[arg(long)]
    membership: PathBuf,

    #[arg(long)]
    config: PathBuf,

    /// Seeds the root directory's mapping on server 0 if it is not
    /// already present. Only meaningful on a brand-new cluster.
    #[arg(long)]
    init_root: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let membership = Membership::load(&args.membership)?;
    let n_servers = membership.n_servers();
    let listen_addr = membership.addr(args.server_id)?;
    let cfg = ServerConfig::load(&args.config)?;

    let db_home = cfg
        .db_home
        .clone()
        .unwrap_or_else(|| format!("./giga-data/{}/db", args.server_id));
    let split_dir = cfg
        .db_split
        .clone()
        .unwrap_or_else(|| format!("./giga-data/{}/split", args.server_id));
    std::fs::create_dir_all(&split_dir)?;

    let store: Arc<dyn OrderedStore> = Arc::new(LogStore::open(std::path::Path::new(&db_home))?);
    let meta = Arc::new(MetaDB::open(store, args.server_id as i64)?);

    if let Some(old_data) = &cfg.old_data {
        for i in 0..old_data.count {
            let sst_dir = PathBuf::from(format!("{}{i}", old_data.prefix));
            if !sst_dir.is_dir() {
                log::warn!("old_data dir {sst_dir:?} missing, skipping");
                continue;
            }
            let min_seq = i as i64 * 2;
            let max_seq = min_seq + 1;
            meta.bulk_insert(min_seq, max_seq, &sst_dir)?;
            log::info!("imported old_data run {sst_dir:?} at startup");
        }
    }

    if args.init_root && args.server_id == 0 {
        match meta.get_mapping(0) {
            Ok(_) => {}
            Err(MetaError::MappingNotFound(_)) => {
                meta.insert_mapping(&DirectoryIndex::new(0, 0))?;
                log::info!("bootstrapped root directory mapping on server 0");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let locks = Arc::new(DirLockTable::new());
    let conn = ConnectionManager::new(membership, ReconnectPolicy::default());
    let split = Arc::new(SplitCoordinator::new(
        args.server_id,
        n_servers,
        meta.clone(),
        locks.clone(),
        conn.clone(),
        tokio::runtime::Handle::current(),
        PathBuf::from(&split_dir),
    ));

    let core = ServerCoreBuilder::default()
        .max_part_size(cfg.dir_split_threshold as u64)
        .build(args.server_id, n_servers, meta, locks, conn, split);

    let listen: std::net::SocketAddr = listen_addr.parse()?;
    log::info!("server {} listening on {listen}", args.server_id);
    tonic::transport::Server::builder()
        .add_service(GigaMetaServer::new(core))
        .serve(listen)
        .await?;
    Ok(())
}
