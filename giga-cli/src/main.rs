//! `gigafs`: thin CLI front-ends over `giga_client::Client` (spec.md §6,
//! "listed for completeness"). Each subcommand resolves its path, makes
//! one or two calls through the client library, and exits 0 on success
//! or -1 on any error.

use clap::{Parser, Subcommand};
use giga_client::{Client, ClientOptions, PathResolution, Resolved};
use giga_meta::S_IFDIR;
use giga_rpc::conn::ReconnectPolicy;
use giga_rpc::membership::Membership;
use std::io::{Read, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gigafs", about = "Thin CLI front-end over the GigaMeta client library")]
struct Args {
    /// Membership file (`server_id -> host:port`), same format `gigad` reads.
    #[arg(long)]
    membership: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints a file or directory's attributes.
    Getattr { path: String },
    /// Lists a directory's entries.
    Readdir { path: String },
    /// Reads up to `size` embedded-data bytes and writes them to stdout.
    Readfile { path: String, size: u32 },
    /// Reads up to `size` bytes from stdin and stores them as the file's
    /// embedded data.
    Writefile { path: String, size: u32 },
    /// Removes a file or directory entry.
    Unlink { path: String },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("gigafs: {e}");
        std::process::exit(-1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let membership = Membership::load(&args.membership)?;
    let client = Client::new(membership, ReconnectPolicy::default(), ClientOptions::default());
    match args.command {
        Command::Getattr { path } => getattr(&client, &path).await,
        Command::Readdir { path } => readdir(&client, &path).await,
        Command::Readfile { path, size } => readfile(&client, &path, size).await,
        Command::Writefile { path, size } => writefile(&client, &path, size).await,
        Command::Unlink { path } => unlink(&client, &path).await,
    }
}

/// Resolves `path` down to its parent and leaf name; the root path has
/// neither, since it is not an entry inside any directory.
fn require_leaf(resolved: Resolved) -> anyhow::Result<PathResolution> {
    match resolved {
        Resolved::Root => anyhow::bail!("/ names the root directory, which is not a directory entry"),
        Resolved::Child(r) => Ok(r),
    }
}

/// Resolves `path` to the `(inode, zeroth_server)` of the directory it
/// names, so `readdir` can also target the cluster root.
async fn target_dir(client: &Client, path: &str) -> anyhow::Result<(i64, i16)> {
    match client.resolve(path).await? {
        Resolved::Root => Ok((0, 0)),
        Resolved::Child(r) => {
            let stat = client.getattr(r.parent.inode, r.parent.zeroth_server, &r.leaf).await?;
            if stat.mode & S_IFDIR == 0 {
                anyhow::bail!("{path} is not a directory");
            }
            Ok((stat.inode, stat.zeroth_server as i16))
        }
    }
}

async fn getattr(client: &Client, path: &str) -> anyhow::Result<()> {
    let r = require_leaf(client.resolve(path).await?)?;
    let stat = client.getattr(r.parent.inode, r.parent.zeroth_server, &r.leaf).await?;
    println!("inode:       {}", stat.inode);
    println!("size:        {}", stat.size);
    println!("mode:        {:o}", stat.mode);
    println!("is_dir:      {}", stat.mode & S_IFDIR != 0);
    println!("uid:         {}", stat.uid);
    println!("gid:         {}", stat.gid);
    println!("ctime:       {}", format_time(stat.ctime));
    println!("mtime:       {}", format_time(stat.mtime));
    Ok(())
}

fn format_time(epoch_secs: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(epoch_secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| format!("<invalid timestamp {epoch_secs}>"))
}

async fn readdir(client: &Client, path: &str) -> anyhow::Result<()> {
    let (dir_id, zeroth_server) = target_dir(client, path).await?;
    for name in client.list_dir(dir_id, zeroth_server).await? {
        println!("{name}");
    }
    Ok(())
}

async fn readfile(client: &Client, path: &str, size: u32) -> anyhow::Result<()> {
    let r = require_leaf(client.resolve(path).await?)?;
    let data = client.fetch_data(r.parent.inode, r.parent.zeroth_server, &r.leaf, 0, size).await?;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

async fn writefile(client: &Client, path: &str, size: u32) -> anyhow::Result<()> {
    let r = require_leaf(client.resolve(path).await?)?;
    let mut buf = vec![0u8; size as usize];
    let n = std::io::stdin().read(&mut buf)?;
    buf.truncate(n);
    client.write_data(r.parent.inode, r.parent.zeroth_server, &r.leaf, 0, buf).await?;
    Ok(())
}

async fn unlink(client: &Client, path: &str) -> anyhow::Result<()> {
    let r = require_leaf(client.resolve(path).await?)?;
    client.unlink(r.parent.inode, r.parent.zeroth_server, &r.leaf).await?;
    Ok(())
}
