//! Path resolution, the lookup/index caches, and buffered mknod for the
//! metadata-plane client (spec.md §4.7), plus the pre-split batch-client
//! mode (spec.md §4.7 "Client-buffered mknod" / batch ingest).

mod client;
mod conn_context;
mod error;
mod index_cache;
mod lookup_cache;
mod path;
mod time;

pub mod batch;

pub use client::{Client, ClientOptions};
pub use error::ClientError;
pub use path::{PathResolution, Resolved, ResolvedDir};
