//! Per-partition dentry/inode schema over a `giga_store::OrderedStore`,
//! plus the split extraction primitive (`spec.md` §4.3).

mod dentry;
mod error;
mod keys;
mod metadb;
mod split;

pub use dentry::{Dentry, S_IFDIR, S_IFREG, STATUS_EMBEDDED_DATA};
pub use error::MetaError;
pub use keys::{dentry_key, decode_key, inode_counter_key, mapping_key, partition_range, SPECIAL_DIR_ID, SYSTEM_PARTITION};
pub use metadb::{MetaDB, DEFAULT_EMBEDDED_DATA_CAP};
pub use split::{extract_local, BulkExtractor, ExtractResult};
