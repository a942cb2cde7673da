use giga_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("entry already exists")]
    AlreadyExists,

    #[error("entry not found")]
    NotFound,

    #[error("directory index for dir_id {0} not found")]
    MappingNotFound(i64),

    #[error("embedded data range [{offset}, {offset}+{len}) exceeds the {max} byte cap")]
    EmbeddedDataTooLarge {
        offset: u32,
        len: u32,
        max: u32,
    },

    #[error("malformed dentry value: {0}")]
    Corrupt(String),

    #[error("directory index error: {0}")]
    Index(#[from] giga_index::IndexError),
}
