use thiserror::Error;

/// Client-side error kinds (spec.md §7, client's view of the wire
/// taxonomy). `ServerRedirection` never surfaces here: it is handled
/// entirely inside the retry loop in `crate::retry`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid path: {0}")]
    InvalidArgument(String),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("target is not a directory")]
    NotADirectory,

    #[error("call to server {server_id} failed: {status}")]
    Call { server_id: i32, status: tonic::Status },

    #[error("server returned an empty response")]
    EmptyResponse,

    #[error("exhausted {0} redirect attempts without reaching the owning server")]
    RedirectsExhausted(u32),

    #[error(transparent)]
    Rpc(#[from] giga_rpc::RpcError),

    #[error(transparent)]
    Index(#[from] giga_index::IndexError),

    #[error(transparent)]
    Meta(#[from] giga_meta::MetaError),

    #[error(transparent)]
    Store(#[from] giga_store::StoreError),
}

/// Maps a failed call's `tonic::Status` onto the richer `ClientError`
/// variants the caller might want to match on, falling back to `Call`
/// for anything that isn't one of the well-known codes.
pub fn translate_status(server_id: i32, status: tonic::Status) -> ClientError {
    match status.code() {
        tonic::Code::NotFound => ClientError::NotFound,
        tonic::Code::AlreadyExists => ClientError::AlreadyExists,
        tonic::Code::FailedPrecondition => ClientError::NotADirectory,
        _ => ClientError::Call { server_id, status },
    }
}
