use thiserror::Error;

/// Wire-level error taxonomy (spec.md §6/§7), minus `ServerRedirection`
/// and `FileNotFoundException`/`FileAlreadyExistsException`, which are
/// carried as ordinary response data (a `oneof`) or mapped onto
/// `tonic::Status` codes by the handler rather than modelled here —
/// see SPEC_FULL.md §7.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error talking to server {server_id}: {source}")]
    Transport {
        server_id: i32,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("call to server {server_id} failed: {status}")]
    Call { server_id: i32, status: tonic::Status },

    #[error("server {0} is not present in the membership map")]
    UnknownServer(i32),

    #[error("exhausted {0} redirect attempts without reaching the owning server")]
    RedirectsExhausted(u32),

    #[error("malformed membership file at line {line}: {reason}")]
    BadMembership { line: usize, reason: String },

    #[error("malformed config file: {0}")]
    BadConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
