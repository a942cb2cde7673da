use thiserror::Error;

/// Server-side error kinds (spec.md §7), minus `ServerRedirection`, which
/// is carried as response data rather than an error — see
/// `crate::core::Routed`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("target is not a directory")]
    DirectoryExpected,

    #[error("dir_id {0} is not recognised by this server")]
    UnrecognizedDirectory(i64),

    #[error("zeroth_server {given} does not map to this server ({self_id})")]
    WrongServer { given: i16, self_id: i32 },

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error(transparent)]
    Meta(#[from] giga_meta::MetaError),

    #[error(transparent)]
    Index(#[from] giga_index::IndexError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<HandlerError> for tonic::Status {
    fn from(err: HandlerError) -> Self {
        use tonic::Code;
        let code = match &err {
            HandlerError::NotFound => Code::NotFound,
            HandlerError::AlreadyExists => Code::AlreadyExists,
            HandlerError::DirectoryExpected => Code::FailedPrecondition,
            HandlerError::UnrecognizedDirectory(_) => Code::NotFound,
            HandlerError::WrongServer { .. } => {
                log::error!("{err} (spec.md: 'should be impossible; bug')");
                Code::Internal
            }
            HandlerError::NotSupported(_) => Code::Unimplemented,
            HandlerError::Meta(giga_meta::MetaError::NotFound) => Code::NotFound,
            HandlerError::Meta(giga_meta::MetaError::AlreadyExists) => Code::AlreadyExists,
            HandlerError::Meta(_) | HandlerError::Index(_) | HandlerError::Internal(_) => {
                log::error!("internal error: {err}");
                Code::Internal
            }
        };
        tonic::Status::new(code, err.to_string())
    }
}
