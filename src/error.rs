use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    Exists,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt database {path:?} at offset {offset}: {reason}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: &'static str,
    },
    #[error("invalid key")]
    InvalidKey,
    #[error("a transaction is already in flight on this database")]
    Locked,
    /// Transient failure. Part of the backend contract vocabulary; this
    /// engine never produces it itself.
    #[error("operation interrupted, retry")]
    Again,
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, offset: u64, reason: &'static str) -> Self {
        let path = path.into();
        tracing::error!(?path, offset, reason, "database corruption detected");
        Error::Corrupt {
            path,
            offset,
            reason,
        }
    }
}
