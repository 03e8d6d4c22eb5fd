use thiserror::Error;

/// The crate-wide result alias. Every fallible operation in `katamari`
/// resolves to this.
pub type CResult<T> = Result<T, Error>;

/// Crate-wide error type.
///
/// Variants map onto the failure surfaces of the six components: storage
/// I/O and recovery, value codec, MVCC bookkeeping, the search index, and
/// the work dispatcher's wire protocol and scheduling.
#[derive(Error, Debug)]
pub enum Error {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("schema error: {0}")]
    SchemaError(String),

    #[error("codec error: {0}")]
    CodecError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("wal replay error: {0}")]
    WalReplayError(String),

    #[error("transaction error: {0}")]
    TransactionError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("concurrency limit reached: {0}")]
    ConcurrencyLimit(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("search error: {0}")]
    Search(String),

    /// Catch-all for conditions that don't fit a more specific variant,
    /// kept for parity with the storage layer's original `Error::Internal`.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::time::SystemTimeError> for Error {
    fn from(e: std::time::SystemTimeError) -> Self {
        Error::Internal(e.to_string())
    }
}
