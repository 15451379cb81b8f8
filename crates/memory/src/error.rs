use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Stable error taxonomy of the memory subsystem. Hosts match on the variant
/// (or [`MemoryError::kind`]) to decide exit codes and rendering; messages are
/// for humans only.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage init failed: {0}")]
    StorageInit(String),

    #[error("storage is not open")]
    StorageUnavailable,

    #[error("storage I/O error: {0}")]
    StorageIo(String),

    #[error("storage schema mismatch: {0}")]
    StorageSchema(String),

    #[error("vector backend `{0}` is not implemented")]
    BackendNotImplemented(String),

    #[error("vector backend `{0}` is remote; set memory.vector.remote_opt_in = true to allow it")]
    RemoteBackendNotAllowed(String),

    #[error("vector backend call timed out after {0} ms")]
    BackendTimeout(u64),

    #[error("vector backend error: {0}")]
    BackendIo(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("vector search failed with lexical fallback disabled: {0}")]
    SearchVector(String),
}

impl MemoryError {
    /// Stable kind identifier, independent of the human-readable message.
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::Config(_) => "ConfigError",
            MemoryError::StorageInit(_) => "StorageInit",
            MemoryError::StorageUnavailable => "StorageUnavailable",
            MemoryError::StorageIo(_) => "StorageIO",
            MemoryError::StorageSchema(_) => "StorageSchema",
            MemoryError::BackendNotImplemented(_) => "BackendNotImplemented",
            MemoryError::RemoteBackendNotAllowed(_) => "RemoteBackendNotAllowed",
            MemoryError::BackendTimeout(_) => "BackendTimeout",
            MemoryError::BackendIo(_) => "BackendIO",
            MemoryError::EmbeddingFailure(_) => "EmbeddingFailure",
            MemoryError::SearchVector(_) => "MemorySearchVectorError",
        }
    }

    /// Timeouts are the only errors worth an automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemoryError::BackendTimeout(_))
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        MemoryError::StorageIo(err.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::StorageIo(format!("json: {err}"))
    }
}
