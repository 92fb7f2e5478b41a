use thiserror::Error;

pub type Result<T> = std::result::Result<T, EcpbError>;

#[derive(Debug, Error)]
pub enum EcpbError {
    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("compression error: {0}")]
    Compression(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("Failed to create snapshot")]
    SnapshotFailed,

    #[error("job not found: {0}")]
    JobNotFound(i64),

    #[error("encryption key not found for job {0}")]
    KeyNotFound(i64),

    #[error("invalid hex digest: {0}")]
    InvalidDigest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl EcpbError {
    /// Catalog failures are fatal for the job that hit them; everything
    /// else is scoped to the current file or chunk.
    pub fn is_fatal_for_job(&self) -> bool {
        matches!(self, EcpbError::Catalog(_))
    }
}
