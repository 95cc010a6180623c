use thiserror::Error;

/// Disk-level failures. These are fatal to the session: a download cannot
/// make progress against a broken filesystem.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file path escapes the download directory: {0}")]
    PathTraversal(String),

    #[error("invalid piece index {0}")]
    InvalidPieceIndex(u32),

    #[error("piece {0} is not complete")]
    PieceNotComplete(u32),
}
