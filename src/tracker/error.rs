use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

    #[error("invalid tracker url: {0}")]
    InvalidUrl(String),

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("tracker timed out")]
    Timeout,

    #[error("no usable trackers")]
    NoTrackers,

    /// Every tracker of the torrent failed.
    #[error("all trackers failed")]
    AllFailed,
}
