use thiserror::Error;

pub type MapsResult<T> = Result<T, MapsError>;

#[derive(Error, Debug)]
pub enum MapsError {
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("history database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("history database unavailable")]
    StorageUnavailable,

    #[error("broker error: {0}")]
    Broker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("{0}")]
    Other(String),
}
