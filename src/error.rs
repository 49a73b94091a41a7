use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeerNetError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid data format: {0}")]
    InvalidData(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for PeerNetError {
    fn from(err: reqwest::Error) -> Self {
        PeerNetError::Network(err.to_string())
    }
}

impl From<std::io::Error> for PeerNetError {
    fn from(err: std::io::Error) -> Self {
        PeerNetError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PeerNetError {
    fn from(err: serde_json::Error) -> Self {
        PeerNetError::InvalidData(err.to_string())
    }
}

impl From<anyhow::Error> for PeerNetError {
    fn from(err: anyhow::Error) -> Self {
        PeerNetError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PeerNetError>;
