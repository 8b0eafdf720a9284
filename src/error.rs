//! Error types for the component boundaries.

use thiserror::Error;

/// Failures while acquiring or reading the capture device.
#[derive(Error, Debug)]
pub enum MicError {
    #[error("Microphone access was denied")]
    PermissionDenied,

    #[error("No microphone found")]
    NoDevice,

    #[error("Microphone error: {0}")]
    Device(String),
}

impl MicError {
    /// Text shown to the user for failures they can fix themselves.
    pub fn user_notice(&self) -> Option<&'static str> {
        match self {
            MicError::PermissionDenied => {
                Some("Please allow microphone access to use the voice features")
            }
            MicError::NoDevice => {
                Some("No microphone found. Please connect a microphone and try again.")
            }
            MicError::Device(_) => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend rate limited the request")]
    RateLimited,

    #[error("Backend returned HTTP {0}")]
    Status(u16),

    #[error("Backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Malformed backend response: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage engine error: {0}")]
    Engine(#[from] sled::Error),

    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Record {0} already exists")]
    Duplicate(String),

    #[error("Record {0} not found")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum PanelError {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Invalid arguments for {function}: {reason}")]
    InvalidArguments { function: String, reason: String },

    #[error("Missing required information: {0}")]
    Incomplete(String),

    #[error("Unsupported status: {0}")]
    InvalidStatus(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
