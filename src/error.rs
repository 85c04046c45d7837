//! Error types for AgniIO

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// AgniIO error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Event serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Device directory persistence failed
    #[error("Directory persistence error: {0}")]
    DirectoryPersistence(String),

    /// Connection-level failure (reset, timeout, refused)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
