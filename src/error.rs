//! WolfQuorum Error Types

use thiserror::Error;

/// Result type alias for WolfQuorum operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfQuorum error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Epoch errors
    #[error("Epoch file not found: {0}")]
    EpochNotFound(String),

    #[error("Found {content:?} in {file}")]
    EpochFormat { file: String, content: String },

    #[error("Cannot read {file}: {source}")]
    EpochUnreadable {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Epoch state inconsistent: {0}")]
    EpochInconsistent(String),

    // Membership errors
    #[error("Server {0} is not in the membership view")]
    NotInView(u64),

    // Election errors
    #[error("Election error: {0}")]
    Election(String),

    // Role errors
    #[error("Role error: {0}")]
    Role(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed packet: {0}")]
    Protocol(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("Quorum peer already started")]
    AlreadyStarted,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error must abort node startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NotInView(_)
                | Error::EpochInconsistent(_)
                | Error::EpochFormat { .. }
                | Error::EpochUnreadable { .. }
        )
    }
}
