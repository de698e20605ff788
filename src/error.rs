//! Error types for the Proscenic cloud client

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Client error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Login rejected, token missing from the response, or no token held yet
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Socket-address resolution rejected the current token
    #[error("Endpoint resolution failed: {0}")]
    Endpoint(String),

    /// Socket or file transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Payload decryption or map decompression failure
    #[error("Decode error: {0}")]
    Decode(String),

    /// Malformed or unparseable frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// REST transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
