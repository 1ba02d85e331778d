use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unauthorized peer: {0}")]
    Authorization(String),

    #[error("Client already connected")]
    AlreadyConnected,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stale response for transaction {0}")]
    StaleCallback(u64),

    #[error("Session closed before the command completed")]
    SessionClosed,

    #[error("Transport closed")]
    TransportClosed,
}

impl Error {
    pub fn frame<T: fmt::Display>(msg: T) -> Self {
        Error::Frame(msg.to_string())
    }

    pub fn format<T: fmt::Display>(msg: T) -> Self {
        Error::Format(msg.to_string())
    }

    pub fn protocol<T: fmt::Display>(msg: T) -> Self {
        Error::Protocol(msg.to_string())
    }

    pub fn authorization<T: fmt::Display>(peer: T) -> Self {
        Error::Authorization(peer.to_string())
    }

    pub fn configuration<T: fmt::Display>(msg: T) -> Self {
        Error::Configuration(msg.to_string())
    }
}
