use thiserror::Error;

use crate::hub::HubError;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// No bearer credential available; the chat cannot start.
    #[error("not signed in: no bearer token found (use --token or --save-token)")]
    AuthMissing,

    #[error("connection failed: {0}")]
    Connect(#[source] HubError),

    #[error("history fetch failed: {0}")]
    History(String),

    #[error("send failed: {0}")]
    Send(#[source] HubError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Whether the error should block the chat surface rather than only be logged.
    pub fn is_blocking(&self) -> bool {
        matches!(self, ChatError::AuthMissing | ChatError::Connect(_))
    }
}
