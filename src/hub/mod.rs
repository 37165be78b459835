use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::credentials::Credential;

pub use client::{HubConnection, HubOptions};

mod client;
pub mod protocol;

/// Hub method the server calls to push a message to us.
pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
/// Hub method we call to deliver a message to another user.
pub const SEND_MESSAGE_TO_USER: &str = "SendMessageToUser";

#[derive(Debug, Error)]
pub enum HubError {
    #[error("negotiation failed: {0}")]
    Negotiate(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("hub method failed: {0}")]
    Invocation(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid hub url: {0}")]
    Url(#[from] url::ParseError),
}

/// A `ReceiveMessage` push as delivered by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub sender_id: String,
    pub content: String,
    pub time_sent: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Message(InboundMessage),
    /// The connection dropped and the transport is retrying.
    Reconnecting(String),
    Reconnected,
    /// The transport stopped for good. `None` when we asked it to.
    Closed(Option<String>),
}

/// The live connection a chat session talks through.
///
/// `connect` hands back the only event stream for that connection; a new stream is issued
/// on every successful connect and the previous one ends.
#[async_trait]
pub trait HubTransport: Send + Sync {
    async fn connect(
        &mut self,
        user_id: &str,
        credential: &Credential,
    ) -> Result<mpsc::UnboundedReceiver<HubEvent>, HubError>;

    async fn send_message(
        &self,
        recipient_id: &str,
        sender_id: &str,
        content: &str,
        time_sent: &DateTime<Utc>,
    ) -> Result<(), HubError>;

    /// Stop the connection. Safe to call when nothing is connected.
    async fn disconnect(&mut self);
}
