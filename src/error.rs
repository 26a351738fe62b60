use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors that can occur in the hub connection.
#[derive(Error, Debug)]
pub enum HubError {
    /// The server refused the handshake. Never retried.
    #[error("{0}")]
    HandshakeRejected(String),

    /// The server reported an error for one invocation. The text is the
    /// server's message, untouched.
    #[error("{0}")]
    RemoteInvocation(String),

    /// The connection went away while the call was outstanding.
    #[error("{}", closed_message(.0))]
    ConnectionClosed(Option<Arc<HubError>>),

    #[error("The operation was canceled.")]
    OperationCanceled,

    /// A hub message could not be written or read. Fatal to the connection.
    #[error("Failed to serialize or parse a hub message. {0}")]
    Serialization(#[from] ProtocolError),

    #[error("{0}")]
    InvalidOperation(String),

    #[error("Server timeout ({0:?}) elapsed without receiving a message from the server.")]
    ServerTimeout(Duration),

    #[error("The server closed the connection with the following error: {0}")]
    ServerClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Failed to bind the invocation result: {0}")]
    ResultBinding(serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

fn closed_message(cause: &Option<Arc<HubError>>) -> String {
    match cause {
        Some(cause) => format!("Connection closed with an error. {cause}"),
        None => "Invocation canceled due to the underlying connection being closed.".to_string(),
    }
}

impl HubError {
    /// `true` when retrying the connection cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(self, HubError::HandshakeRejected(_))
    }

    pub(crate) fn not_active(method: &str) -> Self {
        HubError::InvalidOperation(format!(
            "The '{method}' method cannot be called if the connection is not active"
        ))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        HubError::WebSocket(Box::new(e))
    }
}
