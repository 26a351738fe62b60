//! WebSocket transport, optionally preceded by negotiation.

use futures_util::future::{self, BoxFuture};
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use super::{Transport, TransportConnection};
use crate::error::HubError;
use crate::negotiate::{negotiate, websocket_url};
use crate::protocol::TransferFormat;

/// Connects to a hub over WebSockets.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
    skip_negotiation: bool,
    access_token: Option<String>,
    http: reqwest::Client,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            skip_negotiation: false,
            access_token: None,
            http: reqwest::Client::new(),
        }
    }

    /// Connect straight to the WebSocket endpoint. The connection id stays
    /// unknown.
    pub fn skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    /// Bearer token sent with the negotiate request and the upgrade request.
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn open(&self, format: TransferFormat) -> Result<TransportConnection, HubError> {
        let (ws_url, connection_id, access_token) = if self.skip_negotiation {
            (websocket_url(&self.url, None)?, None, self.access_token.clone())
        } else {
            let negotiated = negotiate(&self.http, &self.url, self.access_token.as_deref()).await?;
            (
                websocket_url(&negotiated.url, negotiated.connection_token.as_deref())?,
                negotiated.connection_id,
                negotiated.access_token,
            )
        };
        debug!("WebSocket URL: {}", ws_url);

        let mut request = ws_url.as_str().into_client_request()?;
        if let Some(token) = access_token {
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }
        let (ws_stream, _) = connect_async(request).await?;
        let (sink, stream) = ws_stream.split();

        let sender = sink
            .sink_map_err(HubError::from)
            .with(move |bytes: Vec<u8>| future::ready(to_message(format, bytes)));

        let receiver = stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Binary(data)) => Some(Ok(data)),
                    Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
                    Ok(_) => None,
                    Err(e) => Some(Err(HubError::from(e))),
                })
            });

        Ok(TransportConnection {
            connection_id,
            sender: Box::pin(sender),
            receiver: Box::pin(receiver),
        })
    }
}

fn to_message(format: TransferFormat, bytes: Vec<u8>) -> Result<Message, HubError> {
    match format {
        TransferFormat::Binary => Ok(Message::Binary(bytes)),
        TransferFormat::Text => String::from_utf8(bytes)
            .map(Message::Text)
            .map_err(|e| HubError::Transport(format!("Text frame is not valid UTF-8: {e}"))),
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, format: TransferFormat) -> BoxFuture<'_, Result<TransportConnection, HubError>> {
        Box::pin(self.open(format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_frames_for_binary_format() {
        assert_eq!(
            to_message(TransferFormat::Binary, vec![1, 2, 3]).unwrap(),
            Message::Binary(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_text_frames_for_text_format() {
        assert_eq!(
            to_message(TransferFormat::Text, b"{}\x1e".to_vec()).unwrap(),
            Message::Text("{}\u{1e}".to_string())
        );
        assert!(to_message(TransferFormat::Text, vec![0xff]).is_err());
    }

    #[test]
    fn test_builder_options() {
        let transport = WebSocketTransport::new(Url::parse("http://localhost:5000/hub").unwrap())
            .skip_negotiation(true)
            .access_token("t");
        assert!(transport.skip_negotiation);
        assert_eq!(transport.access_token.as_deref(), Some("t"));
        assert_eq!(transport.url().as_str(), "http://localhost:5000/hub");
    }
}
