//! Protocol handshake.
//!
//! Right after the transport connects, the client sends a single JSON record
//! naming the hub protocol and version it wants, then waits for the server's
//! verdict. The handshake is always JSON terminated by `0x1E`, whatever hub
//! protocol follows it.

use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::HubError;
use crate::protocol::{HubProtocol, ProtocolError};
use crate::transport::TransportConnection;

const RECORD_SEPARATOR: u8 = 0x1e;

#[derive(Serialize, Debug)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

/// The server's answer to the handshake request.
#[derive(Deserialize, Debug, Default)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "minorVersion")]
    pub minor_version: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    AwaitingResponse,
    Accepted,
    Rejected,
}

/// One handshake exchange.
#[derive(Debug)]
pub struct Handshake {
    protocol: &'static str,
    version: u32,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(protocol: &dyn HubProtocol) -> Self {
        Self {
            protocol: protocol.name(),
            version: protocol.version(),
            state: HandshakeState::NotStarted,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Builds the request record and moves to `AwaitingResponse`.
    pub fn request(&mut self) -> Result<Vec<u8>, HubError> {
        let mut bytes = serde_json::to_vec(&HandshakeRequest {
            protocol: self.protocol,
            version: self.version,
        })
        .map_err(ProtocolError::from)?;
        bytes.push(RECORD_SEPARATOR);
        self.state = HandshakeState::AwaitingResponse;
        Ok(bytes)
    }

    /// Consumes the response record from the front of `buffer`.
    ///
    /// Returns `Ok(false)` while the record is incomplete. Bytes after the
    /// record stay in `buffer`; they belong to the hub protocol.
    pub fn on_data(&mut self, buffer: &mut BytesMut) -> Result<bool, HubError> {
        let Some(end) = buffer.iter().position(|b| *b == RECORD_SEPARATOR) else {
            return Ok(false);
        };
        let record = buffer.split_to(end + 1);
        let response: HandshakeResponse =
            serde_json::from_slice(&record[..end]).map_err(ProtocolError::from)?;

        if let Some(error) = response.error {
            self.state = HandshakeState::Rejected;
            return Err(HubError::HandshakeRejected(error));
        }
        self.state = HandshakeState::Accepted;
        Ok(true)
    }
}

/// Runs the handshake on a freshly connected transport.
///
/// Returns whatever the server sent after its handshake response so the
/// receive loop can start parsing from there.
pub(crate) async fn perform(
    connection: &mut TransportConnection,
    protocol: &dyn HubProtocol,
    timeout: Duration,
) -> Result<BytesMut, HubError> {
    let mut handshake = Handshake::new(protocol);
    let request = handshake.request()?;
    let mut buffer = BytesMut::new();
    let exchange = exchange(connection, request, &mut handshake, &mut buffer);
    let outcome = tokio::time::timeout(timeout, exchange).await;

    match outcome {
        Ok(Ok(())) => {
            debug!("Handshake accepted");
            Ok(buffer)
        }
        Ok(Err(e)) => {
            warn!("Handshake failed: {}", e);
            Err(e)
        }
        Err(_) => Err(HubError::Transport(format!(
            "The handshake timed out after {timeout:?}."
        ))),
    }
}

/// Sends the request and reads until the response record is complete. The
/// send counts against the handshake timeout.
async fn exchange(
    connection: &mut TransportConnection,
    request: Vec<u8>,
    handshake: &mut Handshake,
    buffer: &mut BytesMut,
) -> Result<(), HubError> {
    connection.sender.send(request).await?;
    debug!(
        protocol = handshake.protocol,
        version = handshake.version,
        "Handshake request sent"
    );
    loop {
        match connection.receiver.next().await {
            Some(Ok(data)) => {
                buffer.extend_from_slice(&data);
                if handshake.on_data(buffer)? {
                    return Ok(());
                }
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(HubError::Transport(
                    "The server closed the connection before the handshake completed.".to_string(),
                ))
            }
        }
    }
}
