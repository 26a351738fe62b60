//! Fluent configuration for [`HubConnection`].

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use super::retry::{DelayRetryPolicy, RetryPolicy};
use super::HubConnection;
use crate::error::HubError;
use crate::protocol::{HubProtocol, MessagePackCodec};
use crate::transport::{Transport, WebSocketTransport};

/// Default time allowed for the handshake exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time the server may stay silent before the connection is failed.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle period after which a ping is sent.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Default bound of the outbound message queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Timing and buffering knobs of a connection.
#[derive(Debug, Clone)]
pub struct HubConnectionOptions {
    pub handshake_timeout: Duration,
    /// Should be at least twice the server's keep-alive interval.
    pub server_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Outbound frames queued before senders start to wait.
    pub channel_capacity: usize,
}

impl HubConnectionOptions {
    fn validate(&self) -> Result<(), HubError> {
        if self.keep_alive_interval.is_zero() {
            return Err(HubError::InvalidOperation(
                "The keep-alive interval must be greater than zero.".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(HubError::InvalidOperation(
                "The channel capacity must be greater than zero.".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for HubConnectionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Builder for a [`HubConnection`].
///
/// Either a hub URL (for the WebSocket transport) or an explicit transport
/// must be given. The protocol defaults to MessagePack.
pub struct HubConnectionBuilder {
    url: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    protocol: Arc<dyn HubProtocol>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    options: HubConnectionOptions,
    skip_negotiation: bool,
    access_token: Option<String>,
}

impl HubConnectionBuilder {
    pub fn new() -> Self {
        Self {
            url: None,
            transport: None,
            protocol: Arc::new(MessagePackCodec),
            retry_policy: None,
            options: HubConnectionOptions::default(),
            skip_negotiation: false,
            access_token: None,
        }
    }

    /// Hub endpoint, e.g. `http://localhost:5000/chathub`.
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Uses `transport` instead of a WebSocket built from the URL.
    pub fn with_transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn with_protocol(mut self, protocol: impl HubProtocol) -> Self {
        self.protocol = Arc::new(protocol);
        self
    }

    /// Reconnects after 0, 2, 10 and 30 seconds, then gives up.
    pub fn with_automatic_reconnect(mut self) -> Self {
        self.retry_policy = Some(Arc::new(DelayRetryPolicy::default()));
        self
    }

    /// Reconnects once per entry of `delays`, waiting that long first.
    pub fn with_automatic_reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_policy = Some(Arc::new(DelayRetryPolicy::new(delays)));
        self
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    pub fn with_options(mut self, options: HubConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Default: 15 seconds
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    /// Default: 30 seconds
    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.options.server_timeout = timeout;
        self
    }

    /// Default: 15 seconds. Must not be zero.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.options.keep_alive_interval = interval;
        self
    }

    /// Default: 1024. Must not be zero.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.options.channel_capacity = capacity;
        self
    }

    /// Connects the WebSocket directly, without the negotiate request. The
    /// connection id stays unset. Ignored with a custom transport.
    pub fn skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    /// Bearer token for negotiation and the WebSocket upgrade. Ignored with a
    /// custom transport.
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn build(self) -> Result<HubConnection, HubError> {
        self.options.validate()?;
        let transport = match (self.transport, self.url) {
            (Some(transport), _) => transport,
            (None, Some(url)) => {
                let mut transport =
                    WebSocketTransport::new(Url::parse(&url)?).skip_negotiation(self.skip_negotiation);
                if let Some(token) = self.access_token {
                    transport = transport.access_token(token);
                }
                Arc::new(transport)
            }
            (None, None) => {
                return Err(HubError::InvalidOperation(
                    "A hub URL or a transport is required to build a HubConnection.".to_string(),
                ))
            }
        };
        Ok(HubConnection::new(
            transport,
            self.protocol,
            self.options,
            self.retry_policy,
        ))
    }
}

impl Default for HubConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
