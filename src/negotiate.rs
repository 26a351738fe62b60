//! Negotiation with the SignalR server.
//!
//! Before opening the WebSocket, the client POSTs to `<hub>/negotiate` to get a
//! connection id and the token that goes into the WebSocket URL. The server
//! may instead redirect the client to another URL, optionally with an access
//! token for it.

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::HubError;

const NEGOTIATE_VERSION: u32 = 1;
const MAX_REDIRECTS: usize = 100;

/// Response from the `/negotiate` endpoint.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub negotiate_version: Option<u32>,
    /// Redirect target.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

/// Where to open the WebSocket, after redirects.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub url: Url,
    pub connection_id: Option<String>,
    pub connection_token: Option<String>,
    pub access_token: Option<String>,
}

/// `<hub path>/negotiate?negotiateVersion=1`, keeping the hub's own query.
pub fn negotiate_url(hub_url: &Url) -> Url {
    let mut url = hub_url.clone();
    let mut path = url.path().to_string();
    if path.ends_with('/') {
        path.pop();
    }
    path.push_str("/negotiate");
    url.set_path(&path);
    url.set_fragment(None);
    url.query_pairs_mut()
        .append_pair("negotiateVersion", &NEGOTIATE_VERSION.to_string());
    url
}

/// Turns an http(s) hub URL into the ws(s) URL to connect to, appending the
/// connection token as `id` when there is one.
pub fn websocket_url(hub_url: &Url, connection_token: Option<&str>) -> Result<Url, HubError> {
    let mut url = hub_url.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(HubError::Negotiation(format!(
                "Unsupported URL scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| HubError::Negotiation(format!("Cannot use scheme '{scheme}' for {hub_url}")))?;
    url.set_fragment(None);
    if let Some(token) = connection_token {
        url.query_pairs_mut().append_pair("id", token);
    }
    Ok(url)
}

/// Runs the negotiate exchange, following redirects.
pub async fn negotiate(
    client: &reqwest::Client,
    hub_url: &Url,
    access_token: Option<&str>,
) -> Result<Negotiated, HubError> {
    let mut url = hub_url.clone();
    let mut access_token = access_token.map(str::to_string);

    for _ in 0..MAX_REDIRECTS {
        let target = negotiate_url(&url);
        debug!("Negotiate URL: {}", target);

        let mut request = client.post(target.as_str()).header("Accept", "application/json");
        if let Some(token) = &access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HubError::Negotiation(format!(
                "Unexpected status code returned from negotiate '{status}'"
            )));
        }
        let body: NegotiateResponse = response.json().await?;

        match resolve(body)? {
            Step::Redirect { url: next, access_token: token } => {
                debug!("Negotiate redirected to {}", next);
                url = Url::parse(&next)?;
                if token.is_some() {
                    access_token = token;
                }
            }
            Step::Done {
                connection_id,
                connection_token,
            } => {
                return Ok(Negotiated {
                    url,
                    connection_id,
                    connection_token,
                    access_token,
                })
            }
        }
    }

    Err(HubError::Negotiation(
        "Negotiate redirection limit exceeded.".to_string(),
    ))
}

#[derive(Debug, PartialEq)]
enum Step {
    Redirect {
        url: String,
        access_token: Option<String>,
    },
    Done {
        connection_id: Option<String>,
        connection_token: Option<String>,
    },
}

fn resolve(response: NegotiateResponse) -> Result<Step, HubError> {
    if let Some(error) = response.error {
        return Err(HubError::Negotiation(error));
    }
    if let Some(url) = response.url {
        return Ok(Step::Redirect {
            url,
            access_token: response.access_token,
        });
    }
    if !response.available_transports.is_empty()
        && !response
            .available_transports
            .iter()
            .any(|t| t.transport.eq_ignore_ascii_case("WebSockets"))
    {
        return Err(HubError::Negotiation(
            "The server does not support WebSockets.".to_string(),
        ));
    }
    // Version 0 servers have no separate token; the id doubles as one.
    let connection_token = match response.negotiate_version {
        Some(v) if v >= 1 => response.connection_token,
        _ => response.connection_id.clone(),
    };
    Ok(Step::Done {
        connection_id: response.connection_id,
        connection_token,
    })
}
