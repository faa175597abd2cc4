//! Upstream Chat-Server Selection
//!
//! Picks the WebSocket endpoint a session dials, by device class: MACs
//! listed under `development.mac_addresss` go to the development pool,
//! everything else to production. The choice within a pool is uniformly
//! random.

use rand::seq::SliceRandom;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::config::ChatConfig;
use crate::error::GatewayError;

/// Protocol version advertised to upstream in the request headers.
pub const PROTOCOL_VERSION: &str = "1";

/// Chooses an upstream URL for the given MAC.
pub fn select_chat_server(config: &ChatConfig, mac: &str) -> Result<String, GatewayError> {
    let pool = if config.development.mac_addresss.iter().any(|m| m == mac) {
        &config.development.chat_servers
    } else {
        &config.production.chat_servers
    };

    pool.choose(&mut rand::thread_rng())
        .cloned()
        .ok_or(GatewayError::NoChatServers)
}

/// Builds the upstream WebSocket request with the gateway's identity
/// headers.
pub fn build_request(url: &str, mac: &str, token: &str) -> Result<Request, GatewayError> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();

    headers.insert(
        "device-id",
        HeaderValue::from_str(mac).map_err(|e| GatewayError::Upstream(e.to_string()))?,
    );
    headers.insert("protocol-version", HeaderValue::from_static(PROTOCOL_VERSION));
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| GatewayError::Upstream(e.to_string()))?,
    );

    Ok(request)
}
