//! RTC HTTP Handlers
//!
//! Voice signaling runs over the WebSocket; this endpoint only hands
//! browsers their ICE server configuration, with ephemeral TURN
//! credentials derived from the shared TURN secret.

use axum::extract::State;
use axum::Json;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::app::AppState;

/// ICE server configuration.
#[derive(Debug, Serialize)]
pub struct IceServer {
    /// Server URLs (e.g., "stun:stun.l.google.com:19302")
    pub urls: Vec<String>,
    /// Username for TURN servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential for TURN servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Response containing ICE server configuration.
#[derive(Debug, Serialize)]
pub struct IceServersResponse {
    /// List of ICE servers to use for WebRTC.
    pub ice_servers: Vec<IceServer>,
    /// ICE transport policy the client should apply.
    pub ice_transport_policy: &'static str,
}

/// REST-style ephemeral TURN credentials: the username carries the expiry,
/// the credential is an HMAC over it with the shared secret.
#[must_use]
pub fn turn_rest_credentials(secret: &str, ttl_seconds: i64) -> (String, String) {
    let username = format!("{}:ca", Utc::now().timestamp() + ttl_seconds);
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(username.as_bytes());
    let credential = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    (username, credential)
}

/// Get ICE server configuration.
///
/// GET /api/rtc/ice-servers
pub async fn get_ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    let mut servers = vec![IceServer {
        urls: vec![state.config.stun_server.clone()],
        username: None,
        credential: None,
    }];

    if let Some(turn) = &state.config.turn_server {
        let (username, credential) = state.config.turn_secret.as_ref().map_or((None, None), |secret| {
            let (username, credential) =
                turn_rest_credentials(secret, state.config.turn_credentials_ttl_seconds);
            (Some(username), Some(credential))
        });
        servers.push(IceServer {
            urls: vec![turn.clone()],
            username,
            credential,
        });
    }

    Json(IceServersResponse {
        ice_servers: servers,
        ice_transport_policy: match state.config.ice_transport_policy {
            crate::config::IceTransportPolicy::All => "all",
            crate::config::IceTransportPolicy::Relay => "relay",
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_credentials_embed_future_expiry() {
        let (username, credential) = turn_rest_credentials("secret", 600);
        let expiry: i64 = username.split(':').next().unwrap().parse().unwrap();
        assert!(expiry > Utc::now().timestamp());
        assert!(!credential.is_empty());

        // Deterministic for a fixed username within the same second.
        let (username_2, credential_2) = turn_rest_credentials("secret", 600);
        if username == username_2 {
            assert_eq!(credential, credential_2);
        }
    }
}
