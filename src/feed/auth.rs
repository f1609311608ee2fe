//! Connection signing.
//!
//! The feed authenticates the websocket upgrade with three headers: the key
//! id, a millisecond timestamp and an HMAC-SHA256 signature over
//! `timestamp + "GET" + path`. Signatures are bound to their timestamp, so a
//! new one is computed for every connection attempt.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::config::FeedConfig;
use crate::error::ConnectionError;
use crate::models::TimestampMs;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_KEY: &str = "FEED-ACCESS-KEY";
pub const HEADER_TIMESTAMP: &str = "FEED-ACCESS-TIMESTAMP";
pub const HEADER_SIGNATURE: &str = "FEED-ACCESS-SIGNATURE";

/// API credentials.
#[derive(Clone)]
pub struct Credentials {
    pub key_id: String,
    secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key_id", &self.key_id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Headers for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub key_id: String,
    pub timestamp: TimestampMs,
    pub signature: String,
}

impl Credentials {
    pub fn new(key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
        }
    }

    pub fn from_config(config: &FeedConfig) -> Option<Self> {
        if !config.has_credentials() {
            return None;
        }
        Some(Self::new(config.api_key_id.clone(), config.api_secret.clone()))
    }

    /// Base64 HMAC-SHA256 of `timestamp + method + path`.
    pub fn sign(&self, timestamp: TimestampMs, method: &str, path: &str) -> Result<String, ConnectionError> {
        let message = format!("{}{}{}", timestamp, method, path);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|e| {
            ConnectionError::Auth {
                status: 0,
                reason: format!("unusable secret: {e}"),
            }
        })?;
        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    pub fn signed_headers(&self, path: &str, timestamp: TimestampMs) -> Result<SignedHeaders, ConnectionError> {
        Ok(SignedHeaders {
            key_id: self.key_id.clone(),
            timestamp,
            signature: self.sign(timestamp, "GET", path)?,
        })
    }
}

/// Websocket upgrade request carrying freshly signed headers.
pub fn build_request(url: &str, headers: &SignedHeaders) -> Result<Request, ConnectionError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectionError::Protocol(format!("invalid feed url: {e}")))?;

    let pairs = [
        (HEADER_KEY, headers.key_id.clone()),
        (HEADER_TIMESTAMP, headers.timestamp.to_string()),
        (HEADER_SIGNATURE, headers.signature.clone()),
    ];
    for (name, value) in pairs {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ConnectionError::Protocol(format!("invalid {name} header: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}
