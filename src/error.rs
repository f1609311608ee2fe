//! Error taxonomy for ingestion, storage and reconstruction.
//!
//! Ingestion-path errors are handled where they occur and drive state
//! transitions (resubscribe, mark stale). Only `ConnectionError::Auth`
//! escapes the ingestion path and halts the recorder.

use thiserror::Error;

use crate::models::TimestampMs;

/// Failures of the streaming connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Credentials were rejected. Fatal: retrying with the same key is pointless.
    #[error("authentication rejected (status {status}): {reason}")]
    Auth { status: u16, reason: String },

    /// Transport-level failure; retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// The peer violated the protocol (bad handshake, undecodable frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection went quiet or was closed by the peer.
    #[error("connection closed: {0}")]
    Closed(String),
}

impl ConnectionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Auth { .. })
    }
}

/// A single inbound frame could not be interpreted. Scoped to that frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("price {price} outside 1..=99 for {ticker}")]
    PriceOutOfRange { ticker: String, price: i64 },

    #[error("negative quantity {quantity} at price {price} for {ticker}")]
    NegativeQuantity {
        ticker: String,
        price: i64,
        quantity: i64,
    },

    #[error("sequence {seq} for {ticker} has no successor")]
    SequenceOverflow { ticker: String, seq: u64 },
}

/// Durable storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode levels: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("decode {column}: {value}")]
    Decode { column: &'static str, value: String },
}

/// Reconstruction query failures, returned to the caller as-is.
#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("no snapshot for {ticker} at or before {target_ts}")]
    NoData {
        ticker: String,
        target_ts: TimestampMs,
    },

    #[error("reconstruction of {ticker} exceeded {timeout_ms}ms")]
    Timeout { ticker: String, timeout_ms: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("reconstruction task failed: {0}")]
    Join(String),
}

/// Invalid or incomplete configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_auth_is_fatal() {
        let auth = ConnectionError::Auth {
            status: 401,
            reason: "bad signature".into(),
        };
        assert!(auth.is_fatal());
        assert!(!ConnectionError::Network("reset".into()).is_fatal());
        assert!(!ConnectionError::Closed("heartbeat timeout".into()).is_fatal());
    }

    #[test]
    fn test_no_data_message() {
        let err = ReconstructError::NoData {
            ticker: "MKT".into(),
            target_ts: 42,
        };
        assert_eq!(err.to_string(), "no snapshot for MKT at or before 42");
    }
}
