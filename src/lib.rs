//! Order book event-stream recorder.
//!
//! Ingests snapshot and delta events for binary markets from a streaming
//! exchange feed, persists them append-only with sequence-continuity
//! validation, and rebuilds historical book state on demand.

pub mod book;
pub mod config;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod models;
pub mod reconstruct;
pub mod registry;
pub mod storage;

pub use config::RecorderConfig;
pub use error::{ConfigError, ConnectionError, FrameError, ReconstructError, StorageError};
pub use reconstruct::{reconstruct, reconstruct_with_timeout};
pub use registry::MarketRegistry;
pub use storage::{RecordSink, RecordSource, SqliteStore, StorageRecord};
