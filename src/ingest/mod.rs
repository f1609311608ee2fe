//! Ingestion pipeline: frames in, validated records out to storage.

pub mod discovery;
pub mod processor;
pub mod write_buffer;

pub use discovery::{DiscoveryListener, DiscoveryStats};
pub use processor::{EventProcessor, ProcessorStats};
pub use write_buffer::{RecordSender, WriteBuffer, WriteBufferStats};
