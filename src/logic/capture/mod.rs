//! Capture Module - Input boundary of the pipeline
//!
//! The core never touches a NIC. A `PacketSource` yields decoded
//! `PacketRecord`s until end of stream; the concrete transport (tcpdump,
//! pcap replay, ring buffer) is an external collaborator.

pub mod types;
pub mod replay;

pub use types::{FlowKey, FlowRef, PacketRecord, Protocol, TcpFlags};
pub use replay::{JsonlReplaySource, MemorySource};

// ============================================================================
// ERROR HANDLING
// ============================================================================

/// Per-record capture failure. Never fatal: the pipeline drops the record,
/// bumps a counter, and keeps reading.
#[derive(Debug)]
pub enum CaptureError {
    /// Record failed decode/sanity checks
    Malformed { reason: String },
    /// Underlying source I/O failure
    Io(std::io::Error),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Malformed { reason } => write!(f, "malformed record: {}", reason),
            CaptureError::Io(e) => write!(f, "capture i/o error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::Io(e)
    }
}

// ============================================================================
// PACKET SOURCE
// ============================================================================

/// Abstract packet iterator. `Ok(None)` signals end of stream.
pub trait PacketSource: Send {
    fn next_record(&mut self) -> Result<Option<PacketRecord>, CaptureError>;

    /// Human-readable source description for logs
    fn describe(&self) -> String {
        "packet source".to_string()
    }
}
