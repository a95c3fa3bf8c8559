use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the DCC subsystem.
///
/// Per-session errors never escape their session task: they are converted
/// into a cancellation event plus resource cleanup, and only completion
/// signals cross the collector boundary. The variants here name the distinct
/// ways a transfer can fail.
#[derive(Debug, Error)]
pub enum DccError {
    /// The admission policy rejected the peer before a session started.
    #[error("admission denied for {nick} ({address}): {reason}")]
    AdmissionDenied {
        nick: String,
        address: IpAddr,
        reason: String,
    },

    /// The resolved destination would escape the download root.
    #[error("destination \"{name}\" escapes download root {}", root.display())]
    SandboxViolation { name: String, root: PathBuf },

    /// The offer advertised port 0, i.e. passive DCC, which is unsupported.
    #[error("passive DCC offer (port 0) for \"{filename}\" is not supported")]
    UnsupportedPassiveTransfer { filename: String },

    /// A socket read or accept exceeded its configured bound.
    #[error("{operation} timed out after {timeout:?}")]
    ProtocolTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The peer misbehaved at the protocol level: closed the connection
    /// early, acknowledged bytes that were never sent, or sent a decreasing
    /// acknowledgment.
    #[error("peer error: {0}")]
    Peer(String),

    /// The transfer was terminated from outside the session.
    #[error("transfer stopped")]
    Stopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
