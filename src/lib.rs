//! DCC transfer subsystem for IRC clients.
//!
//! Implements the client-to-client side of IRC: CTCP frame parsing,
//! `DCC SEND` receive and send sessions with cumulative acknowledgments,
//! admission screening for inbound offers, and a single-writer coordinator
//! that tracks every active transfer. The embedding client feeds raw
//! message bodies in through [`DccManager::handle_message`] and reacts to
//! the [`DccEvent`]s coming out; everything in between happens on
//! background tasks.

pub mod admission;
pub mod config;
pub mod ctcp;
pub mod error;
pub mod event;
pub mod logging;
pub mod manager;
mod receive;
pub mod registry;
mod send;
pub mod security;

pub use admission::AdmissionPolicy;
pub use config::{load_config, save_config, DccConfig, LoggingConfig, Timeouts};
pub use ctcp::CtcpRequest;
pub use error::DccError;
pub use event::DccEvent;
pub use logging::{init_tracing, TransferLogger};
pub use manager::DccManager;
pub use registry::{Direction, TransferSnapshot};

/// Chunk size for socket and file I/O in both transfer directions.
pub const CHUNK_SIZE: usize = 4096;
