use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Lifecycle notifications delivered to the embedding client's event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum DccEvent {
    /// A peer accepted our chat invitation; the control connection is up.
    Request {
        address: IpAddr,
        port: u16,
        nick: String,
    },

    /// A generic CTCP sub-message, passed through unmodified.
    CtcpMessage { address: IpAddr, message: String },

    /// DCC traffic other than a well-formed SEND offer. The body is the text
    /// after the `DCC ` prefix.
    DccMessage { address: IpAddr, body: String },

    /// An inbound file offer that passed admission.
    FileRequest {
        nick: String,
        address: IpAddr,
        file: String,
        port: u16,
        size: Option<u64>,
    },

    /// Inbound transfer finished; `file` is the resolved destination path.
    FileRecvCompleted {
        address: IpAddr,
        port: u16,
        file: PathBuf,
        size: Option<u64>,
    },
    FileRecvCancelled {
        address: IpAddr,
        port: u16,
        file: PathBuf,
        error: String,
    },

    /// Outbound transfer finished; address/port identify our chat listener.
    FileSendCompleted {
        file: PathBuf,
        address: IpAddr,
        port: u16,
    },
    FileSendCancelled {
        address: IpAddr,
        port: u16,
        file: PathBuf,
        error: String,
    },
}

/// Wraps the client-owned event channel.
///
/// Emission never fails the caller: a closed or full bus is logged and
/// swallowed so delivery problems cannot mask the underlying transfer
/// outcome.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DccEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<DccEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: DccEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(event = ?e.0, "event bus closed, notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_survives_a_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        drop(rx);
        sink.emit(DccEvent::CtcpMessage {
            address: "127.0.0.1".parse().unwrap(),
            message: "VERSION".into(),
        });
    }
}
