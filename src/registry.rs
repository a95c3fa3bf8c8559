//! Bookkeeping for running transfer sessions.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

/// How long a cancelled session gets to unwind before its task is aborted.
const JOIN_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Receive,
    Send,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Receive => write!(f, "receive"),
            Direction::Send => write!(f, "send"),
        }
    }
}

/// Completion notice a session task sends just before it exits. The id ties
/// the notice to the registry entry it belongs to, so a late notice from a
/// replaced session cannot evict its successor at the same key.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) id: u64,
    pub(crate) direction: Direction,
    pub(crate) address: IpAddr,
    pub(crate) port: u16,
}

/// A running session: its cancel signal, its task handle, and what it is
/// doing for display purposes.
pub(crate) struct ActiveTransfer {
    pub(crate) id: u64,
    pub(crate) direction: Direction,
    pub(crate) filename: String,
    pub(crate) started_at: DateTime<Local>,
    pub(crate) cancel_tx: oneshot::Sender<()>,
    pub(crate) handle: JoinHandle<()>,
}

impl ActiveTransfer {
    /// Signal the session to stop and wait briefly for it to unwind. A
    /// session that ignores the signal is aborted; either way the task is
    /// joined before this returns.
    pub(crate) async fn terminate(self) {
        let ActiveTransfer {
            cancel_tx,
            mut handle,
            direction,
            filename,
            ..
        } = self;
        let _ = cancel_tx.send(());
        match tokio::time::timeout(JOIN_WAIT, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} session for {} ended abnormally: {}", direction, filename, e),
            Err(_) => {
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

/// Point-in-time view of one active transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
    pub address: IpAddr,
    pub port: u16,
    pub direction: Direction,
    pub filename: String,
    pub started_at: DateTime<Local>,
}

/// Table of running sessions keyed by the peer half of the transfer,
/// `(address, port)`. One transfer per key; starting another on the same
/// key replaces the old entry.
#[derive(Default)]
pub(crate) struct Registry {
    active: HashMap<(IpAddr, u16), ActiveTransfer>,
}

impl Registry {
    pub(crate) fn insert(&mut self, key: (IpAddr, u16), transfer: ActiveTransfer) {
        self.active.insert(key, transfer);
    }

    pub(crate) fn remove(&mut self, key: &(IpAddr, u16)) -> Option<ActiveTransfer> {
        self.active.remove(key)
    }

    /// Inbound sessions currently running; this is the count the admission
    /// cap compares against.
    pub(crate) fn receive_count(&self) -> usize {
        self.active
            .values()
            .filter(|t| t.direction == Direction::Receive)
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn snapshots(&self) -> Vec<TransferSnapshot> {
        let mut list: Vec<TransferSnapshot> = self
            .active
            .iter()
            .map(|(&(address, port), t)| TransferSnapshot {
                address,
                port,
                direction: t.direction,
                filename: t.filename.clone(),
                started_at: t.started_at,
            })
            .collect();
        list.sort_by_key(|s| s.started_at);
        list
    }

    pub(crate) fn drain(&mut self) -> Vec<ActiveTransfer> {
        self.active.drain().map(|(_, t)| t).collect()
    }
}
