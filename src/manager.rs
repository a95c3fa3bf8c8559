//! DCC coordination.
//!
//! All transfer state lives in a single coordinator task that owns the
//! registry. The rest of the application talks to it through a [`DccManager`]
//! handle over a command channel, and transfer sessions run as separate
//! tasks that report back on a completion channel. The coordinator is the
//! only writer of transfer state, so admission checks, takeovers, and
//! registry updates never race.

use anyhow::{Context, Result};
use chrono::Local;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DccConfig, Timeouts};
use crate::ctcp::{self, Classified, CtcpRequest, FileOffer};
use crate::error::DccError;
use crate::event::{DccEvent, EventSink};
use crate::registry::{ActiveTransfer, Completion, Direction, Registry, TransferSnapshot};
use crate::send::SendRequest;
use crate::{admission::AdmissionPolicy, receive, security, send};

enum Command {
    Message {
        nick: String,
        address: IpAddr,
        data: Vec<u8>,
    },
    SendFile {
        nick: String,
        path: PathBuf,
        reply: oneshot::Sender<Result<(IpAddr, u16)>>,
    },
    Stop {
        address: IpAddr,
        port: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<TransferSnapshot>>,
    },
    Shutdown,
}

/// Handle to the DCC coordinator.
///
/// Cheap to use from anywhere in the application; all methods forward to
/// the coordinator task. Dropping the handle closes the command channel,
/// which the coordinator treats like [`DccManager::shutdown`]: active
/// transfers are cancelled and their cancellation events delivered.
pub struct DccManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    coordinator: JoinHandle<()>,
}

impl DccManager {
    /// Spawn the coordinator. Events surface on `event_tx`; outbound CTCP
    /// payloads (chat invitations) are handed to `ctcp_tx` for the IRC
    /// connection to deliver.
    pub fn new(
        config: DccConfig,
        event_tx: mpsc::UnboundedSender<DccEvent>,
        ctcp_tx: mpsc::UnboundedSender<CtcpRequest>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            policy: config.admission_policy(),
            timeouts: config.timeouts(),
            config,
            events: EventSink::new(event_tx),
            ctcp_tx,
            registry: Registry::default(),
            completion_tx,
            next_id: 0,
        };
        let handle = tokio::spawn(coordinator.run(cmd_rx, completion_rx));
        Self {
            cmd_tx,
            coordinator: handle,
        }
    }

    /// Feed a raw PRIVMSG/NOTICE body through CTCP processing. Fire and
    /// forget; anything noteworthy comes back as an event.
    pub fn handle_message(&self, nick: &str, address: IpAddr, data: &[u8]) {
        let _ = self.cmd_tx.send(Command::Message {
            nick: nick.to_string(),
            address,
            data: data.to_vec(),
        });
    }

    /// Offer a file to a nick. Returns the `(address, port)` key of the new
    /// send session, which is also the key accepted by
    /// [`DccManager::stop_transfer`].
    pub async fn send_file(&self, nick: &str, path: impl Into<PathBuf>) -> Result<(IpAddr, u16)> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendFile {
                nick: nick.to_string(),
                path: path.into(),
                reply,
            })
            .map_err(|_| anyhow::anyhow!("DCC coordinator is not running"))?;
        response
            .await
            .map_err(|_| anyhow::anyhow!("DCC coordinator dropped the request"))?
    }

    /// Stop the transfer keyed by `(address, port)`. The entry is removed
    /// before the session task is joined, so the key is free for reuse as
    /// soon as this returns.
    pub async fn stop_transfer(&self, address: IpAddr, port: u16) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop {
                address,
                port,
                reply,
            })
            .map_err(|_| anyhow::anyhow!("DCC coordinator is not running"))?;
        response
            .await
            .map_err(|_| anyhow::anyhow!("DCC coordinator dropped the request"))?
    }

    /// Snapshot of the active transfers, oldest first.
    pub async fn active_transfers(&self) -> Vec<TransferSnapshot> {
        let (reply, response) = oneshot::channel();
        if self.cmd_tx.send(Command::List { reply }).is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Terminate every active session, then the coordinator itself. Returns
    /// once both are done; sessions get their cancellation events out
    /// before the coordinator goes away.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let _ = self.coordinator.await;
    }
}

struct Coordinator {
    config: DccConfig,
    policy: AdmissionPolicy,
    timeouts: Timeouts,
    events: EventSink,
    ctcp_tx: mpsc::UnboundedSender<CtcpRequest>,
    registry: Registry,
    completion_tx: mpsc::UnboundedSender<Completion>,
    next_id: u64,
}

impl Coordinator {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut completion_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if matches!(cmd, Command::Shutdown) {
                        break;
                    }
                    self.on_command(cmd).await;
                }
                Some(done) = completion_rx.recv() => self.collect(done),
            }
        }
        self.terminate_all().await;
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Message {
                nick,
                address,
                data,
            } => self.on_message(&nick, address, &data).await,
            Command::SendFile { nick, path, reply } => {
                let _ = reply.send(self.start_send(&nick, path).await);
            }
            Command::Stop {
                address,
                port,
                reply,
            } => {
                let _ = reply.send(self.stop(address, port).await);
            }
            Command::List { reply } => {
                let _ = reply.send(self.registry.snapshots());
            }
            Command::Shutdown => {}
        }
    }

    async fn on_message(&mut self, nick: &str, address: IpAddr, data: &[u8]) {
        for frame in ctcp::split_frames(data) {
            match ctcp::classify(frame) {
                Ok(Classified::FileOffer(offer)) => self.on_file_offer(nick, offer).await,
                Ok(Classified::Dcc(body)) => {
                    self.events.emit(DccEvent::DccMessage { address, body });
                }
                Ok(Classified::Ctcp(message)) => {
                    self.events.emit(DccEvent::CtcpMessage { address, message });
                }
                Err(e) => warn!("dropped CTCP frame from {} ({}): {}", nick, address, e),
            }
        }
    }

    async fn on_file_offer(&mut self, nick: &str, offer: FileOffer) {
        if let Err(e) = self.screen_offer(nick, &offer) {
            warn!("{}", e);
            return;
        }
        self.events.emit(DccEvent::FileRequest {
            nick: nick.to_string(),
            address: offer.address,
            file: offer.filename.clone(),
            port: offer.port,
            size: Some(offer.size),
        });
        self.start_receive(offer).await;
    }

    /// Gatekeeping for inbound offers. Denials never reach the event bus;
    /// peers learn nothing about why an offer went unanswered.
    fn screen_offer(&self, nick: &str, offer: &FileOffer) -> Result<(), DccError> {
        let denied = |reason: String| DccError::AdmissionDenied {
            nick: nick.to_string(),
            address: offer.address,
            reason,
        };
        if self.config.reject_private_ips && security::is_private_ip(&offer.address) {
            return Err(denied("private or loopback address".to_string()));
        }
        if offer.size > self.config.max_file_size {
            return Err(denied(format!(
                "advertised size {} exceeds the {} byte limit",
                offer.size, self.config.max_file_size
            )));
        }
        if !self
            .policy
            .allowed(offer.address, nick, self.registry.receive_count())
        {
            return Err(denied("address or nick policy".to_string()));
        }
        Ok(())
    }

    async fn start_receive(&mut self, offer: FileOffer) {
        let key = (offer.address, offer.port);
        self.takeover(key).await;

        let id = self.next_session_id();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let completion = Completion {
            id,
            direction: Direction::Receive,
            address: offer.address,
            port: offer.port,
        };
        let filename = offer.filename.clone();
        info!(
            "receiving \"{}\" ({} bytes) from {}:{}",
            filename, offer.size, offer.address, offer.port
        );
        let handle = tokio::spawn(receive::run(
            offer,
            self.config.download_dir.clone(),
            self.timeouts.read,
            self.events.clone(),
            completion,
            self.completion_tx.clone(),
            cancel_rx,
        ));
        self.registry.insert(
            key,
            ActiveTransfer {
                id,
                direction: Direction::Receive,
                filename,
                started_at: Local::now(),
                cancel_tx,
                handle,
            },
        );
    }

    async fn start_send(&mut self, nick: &str, path: PathBuf) -> Result<(IpAddr, u16)> {
        let local_ip = self.config.local_ip.ok_or_else(|| {
            anyhow::anyhow!("local_ip is not configured; set it to the address peers can reach")
        })?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if !metadata.is_file() {
            return Err(anyhow::anyhow!("{} is not a regular file", path.display()));
        }
        let size = metadata.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))?;

        let chat_listener = TcpListener::bind((local_ip, 0))
            .await
            .with_context(|| format!("Failed to bind a chat listener on {}", local_ip))?;
        let chat_port = chat_listener.local_addr()?.port();

        let key = (IpAddr::V4(local_ip), chat_port);
        self.takeover(key).await;

        let id = self.next_session_id();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let completion = Completion {
            id,
            direction: Direction::Send,
            address: key.0,
            port: key.1,
        };
        let request = SendRequest {
            nick: nick.to_string(),
            path,
            filename: filename.clone(),
            size,
            local_ip,
            chat_port,
        };
        info!(
            "offering \"{}\" ({} bytes) to {}, chat listener {}:{}",
            filename, size, nick, local_ip, chat_port
        );
        let handle = tokio::spawn(send::run(
            request,
            chat_listener,
            self.timeouts,
            self.events.clone(),
            self.ctcp_tx.clone(),
            completion,
            self.completion_tx.clone(),
            cancel_rx,
        ));
        self.registry.insert(
            key,
            ActiveTransfer {
                id,
                direction: Direction::Send,
                filename,
                started_at: Local::now(),
                cancel_tx,
                handle,
            },
        );
        Ok(key)
    }

    /// A new transfer claims a key that is still occupied: the old session
    /// is terminated and its entry dropped before the new one goes in.
    async fn takeover(&mut self, key: (IpAddr, u16)) {
        if let Some(old) = self.registry.remove(&key) {
            info!(
                "replacing {} transfer of \"{}\" for {}:{}",
                old.direction, old.filename, key.0, key.1
            );
            old.terminate().await;
        }
    }

    async fn stop(&mut self, address: IpAddr, port: u16) -> Result<()> {
        match self.registry.remove(&(address, port)) {
            Some(active) => {
                info!(
                    "stopping {} transfer of \"{}\" for {}:{}",
                    active.direction, active.filename, address, port
                );
                active.terminate().await;
                Ok(())
            }
            None => Err(anyhow::anyhow!("No active transfer for {}:{}", address, port)),
        }
    }

    /// A session reported its own exit. Only the entry it belongs to is
    /// removed; after a takeover the key holds a successor with a different
    /// id, and a stopped session's entry is already gone.
    fn collect(&mut self, done: Completion) {
        match self.registry.remove(&(done.address, done.port)) {
            Some(entry) if entry.id == done.id => {
                debug!(
                    "{} transfer for {}:{} finished",
                    done.direction, done.address, done.port
                );
            }
            Some(successor) => {
                self.registry.insert((done.address, done.port), successor);
            }
            None => debug!(
                "completion for already removed transfer {}:{}",
                done.address, done.port
            ),
        }
    }

    async fn terminate_all(&mut self) {
        let active = self.registry.drain();
        if !active.is_empty() {
            info!("terminating {} active transfer(s)", active.len());
        }
        futures::future::join_all(active.into_iter().map(ActiveTransfer::terminate)).await;
    }

    fn next_session_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}
