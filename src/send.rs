//! Outbound transfer sessions.
//!
//! Sending is a three-step handshake. We invite the peer over IRC with a
//! `DCC CHAT` pointing at a listener we already hold open, accept the peer
//! there as a control connection, then advertise a fresh data listener over
//! that connection with a framed `DCC SEND`. File bytes flow on the data
//! connection under stop-and-wait: each chunk must be fully acknowledged
//! before the next is written, and an acknowledgment that moves backwards
//! or past what was sent ends the session as a peer error.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::Timeouts;
use crate::ctcp::{self, CtcpRequest};
use crate::error::DccError;
use crate::event::{DccEvent, EventSink};
use crate::registry::Completion;
use crate::CHUNK_SIZE;

/// Everything a send session needs to know up front. The chat listener
/// itself travels separately because it is already bound when the session
/// starts; its port is recorded here for the invitation.
pub(crate) struct SendRequest {
    pub(crate) nick: String,
    pub(crate) path: PathBuf,
    pub(crate) filename: String,
    pub(crate) size: u64,
    pub(crate) local_ip: Ipv4Addr,
    pub(crate) chat_port: u16,
}

/// Drive one outbound transfer, emit the outcome, and hand the completion
/// notice back to the coordinator.
pub(crate) async fn run(
    request: SendRequest,
    chat_listener: TcpListener,
    timeouts: Timeouts,
    events: EventSink,
    ctcp_tx: mpsc::UnboundedSender<CtcpRequest>,
    completion: Completion,
    completion_tx: mpsc::UnboundedSender<Completion>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let address = IpAddr::V4(request.local_ip);
    let port = request.chat_port;
    let path = request.path.clone();
    let nick = request.nick.clone();

    let outcome = tokio::select! {
        result = send_file(request, chat_listener, timeouts, &events, &ctcp_tx) => result,
        _ = &mut cancel_rx => Err(DccError::Stopped),
    };

    match outcome {
        Ok(()) => {
            info!("sent {} to {}", path.display(), nick);
            events.emit(DccEvent::FileSendCompleted {
                file: path,
                address,
                port,
            });
        }
        Err(e) => {
            warn!("send of {} to {} failed: {}", path.display(), nick, e);
            events.emit(DccEvent::FileSendCancelled {
                address,
                port,
                file: path,
                error: e.to_string(),
            });
        }
    }

    let _ = completion_tx.send(completion);
}

async fn send_file(
    request: SendRequest,
    chat_listener: TcpListener,
    timeouts: Timeouts,
    events: &EventSink,
    ctcp_tx: &mpsc::UnboundedSender<CtcpRequest>,
) -> Result<(), DccError> {
    let invitation = CtcpRequest {
        nick: request.nick.clone(),
        payload: ctcp::chat_invitation(request.local_ip, request.chat_port),
    };
    if ctcp_tx.send(invitation).is_err() {
        return Err(DccError::Peer(
            "IRC connection closed, cannot deliver invitation".to_string(),
        ));
    }

    let (mut control, peer) = bounded_accept(&chat_listener, timeouts.accept, "chat accept").await?;
    events.emit(DccEvent::Request {
        address: peer.ip(),
        port: peer.port(),
        nick: request.nick.clone(),
    });
    // One peer per invitation.
    drop(chat_listener);

    let data_listener = TcpListener::bind((request.local_ip, 0)).await?;
    let data_port = data_listener.local_addr()?.port();
    let advertisement = ctcp::frame(&ctcp::send_advertisement(
        &request.filename,
        request.local_ip,
        data_port,
        request.size,
    ));
    control.write_all(format!("{}\n", advertisement).as_bytes()).await?;

    let (mut data, _) = bounded_accept(&data_listener, timeouts.accept, "data accept").await?;
    drop(data_listener);

    stream_chunks(&request.path, request.size, &mut data, timeouts.read).await
}

/// Push the file through the data connection one chunk at a time, holding
/// each chunk until the peer's cumulative acknowledgment catches up. Reads
/// never pass the advertised size; a source that grew after the offer
/// streams only its first `size` bytes.
async fn stream_chunks(
    path: &Path,
    size: u64,
    stream: &mut TcpStream,
    read_timeout: Option<Duration>,
) -> Result<(), DccError> {
    let mut file = File::open(path).await?;
    let mut buf = [0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    let mut acked: u64 = 0;

    while sent < size {
        let cap = (size - sent).min(CHUNK_SIZE as u64) as usize;
        let n = file.read(&mut buf[..cap]).await?;
        if n == 0 {
            return Err(DccError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source file truncated at {} of {} bytes", sent, size),
            )));
        }
        stream.write_all(&buf[..n]).await?;
        sent += n as u64;

        while acked < sent {
            let ack = read_ack(stream, read_timeout).await?;
            if ack < acked {
                return Err(DccError::Peer(format!(
                    "acknowledgment went backwards: {} after {}",
                    ack, acked
                )));
            }
            if ack > sent {
                return Err(DccError::Peer(format!(
                    "acknowledged {} bytes but only {} were sent",
                    ack, sent
                )));
            }
            acked = ack;
        }
    }

    Ok(())
}

async fn read_ack(stream: &mut TcpStream, read_timeout: Option<Duration>) -> Result<u64, DccError> {
    let mut raw = [0u8; 4];
    match read_timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.read_exact(&mut raw)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                return Err(DccError::ProtocolTimeout {
                    operation: "acknowledgment read",
                    timeout: limit,
                })
            }
        },
        None => {
            stream.read_exact(&mut raw).await?;
        }
    }
    Ok(u64::from(u32::from_be_bytes(raw)))
}

async fn bounded_accept(
    listener: &TcpListener,
    limit: Option<Duration>,
    operation: &'static str,
) -> Result<(TcpStream, SocketAddr), DccError> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, listener.accept()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DccError::ProtocolTimeout {
                operation,
                timeout: limit,
            }),
        },
        None => Ok(listener.accept().await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctcp::{classify, split_frames, Classified};
    use crate::registry::Direction;
    use tokio::io::{AsyncBufReadExt, BufReader};

    struct Session {
        ctcp: mpsc::UnboundedReceiver<CtcpRequest>,
        events: mpsc::UnboundedReceiver<DccEvent>,
        completions: mpsc::UnboundedReceiver<Completion>,
        _cancel: oneshot::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn start(mut request: SendRequest, timeouts: Timeouts) -> (Session, u16) {
        let chat_listener = TcpListener::bind((request.local_ip, 0)).await.unwrap();
        request.chat_port = chat_listener.local_addr().unwrap().port();
        let chat_port = request.chat_port;
        let (ctcp_tx, ctcp) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (done_tx, completions) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = oneshot::channel();
        let completion = Completion {
            id: 3,
            direction: Direction::Send,
            address: IpAddr::V4(request.local_ip),
            port: chat_port,
        };
        let handle = tokio::spawn(run(
            request,
            chat_listener,
            timeouts,
            EventSink::new(event_tx),
            ctcp_tx,
            completion,
            done_tx,
            cancel_rx,
        ));
        (
            Session {
                ctcp,
                events,
                completions,
                _cancel: cancel,
                handle,
            },
            chat_port,
        )
    }

    fn request_for(path: &Path, size: u64) -> SendRequest {
        SendRequest {
            nick: "bob".into(),
            path: path.to_path_buf(),
            filename: "payload.bin".into(),
            size,
            local_ip: Ipv4Addr::LOCALHOST,
            chat_port: 0,
        }
    }

    async fn read_advertisement(control: &mut TcpStream) -> crate::ctcp::FileOffer {
        let mut reader = BufReader::new(control);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let frames = split_frames(line.as_bytes());
        assert_eq!(frames.len(), 1, "expected one framed advertisement: {:?}", line);
        match classify(frames[0]).unwrap() {
            Classified::FileOffer(offer) => offer,
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sends_a_file_through_the_invite_flow() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 199) as u8).collect();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, &payload).await.unwrap();

        let request = request_for(&path, payload.len() as u64);
        let size = request.size;
        let (mut session, chat_port) = start(
            request,
            Timeouts {
                read: Some(Duration::from_secs(5)),
                accept: Some(Duration::from_secs(5)),
            },
        )
        .await;

        let invite = session.ctcp.recv().await.unwrap();
        assert_eq!(invite.nick, "bob");
        assert_eq!(
            invite.payload,
            format!("DCC CHAT chat {} {}", u32::from(Ipv4Addr::LOCALHOST), chat_port)
        );

        let mut control = TcpStream::connect(("127.0.0.1", chat_port)).await.unwrap();
        let offer = read_advertisement(&mut control).await;
        assert_eq!(offer.filename, "payload.bin");
        assert_eq!(offer.size, size);

        let mut data = TcpStream::connect((offer.address, offer.port)).await.unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; CHUNK_SIZE];
        while (got.len() as u64) < size {
            let n = data.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed early at {} bytes", got.len());
            got.extend_from_slice(&buf[..n]);
            data.write_all(&(got.len() as u32).to_be_bytes())
                .await
                .unwrap();
        }
        assert_eq!(got, payload);

        session.handle.await.unwrap();
        match session.events.recv().await.unwrap() {
            DccEvent::Request { nick, .. } => assert_eq!(nick, "bob"),
            other => panic!("unexpected event: {:?}", other),
        }
        match session.events.recv().await.unwrap() {
            DccEvent::FileSendCompleted { file, port, .. } => {
                assert_eq!(file, path);
                assert_eq!(port, chat_port);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let done = session.completions.recv().await.unwrap();
        assert_eq!(done.id, 3);
    }

    #[tokio::test]
    async fn regressive_acknowledgment_fails_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![7u8; 6000];
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, &payload).await.unwrap();

        let request = request_for(&path, payload.len() as u64);
        let (mut session, chat_port) = start(
            request,
            Timeouts {
                read: Some(Duration::from_secs(5)),
                accept: Some(Duration::from_secs(5)),
            },
        )
        .await;

        session.ctcp.recv().await.unwrap();
        let mut control = TcpStream::connect(("127.0.0.1", chat_port)).await.unwrap();
        let offer = read_advertisement(&mut control).await;
        let mut data = TcpStream::connect((offer.address, offer.port)).await.unwrap();

        // Take the first chunk in full, accept it, then claim a regression.
        let mut taken = 0usize;
        let mut buf = [0u8; CHUNK_SIZE];
        while taken < CHUNK_SIZE {
            let n = data.read(&mut buf[..CHUNK_SIZE - taken]).await.unwrap();
            assert!(n > 0);
            taken += n;
        }
        data.write_all(&(CHUNK_SIZE as u32).to_be_bytes())
            .await
            .unwrap();
        data.write_all(&1000u32.to_be_bytes()).await.unwrap();

        session.handle.await.unwrap();
        match session.events.recv().await.unwrap() {
            DccEvent::Request { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
        match session.events.recv().await.unwrap() {
            DccEvent::FileSendCancelled { error, .. } => {
                assert!(error.contains("backwards"), "unexpected error: {}", error);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn a_grown_source_streams_only_the_advertised_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, &payload).await.unwrap();

        // Advertise less than what is on disk, as if the file grew after
        // its size was recorded.
        let advertised = 4000u64;
        let (mut session, chat_port) = start(
            request_for(&path, advertised),
            Timeouts {
                read: Some(Duration::from_secs(5)),
                accept: Some(Duration::from_secs(5)),
            },
        )
        .await;

        session.ctcp.recv().await.unwrap();
        let mut control = TcpStream::connect(("127.0.0.1", chat_port)).await.unwrap();
        let offer = read_advertisement(&mut control).await;
        assert_eq!(offer.size, advertised);

        let mut data = TcpStream::connect((offer.address, offer.port)).await.unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; CHUNK_SIZE];
        while (got.len() as u64) < advertised {
            let n = data.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed early at {} bytes", got.len());
            got.extend_from_slice(&buf[..n]);
            data.write_all(&(got.len() as u32).to_be_bytes())
                .await
                .unwrap();
        }
        assert_eq!(got, payload[..advertised as usize]);

        session.handle.await.unwrap();
        match session.events.recv().await.unwrap() {
            DccEvent::Request { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
        match session.events.recv().await.unwrap() {
            DccEvent::FileSendCompleted { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unanswered_invitation_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"data").await.unwrap();

        let (mut session, _) = start(
            request_for(&path, 4),
            Timeouts {
                read: None,
                accept: Some(Duration::from_millis(100)),
            },
        )
        .await;

        session.ctcp.recv().await.unwrap();
        session.handle.await.unwrap();
        match session.events.recv().await.unwrap() {
            DccEvent::FileSendCancelled { error, .. } => {
                assert!(error.contains("timed out"), "unexpected error: {}", error);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(session.completions.recv().await.is_some());
    }

    #[tokio::test]
    async fn closed_irc_channel_fails_before_listening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"data").await.unwrap();

        let mut request = request_for(&path, 4);
        let chat_listener = TcpListener::bind((request.local_ip, 0)).await.unwrap();
        request.chat_port = chat_listener.local_addr().unwrap().port();
        let port = request.chat_port;

        let (ctcp_tx, ctcp_rx) = mpsc::unbounded_channel();
        drop(ctcp_rx);
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let (done_tx, mut completions) = mpsc::unbounded_channel();
        let (_cancel, cancel_rx) = oneshot::channel();

        run(
            request,
            chat_listener,
            Timeouts {
                read: None,
                accept: None,
            },
            EventSink::new(event_tx),
            ctcp_tx,
            Completion {
                id: 3,
                direction: Direction::Send,
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
            },
            done_tx,
            cancel_rx,
        )
        .await;

        match events.recv().await.unwrap() {
            DccEvent::FileSendCancelled { error, .. } => {
                assert!(
                    error.contains("IRC connection closed"),
                    "unexpected error: {}",
                    error
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(completions.recv().await.is_some());
    }
}
