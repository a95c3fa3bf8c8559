use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::ctcp::FileOffer;
use crate::error::DccError;
use crate::event::{DccEvent, EventSink};
use crate::registry::Completion;
use crate::{security, CHUNK_SIZE};

/// Drive one inbound transfer to completion, cancellation, or failure, then
/// report the outcome on the event bus and hand the completion notice back
/// to the coordinator.
pub(crate) async fn run(
    offer: FileOffer,
    download_root: PathBuf,
    read_timeout: Option<Duration>,
    events: EventSink,
    completion: Completion,
    completion_tx: mpsc::UnboundedSender<Completion>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let outcome = tokio::select! {
        result = receive_file(&offer, &download_root, read_timeout) => result,
        _ = &mut cancel_rx => Err(DccError::Stopped),
    };

    match outcome {
        Ok((destination, received)) => {
            info!(
                "received {} ({} bytes) from {}:{}",
                destination.display(),
                received,
                offer.address,
                offer.port
            );
            events.emit(DccEvent::FileRecvCompleted {
                address: offer.address,
                port: offer.port,
                file: destination,
                size: Some(received),
            });
        }
        Err(e) => {
            warn!(
                "receive of \"{}\" from {}:{} failed: {}",
                offer.filename, offer.address, offer.port, e
            );
            events.emit(DccEvent::FileRecvCancelled {
                address: offer.address,
                port: offer.port,
                file: download_root.join(&offer.filename),
                error: e.to_string(),
            });
        }
    }

    let _ = completion_tx.send(completion);
}

/// Connect back to the offering peer and pull the advertised bytes.
///
/// The destination is resolved inside the download root before any socket
/// is opened, so a hostile filename never causes a connection. Reads stop
/// at the advertised size and every chunk is acknowledged with the
/// cumulative byte count, 32-bit big-endian.
async fn receive_file(
    offer: &FileOffer,
    download_root: &Path,
    read_timeout: Option<Duration>,
) -> Result<(PathBuf, u64), DccError> {
    tokio::fs::create_dir_all(download_root).await?;
    let destination = security::resolve_destination(download_root, &offer.filename)?;

    let mut stream = TcpStream::connect((offer.address, offer.port)).await?;
    let mut file = File::create(&destination).await?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    while received < offer.size {
        let cap = (offer.size - received).min(CHUNK_SIZE as u64) as usize;
        let n = bounded_read(&mut stream, &mut buf[..cap], read_timeout).await?;
        if n == 0 {
            return Err(DccError::Peer(format!(
                "connection closed after {} of {} bytes",
                received, offer.size
            )));
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
        stream.write_all(&(received as u32).to_be_bytes()).await?;
    }
    file.flush().await?;

    Ok((destination, received))
}

async fn bounded_read(
    stream: &mut TcpStream,
    buf: &mut [u8],
    read_timeout: Option<Duration>,
) -> Result<usize, DccError> {
    match read_timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.read(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DccError::ProtocolTimeout {
                operation: "socket read",
                timeout: limit,
            }),
        },
        None => Ok(stream.read(buf).await?),
    }
}
