use crate::channel::{DataChannel, Inbox};
use crate::error::TransferError;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::constants::{BACKPRESSURE_POLL_MS, BACKPRESSURE_THRESHOLD, CHUNK_SIZE, DEFAULT_MIME_TYPE};
use super::protocol::{ControlMessage, FileEntry, Frame, send_control};
use super::{TransferEvent, TransferRole, TransferSession};

/// How a batch ended, short of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Declined,
    Cancelled { by_peer: bool },
}

#[derive(Debug, Clone)]
enum FileSource {
    Memory(Bytes),
    Path(PathBuf),
}

/// A file queued for sending
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub entry: FileEntry,
    source: FileSource,
}

impl OutgoingFile {
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            entry: FileEntry::new(name, data.len() as u64, mime_type),
            source: FileSource::Memory(data),
        }
    }

    /// Stat a file on disk; its bytes are read chunk by chunk while sending.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid file name")
            })?
            .to_string();
        let mime_type = guess_mime_type(&name);

        Ok(Self {
            entry: FileEntry::new(name, metadata.len(), mime_type),
            source: FileSource::Path(path.to_path_buf()),
        })
    }
}

/// MIME type from the file extension, for the handful of types receivers
/// commonly preview
pub fn guess_mime_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// Yields a file's bytes in `CHUNK_SIZE` pieces, the last one holding the
/// remainder
enum ChunkReader {
    Memory { data: Bytes, offset: usize },
    Disk { file: File, remaining: u64 },
}

impl ChunkReader {
    async fn open(file: &OutgoingFile) -> std::io::Result<Self> {
        match &file.source {
            FileSource::Memory(data) => Ok(ChunkReader::Memory {
                data: data.clone(),
                offset: 0,
            }),
            FileSource::Path(path) => Ok(ChunkReader::Disk {
                file: File::open(path).await?,
                remaining: file.entry.size,
            }),
        }
    }

    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        match self {
            ChunkReader::Memory { data, offset } => {
                if *offset >= data.len() {
                    return Ok(None);
                }
                let end = (*offset + CHUNK_SIZE).min(data.len());
                let chunk = data.slice(*offset..end);
                *offset = end;
                Ok(Some(chunk))
            }
            ChunkReader::Disk { file, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let want = (*remaining).min(CHUNK_SIZE as u64) as usize;
                let mut buffer = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    let n = file.read(&mut buffer[filled..]).await?;
                    if n == 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "File shrank while sending",
                        ));
                    }
                    filled += n;
                }
                *remaining -= want as u64;
                Ok(Some(Bytes::from(buffer)))
            }
        }
    }
}

enum Decision {
    Accepted,
    Declined,
    PeerCancelled,
    ChannelClosed,
}

/// Read the inbox until the peer answers the manifest. Anything else is
/// ignored.
async fn wait_for_decision(inbox: &mut Inbox) -> Decision {
    while let Some(msg) = inbox.recv().await {
        match Frame::from(msg) {
            Frame::Control(ControlMessage::Accept) => return Decision::Accepted,
            Frame::Control(ControlMessage::Decline) => return Decision::Declined,
            Frame::Control(ControlMessage::Cancel) => return Decision::PeerCancelled,
            other => debug!("Ignoring frame while awaiting decision: {:?}", other),
        }
    }
    Decision::ChannelClosed
}

/// Drain whatever the peer sent during streaming. Returns true if it
/// cancelled.
fn peer_cancelled(inbox: &mut Inbox) -> Result<bool, TransferError> {
    loop {
        match inbox.try_recv() {
            Ok(msg) => match Frame::from(msg) {
                Frame::Control(ControlMessage::Cancel) => return Ok(true),
                other => debug!("Ignoring frame while sending: {:?}", other),
            },
            Err(TryRecvError::Empty) => return Ok(false),
            Err(TryRecvError::Disconnected) => return Err(TransferError::ChannelClosed),
        }
    }
}

/// Suspend until the outbound buffer drains to the threshold.
async fn wait_for_drain<C: DataChannel>(channel: &C, cancel: &CancellationToken) {
    while channel.buffered_amount().await > BACKPRESSURE_THRESHOLD {
        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(BACKPRESSURE_POLL_MS)).await;
    }
}

async fn send_cancel<C: DataChannel>(channel: &C) -> Result<BatchOutcome, TransferError> {
    info!("Cancelling outgoing batch");
    send_control(channel, &ControlMessage::Cancel)
        .await
        .map_err(TransferError::Channel)?;
    Ok(BatchOutcome::Cancelled { by_peer: false })
}

/// Send one batch: announce it, wait for the peer's decision, then stream
/// every file in manifest order.
///
/// A timeout or decline leaves the channel open for a later batch.
pub async fn send_batch<C: DataChannel>(
    channel: &C,
    inbox: &mut Inbox,
    files: Vec<OutgoingFile>,
    accept_timeout: Duration,
    event_tx: &mpsc::Sender<TransferEvent>,
    cancel: &CancellationToken,
) -> Result<BatchOutcome, TransferError> {
    let manifest: Vec<FileEntry> = files.iter().map(|f| f.entry.clone()).collect();
    let mut session = TransferSession::new(manifest.clone(), TransferRole::Sender);

    info!(
        "Offering {} files ({} bytes)",
        manifest.len(),
        session.total_bytes
    );
    send_control(channel, &ControlMessage::Metadata { files: manifest })
        .await
        .map_err(TransferError::Channel)?;

    let decision = tokio::select! {
        _ = cancel.cancelled() => return send_cancel(channel).await,
        decision = tokio::time::timeout(accept_timeout, wait_for_decision(inbox)) => decision,
    };
    match decision {
        Err(_) => {
            warn!("No answer to the offer within {:?}", accept_timeout);
            // Withdraw the offer so the peer stops waiting on a decision
            send_control(channel, &ControlMessage::Cancel)
                .await
                .map_err(TransferError::Channel)?;
            return Err(TransferError::AcceptanceTimeout);
        }
        Ok(Decision::Accepted) => info!("Peer accepted the batch"),
        Ok(Decision::Declined) => {
            info!("Peer declined the batch");
            return Ok(BatchOutcome::Declined);
        }
        Ok(Decision::PeerCancelled) => return Ok(BatchOutcome::Cancelled { by_peer: true }),
        Ok(Decision::ChannelClosed) => return Err(TransferError::ChannelClosed),
    }

    for (index, file) in files.iter().enumerate() {
        session.current_file_index = index;
        let _ = event_tx
            .send(TransferEvent::FileStarted {
                role: TransferRole::Sender,
                index,
                entry: file.entry.clone(),
            })
            .await;

        let mut reader = ChunkReader::open(file).await?;
        send_control(channel, &ControlMessage::file_start(&file.entry))
            .await
            .map_err(TransferError::Channel)?;
        debug!("Sending {} ({} bytes)", file.entry.name, file.entry.size);

        while let Some(chunk) = reader.next_chunk().await? {
            if cancel.is_cancelled() {
                return send_cancel(channel).await;
            }
            if peer_cancelled(inbox)? {
                info!("Peer cancelled the batch");
                return Ok(BatchOutcome::Cancelled { by_peer: true });
            }

            wait_for_drain(channel, cancel).await;
            if cancel.is_cancelled() {
                return send_cancel(channel).await;
            }

            let len = chunk.len() as u64;
            channel
                .send_binary(chunk)
                .await
                .map_err(TransferError::Channel)?;
            session.bytes_transferred += len;

            let _ = event_tx
                .send(TransferEvent::Progress {
                    role: TransferRole::Sender,
                    progress: session.progress(),
                })
                .await;
        }

        send_control(channel, &ControlMessage::FileEnd)
            .await
            .map_err(TransferError::Channel)?;
    }

    send_control(channel, &ControlMessage::TransferComplete)
        .await
        .map_err(TransferError::Channel)?;
    info!(
        "Batch sent: {} files, {} bytes",
        files.len(),
        session.bytes_transferred
    );
    Ok(BatchOutcome::Completed)
}
