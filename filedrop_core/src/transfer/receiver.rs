use crate::error::TransferError;
use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::protocol::{ControlMessage, FileEntry, Frame, manifest_size};
use super::{CompletedFile, TransferEvent, TransferProgress, TransferRole, TransferSession};

/// Chunks of the file currently being received
#[derive(Debug)]
pub struct ReceiveBuffer {
    entry: FileEntry,
    chunks: Vec<Bytes>,
    received: u64,
}

impl ReceiveBuffer {
    pub fn new(entry: FileEntry) -> Self {
        Self {
            entry,
            chunks: Vec::new(),
            received: 0,
        }
    }

    pub fn entry(&self) -> &FileEntry {
        &self.entry
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.received += chunk.len() as u64;
        self.chunks.push(chunk);
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Concatenate the chunks in arrival order.
    pub fn finish(self) -> CompletedFile {
        let mut data = BytesMut::with_capacity(self.received as usize);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }
        CompletedFile {
            entry: self.entry,
            data: data.freeze(),
        }
    }
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Idle,
    AwaitingDecision {
        manifest: Vec<FileEntry>,
    },
    Receiving {
        session: TransferSession,
        buffer: Option<ReceiveBuffer>,
        files_started: usize,
    },
}

/// Receiving side of the protocol.
///
/// Pure state: frames go in, events come out, and the caller sends the
/// replies returned by [`Receiver::accept`] and [`Receiver::decline`].
/// Frames that do not fit the current phase are dropped.
#[derive(Debug, Default)]
pub struct Receiver {
    phase: Phase,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// True from the moment a manifest arrives until the batch ends.
    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    pub fn pending_manifest(&self) -> Option<&[FileEntry]> {
        match &self.phase {
            Phase::AwaitingDecision { manifest } => Some(manifest),
            _ => None,
        }
    }

    pub fn progress(&self) -> Option<TransferProgress> {
        match &self.phase {
            Phase::Receiving { session, .. } => Some(session.progress()),
            _ => None,
        }
    }

    /// Approve the pending manifest. Returns the reply for the peer.
    pub fn accept(&mut self) -> Result<ControlMessage, TransferError> {
        match std::mem::take(&mut self.phase) {
            Phase::AwaitingDecision { manifest } => {
                info!("Accepted batch of {} files", manifest.len());
                self.phase = Phase::Receiving {
                    session: TransferSession::new(manifest, TransferRole::Receiver),
                    buffer: None,
                    files_started: 0,
                };
                Ok(ControlMessage::Accept)
            }
            other => {
                self.phase = other;
                Err(TransferError::NoPendingManifest)
            }
        }
    }

    pub fn decline(&mut self) -> Result<ControlMessage, TransferError> {
        match std::mem::take(&mut self.phase) {
            Phase::AwaitingDecision { manifest } => {
                info!("Declined batch of {} files", manifest.len());
                Ok(ControlMessage::Decline)
            }
            other => {
                self.phase = other;
                Err(TransferError::NoPendingManifest)
            }
        }
    }

    /// Abandon the current batch locally. Returns false if there was none.
    ///
    /// The partial current file is dropped; files already emitted stay
    /// with the caller.
    pub fn cancel(&mut self) -> bool {
        if !self.is_busy() {
            return false;
        }
        info!("Cancelling incoming batch");
        self.phase = Phase::Idle;
        true
    }

    pub fn handle(&mut self, frame: Frame) -> Option<TransferEvent> {
        match frame {
            Frame::Control(msg) => self.handle_control(msg),
            Frame::Chunk(data) => self.handle_chunk(data),
            Frame::Unknown(text) => {
                debug!("Ignoring unrecognized text frame: {}", text);
                None
            }
        }
    }

    fn handle_control(&mut self, msg: ControlMessage) -> Option<TransferEvent> {
        match msg {
            ControlMessage::Metadata { files } => {
                if self.is_busy() {
                    warn!("New manifest replaces the batch in progress");
                }
                let total_bytes = manifest_size(&files);
                info!("Incoming batch: {} files, {} bytes", files.len(), total_bytes);
                self.phase = Phase::AwaitingDecision {
                    manifest: files.clone(),
                };
                Some(TransferEvent::IncomingManifest { files, total_bytes })
            }
            ControlMessage::FileStart {
                name,
                size,
                mime_type,
            } => {
                let Phase::Receiving {
                    session,
                    buffer,
                    files_started,
                } = &mut self.phase
                else {
                    warn!("file-start for {} outside an accepted batch", name);
                    return None;
                };
                if let Some(previous) = buffer.take() {
                    warn!(
                        "file-start before file-end, dropping {}",
                        previous.entry().name
                    );
                }
                let entry = FileEntry::new(name, size, mime_type);
                let index = *files_started;
                *files_started += 1;
                session.current_file_index = index;
                debug!("Receiving {} ({} bytes)", entry.name, entry.size);
                *buffer = Some(ReceiveBuffer::new(entry.clone()));
                Some(TransferEvent::FileStarted {
                    role: TransferRole::Receiver,
                    index,
                    entry,
                })
            }
            ControlMessage::FileEnd => {
                let Phase::Receiving { buffer, .. } = &mut self.phase else {
                    warn!("file-end outside an accepted batch");
                    return None;
                };
                let Some(buffer) = buffer.take() else {
                    warn!("file-end without an open file");
                    return None;
                };
                if buffer.received() != buffer.entry().size {
                    warn!(
                        "{} ended at {} of {} bytes, discarding",
                        buffer.entry().name,
                        buffer.received(),
                        buffer.entry().size
                    );
                    return Some(TransferEvent::Error(format!(
                        "{} arrived incomplete ({} of {} bytes)",
                        buffer.entry().name,
                        buffer.received(),
                        buffer.entry().size
                    )));
                }
                let file = buffer.finish();
                info!("Received {} ({} bytes)", file.entry.name, file.data.len());
                Some(TransferEvent::FileReceived(file))
            }
            ControlMessage::TransferComplete => {
                let Phase::Receiving { buffer, .. } = &self.phase else {
                    warn!("transfer-complete outside an accepted batch");
                    return None;
                };
                if let Some(partial) = buffer {
                    warn!(
                        "transfer-complete with {} still open, dropping it",
                        partial.entry().name
                    );
                }
                info!("Incoming batch complete");
                self.phase = Phase::Idle;
                Some(TransferEvent::BatchCompleted {
                    role: TransferRole::Receiver,
                })
            }
            ControlMessage::Cancel => {
                if !self.is_busy() {
                    debug!("cancel with no batch in progress");
                    return None;
                }
                info!("Peer cancelled the batch");
                self.phase = Phase::Idle;
                Some(TransferEvent::Cancelled { by_peer: true })
            }
            ControlMessage::Accept | ControlMessage::Decline => {
                debug!("Ignoring {:?} on the receiving side", msg);
                None
            }
        }
    }

    fn handle_chunk(&mut self, data: Bytes) -> Option<TransferEvent> {
        let Phase::Receiving {
            session,
            buffer: open,
            ..
        } = &mut self.phase
        else {
            debug!("Dropping {} byte chunk outside an accepted batch", data.len());
            return None;
        };
        let Some(buffer) = open.as_mut() else {
            debug!("Dropping {} byte chunk with no open file", data.len());
            return None;
        };

        // Chunks past the declared size drop the file; the rest of its
        // chunks are ignored until the next file-start
        let declared = buffer.entry().size;
        if buffer.received() + data.len() as u64 > declared {
            let name = buffer.entry().name.clone();
            warn!("{} overran its declared {} bytes, discarding", name, declared);
            *open = None;
            return Some(TransferEvent::Error(format!(
                "{} sent more than its declared {} bytes",
                name, declared
            )));
        }

        session.bytes_transferred += data.len() as u64;
        buffer.push(data);
        Some(TransferEvent::Progress {
            role: TransferRole::Receiver,
            progress: session.progress(),
        })
    }
}
