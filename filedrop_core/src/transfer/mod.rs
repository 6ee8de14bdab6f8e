//! File transfer over an open data channel.
//!
//! This module provides:
//! - The control message vocabulary and frame classification
//! - The sending side (metadata, acceptance wait, chunk streaming)
//! - The receiving side state machine (manifest, buffers, reassembly)
//! - An engine task owning the channel, driven by commands
//! - Persistence of completed files

pub mod constants;
pub mod engine;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod storage;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use constants::{BACKPRESSURE_THRESHOLD, CHUNK_SIZE};
pub use engine::{EngineConfig, TransferCommand, TransferEngine, TransferHandle};
pub use protocol::{ControlMessage, FileEntry, Frame};
pub use receiver::{ReceiveBuffer, Receiver};
pub use sender::{BatchOutcome, OutgoingFile, send_batch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferRole {
    Sender,
    Receiver,
}

/// Batch-wide progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// `bytes_transferred / total_bytes * 100`; NaN when `total_bytes` is 0
    pub percentage: f64,
}

impl TransferProgress {
    pub fn new(bytes_transferred: u64, total_bytes: u64) -> Self {
        Self {
            bytes_transferred,
            total_bytes,
            percentage: bytes_transferred as f64 / total_bytes as f64 * 100.0,
        }
    }
}

/// State of one accept/decline cycle.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub manifest: Vec<FileEntry>,
    pub role: TransferRole,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub current_file_index: usize,
}

impl TransferSession {
    pub fn new(manifest: Vec<FileEntry>, role: TransferRole) -> Self {
        let total_bytes = protocol::manifest_size(&manifest);
        Self {
            manifest,
            role,
            bytes_transferred: 0,
            total_bytes,
            current_file_index: 0,
        }
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress::new(self.bytes_transferred, self.total_bytes)
    }
}

/// A fully reassembled file, ready for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub entry: FileEntry,
    pub data: Bytes,
}

/// Reports from the transfer engine to the UI layer
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Peer proposed a batch; answer with accept or decline
    IncomingManifest {
        files: Vec<FileEntry>,
        total_bytes: u64,
    },
    FileStarted {
        role: TransferRole,
        index: usize,
        entry: FileEntry,
    },
    Progress {
        role: TransferRole,
        progress: TransferProgress,
    },
    /// Receiver: a file was reassembled
    FileReceived(CompletedFile),
    /// Receiver: a file was written to the download directory
    FileSaved { name: String, path: PathBuf },
    BatchCompleted { role: TransferRole },
    /// Sender: the peer declined the batch
    Declined,
    Cancelled { by_peer: bool },
    /// Sender: no answer within the acceptance window
    AcceptanceTimeout,
    Error(String),
}
