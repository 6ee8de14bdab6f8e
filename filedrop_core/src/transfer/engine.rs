use crate::channel::{DataChannel, Inbox, OpenChannel};
use crate::config::AppConfig;
use crate::error::TransferError;
use anyhow::{Result, anyhow};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::constants::ACCEPT_TIMEOUT_SECS;
use super::protocol::{ControlMessage, Frame, send_control};
use super::receiver::Receiver;
use super::sender::{BatchOutcome, OutgoingFile, send_batch};
use super::storage::save_completed_file;
use super::{TransferEvent, TransferRole};

/// Requests from the UI to the engine
#[derive(Debug)]
pub enum TransferCommand {
    SendFiles(Vec<OutgoingFile>),
    /// Accept the pending incoming manifest
    Accept,
    /// Decline the pending incoming manifest
    Decline,
    /// Abort whichever batch is in progress
    Cancel,
}

/// Cloneable control handle for a running [`TransferEngine`].
#[derive(Debug, Clone)]
pub struct TransferHandle {
    cmd_tx: mpsc::Sender<TransferCommand>,
}

impl TransferHandle {
    async fn send(&self, cmd: TransferCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("Transfer engine has stopped"))
    }

    pub async fn send_files(&self, files: Vec<OutgoingFile>) -> Result<()> {
        self.send(TransferCommand::SendFiles(files)).await
    }

    pub async fn accept(&self) -> Result<()> {
        self.send(TransferCommand::Accept).await
    }

    pub async fn decline(&self) -> Result<()> {
        self.send(TransferCommand::Decline).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.send(TransferCommand::Cancel).await
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub accept_timeout: Duration,
    /// Received files are written here when set
    pub download_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(ACCEPT_TIMEOUT_SECS),
            download_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            accept_timeout: config.accept_timeout(),
            download_dir: Some(config.download_path.clone()),
        }
    }
}

/// Owns an open data channel for the data phase of a session.
///
/// Both directions share the channel: while a batch is going out, incoming
/// frames are consumed by the sender, and `SendFiles` is refused while an
/// incoming batch is pending or streaming.
pub struct TransferEngine<C: DataChannel> {
    channel: C,
    inbox: Inbox,
    config: EngineConfig,
    receiver: Receiver,
    event_tx: mpsc::Sender<TransferEvent>,
}

impl<C: DataChannel> TransferEngine<C> {
    pub fn spawn(
        open: OpenChannel<C>,
        config: EngineConfig,
        event_tx: mpsc::Sender<TransferEvent>,
    ) -> (TransferHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let engine = Self {
            channel: open.channel,
            inbox: open.inbox,
            config,
            receiver: Receiver::new(),
            event_tx,
        };
        let task = tokio::spawn(engine.run(cmd_rx));
        (TransferHandle { cmd_tx }, task)
    }

    async fn emit(&self, event: TransferEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<TransferCommand>) {
        info!("Transfer engine started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &mut cmd_rx).await,
                    None => {
                        debug!("All transfer handles dropped");
                        break;
                    }
                },
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle_frame(Frame::from(msg)).await,
                    None => {
                        if self.receiver.is_busy() {
                            self.emit(TransferEvent::Error(TransferError::ChannelClosed.to_string()))
                                .await;
                        }
                        break;
                    }
                },
            }

            if !self.channel.is_open() {
                break;
            }
        }

        if let Err(e) = self.channel.close().await {
            warn!("Failed to close data channel: {}", e);
        }
        info!("Transfer engine stopped");
    }

    async fn reply(&self, msg: ControlMessage) {
        if let Err(e) = send_control(&self.channel, &msg).await {
            warn!("Failed to send {:?}: {}", msg, e);
            self.emit(TransferEvent::Error(TransferError::Channel(e).to_string()))
                .await;
        }
    }

    async fn handle_command(
        &mut self,
        cmd: TransferCommand,
        cmd_rx: &mut mpsc::Receiver<TransferCommand>,
    ) {
        match cmd {
            TransferCommand::SendFiles(files) => {
                if self.receiver.is_busy() {
                    self.emit(TransferEvent::Error(TransferError::Busy.to_string()))
                        .await;
                    return;
                }
                self.run_send(files, cmd_rx).await;
            }
            TransferCommand::Accept => match self.receiver.accept() {
                Ok(reply) => self.reply(reply).await,
                Err(e) => self.emit(TransferEvent::Error(e.to_string())).await,
            },
            TransferCommand::Decline => match self.receiver.decline() {
                Ok(reply) => self.reply(reply).await,
                Err(e) => self.emit(TransferEvent::Error(e.to_string())).await,
            },
            TransferCommand::Cancel => {
                if self.receiver.cancel() {
                    self.reply(ControlMessage::Cancel).await;
                    self.emit(TransferEvent::Cancelled { by_peer: false }).await;
                } else {
                    debug!("Cancel with nothing in progress");
                }
            }
        }
    }

    /// Drive one outgoing batch while still answering commands, so a
    /// `Cancel` can interrupt the stream.
    async fn run_send(
        &mut self,
        files: Vec<OutgoingFile>,
        cmd_rx: &mut mpsc::Receiver<TransferCommand>,
    ) {
        let cancel = CancellationToken::new();
        let result = {
            let send = send_batch(
                &self.channel,
                &mut self.inbox,
                files,
                self.config.accept_timeout,
                &self.event_tx,
                &cancel,
            );
            tokio::pin!(send);

            let mut cmd_open = true;
            loop {
                tokio::select! {
                    result = &mut send => break result,
                    cmd = cmd_rx.recv(), if cmd_open => match cmd {
                        Some(TransferCommand::Cancel) => cancel.cancel(),
                        Some(other) => {
                            debug!("Refusing {:?} during an outgoing batch", other);
                            let _ = self
                                .event_tx
                                .send(TransferEvent::Error(TransferError::Busy.to_string()))
                                .await;
                        }
                        None => {
                            cmd_open = false;
                            cancel.cancel();
                        }
                    },
                }
            }
        };

        let event = match result {
            Ok(BatchOutcome::Completed) => TransferEvent::BatchCompleted {
                role: TransferRole::Sender,
            },
            Ok(BatchOutcome::Declined) => TransferEvent::Declined,
            Ok(BatchOutcome::Cancelled { by_peer }) => TransferEvent::Cancelled { by_peer },
            Err(TransferError::AcceptanceTimeout) => TransferEvent::AcceptanceTimeout,
            Err(e) => {
                warn!("Outgoing batch failed: {}", e);
                TransferEvent::Error(e.to_string())
            }
        };
        self.emit(event).await;
    }

    async fn handle_frame(&mut self, frame: Frame) {
        let Some(event) = self.receiver.handle(frame) else {
            return;
        };

        let saved = match (&event, &self.config.download_dir) {
            (TransferEvent::FileReceived(file), Some(dir)) => {
                Some((file.entry.name.clone(), save_completed_file(dir, file).await))
            }
            _ => None,
        };
        self.emit(event).await;

        match saved {
            Some((name, Ok(path))) => self.emit(TransferEvent::FileSaved { name, path }).await,
            Some((name, Err(e))) => {
                warn!("Failed to save {}: {}", name, e);
                self.emit(TransferEvent::Error(format!("Failed to save {}: {}", name, e)))
                    .await;
            }
            None => {}
        }
    }
}
