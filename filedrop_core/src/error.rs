//! Error types for filedrop_core.

use crate::connection::ConnectionState;

/// Manual code entry failures.
#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    #[error("Session code is empty")]
    Empty,

    #[error("Invalid session code: {0}")]
    Invalid(String),
}

/// Failures that end a connection attempt. None of these are retried
/// internally; the caller builds a fresh attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The transport's connectivity checks failed.
    #[error("Connection failed")]
    TransportFailed,

    /// The link went away before a data channel opened.
    #[error("Connection closed before it was established ({0:?})")]
    Disconnected(ConnectionState),

    /// The session code expired before the peer showed up.
    #[error("Session expired")]
    Expired,

    /// The local transport rejected an operation.
    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

/// Failures of a single batch. The data channel stays usable after any of
/// these except [`TransferError::ChannelClosed`].
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// No accept/decline arrived within the acceptance window.
    #[error("Transfer acceptance timeout")]
    AcceptanceTimeout,

    #[error("Data channel closed")]
    ChannelClosed,

    /// accept/decline called while no manifest is pending.
    #[error("No incoming transfer to respond to")]
    NoPendingManifest,

    #[error("A transfer is already in progress")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(#[source] anyhow::Error),
}
