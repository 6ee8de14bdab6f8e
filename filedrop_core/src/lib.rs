//! Transport-agnostic core of a code-paired peer-to-peer file drop.
//!
//! A session starts with a short [`SessionCode`] shown on one device and
//! typed or scanned on the other. Both peers exchange SDP and ICE
//! candidates through a [`Rendezvous`] store keyed by that code, the
//! [`PeerConnector`] drives the negotiation until a data channel opens, and
//! a [`TransferEngine`] takes over the channel for file batches.

pub mod channel;
pub mod code;
pub mod config;
pub mod connection;
pub mod error;
pub mod expiry;
pub mod logging;
pub mod rendezvous;
pub mod transfer;

pub use channel::{ChannelMessage, DataChannel, Inbox, OpenChannel};
pub use code::{SessionCode, decode_join_payload, encode_join_payload};
pub use config::AppConfig;
pub use connection::{
    ConnectionState, EstablishedLink, IceCandidate, PeerConnector, PeerTransport, SdpKind,
    TransportEvent, TransportEvents,
};
pub use error::{CodeError, ConnectError, TransferError};
pub use expiry::SessionExpiry;
pub use rendezvous::{MemoryRendezvous, Rendezvous, Role};
pub use transfer::{
    EngineConfig, OutgoingFile, TransferEngine, TransferEvent, TransferHandle, TransferProgress,
};
