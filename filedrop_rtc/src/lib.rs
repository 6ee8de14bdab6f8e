//! WebRTC binding for `filedrop_core`.
//!
//! [`RtcTransport`] implements the core's `PeerTransport` over the `webrtc`
//! crate (STUN only, one ordered data channel), and [`session`] strings code,
//! rendezvous, connection and transfer engine together.

pub mod session;
pub mod transport;

pub use session::{ActiveSession, PendingSession, SessionOptions, SessionPhase};
pub use transport::{RtcDataChannel, RtcTransport};
