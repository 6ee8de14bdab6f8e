//! Connection establishment.
//!
//! Drives the offer/answer exchange and ICE candidate relay through a
//! [`Rendezvous`] store until the transport reports an open data channel.
//!
//! Two independent tasks feed the state machine:
//! - the local candidate publisher, pushing candidates as the transport
//!   discovers them
//! - the remote poller, re-reading the peer's description and candidates
//!   every poll interval
//!
//! The machine applies the remote description exactly once and each remote
//! candidate exactly once, and only after the remote description is set.
//! One [`PeerConnector`] serves one attempt; retrying means building a new
//! one.

use crate::channel::{DataChannel, OpenChannel};
use crate::code::SessionCode;
use crate::error::ConnectError;
use crate::expiry::SessionExpiry;
use crate::rendezvous::{Rendezvous, Role};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Label of the single data channel carrying the transfer protocol
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

/// Default rendezvous polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// ICE candidate in the browser's `RTCIceCandidateInit` JSON shape, which
/// is what goes through the rendezvous store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored candidate. A bare `candidate:...` line is accepted too.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match serde_json::from_str::<IceCandidate>(raw) {
            Ok(candidate) => Some(candidate),
            Err(_) if raw.starts_with("candidate:") => Some(Self::new(raw)),
            Err(_) => None,
        }
    }
}

/// Notifications from the transport, besides local candidates.
pub enum TransportEvent<C> {
    StateChanged(ConnectionState),
    ChannelOpen(OpenChannel<C>),
}

/// Receivers a transport hands out when it is created.
pub struct TransportEvents<C> {
    pub local_candidates: mpsc::UnboundedReceiver<IceCandidate>,
    pub events: mpsc::UnboundedReceiver<TransportEvent<C>>,
}

/// A local transport endpoint able to negotiate a direct link.
pub trait PeerTransport: Send + Sync + 'static {
    type Channel: DataChannel;

    /// Create the ordered, reliable data channel (initiator only).
    fn create_data_channel(&self, label: &str) -> impl Future<Output = Result<()>> + Send;

    /// Create an offer, set it as local description, return its SDP.
    fn create_offer(&self) -> impl Future<Output = Result<String>> + Send;

    /// Create an answer, set it as local description, return its SDP.
    fn create_answer(&self) -> impl Future<Output = Result<String>> + Send;

    fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn add_ice_candidate(&self, candidate: IceCandidate)
    -> impl Future<Output = Result<()>> + Send;

    /// Tear the link down. Idempotent.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// What the remote poller found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSignal {
    Description(String),
    Candidates(Vec<String>),
}

/// Negotiation progress. Remote candidates are only meaningful once the
/// remote description is in place.
#[derive(Debug)]
enum Negotiation {
    AwaitingRemote,
    RemoteApplied { applied: HashSet<String> },
}

/// Apply-once bookkeeping for remote signaling.
#[derive(Debug)]
pub struct SignalingMachine {
    role: Role,
    negotiation: Negotiation,
}

impl SignalingMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            negotiation: Negotiation::AwaitingRemote,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn has_remote_description(&self) -> bool {
        matches!(self.negotiation, Negotiation::RemoteApplied { .. })
    }

    pub fn applied_candidate_count(&self) -> usize {
        match &self.negotiation {
            Negotiation::AwaitingRemote => 0,
            Negotiation::RemoteApplied { applied } => applied.len(),
        }
    }

    /// Apply the peer's description if none is set yet.
    ///
    /// For a joiner this also builds the answer, returned for publishing.
    /// Repeated calls after success are no-ops returning `None`.
    pub async fn apply_remote_description<T: PeerTransport>(
        &mut self,
        transport: &T,
        sdp: &str,
    ) -> Result<Option<String>, ConnectError> {
        if self.has_remote_description() {
            debug!("Remote description already applied, ignoring");
            return Ok(None);
        }

        let kind = match self.role {
            Role::Initiator => SdpKind::Answer,
            Role::Joiner => SdpKind::Offer,
        };
        transport
            .set_remote_description(kind, sdp)
            .await
            .map_err(ConnectError::Transport)?;
        self.negotiation = Negotiation::RemoteApplied {
            applied: HashSet::new(),
        };
        info!("Remote {:?} applied", kind);

        match self.role {
            Role::Initiator => Ok(None),
            Role::Joiner => {
                let answer = transport
                    .create_answer()
                    .await
                    .map_err(ConnectError::Transport)?;
                Ok(Some(answer))
            }
        }
    }

    /// Apply every not-yet-seen candidate from a full history read.
    ///
    /// Returns how many were newly applied. Candidates are compared by their
    /// `candidate` string. A candidate the transport rejects is still marked
    /// as seen and never retried.
    pub async fn apply_remote_candidates<T: PeerTransport>(
        &mut self,
        transport: &T,
        raw_candidates: &[String],
    ) -> usize {
        let applied = match &mut self.negotiation {
            Negotiation::AwaitingRemote => {
                debug!(
                    "Deferring {} remote candidates until remote description is set",
                    raw_candidates.len()
                );
                return 0;
            }
            Negotiation::RemoteApplied { applied } => applied,
        };

        let mut count = 0;
        for raw in raw_candidates {
            let Some(candidate) = IceCandidate::from_wire(raw) else {
                warn!("Ignoring malformed ICE candidate: {}", raw);
                continue;
            };
            if !applied.insert(candidate.candidate.clone()) {
                continue;
            }
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => count += 1,
                Err(e) => warn!("Failed to add ICE candidate: {}", e),
            }
        }
        if count > 0 {
            debug!("Applied {} new remote candidates", count);
        }
        count
    }
}

/// Aborts background tasks when dropped.
struct TaskGuard(Vec<JoinHandle<()>>);

impl TaskGuard {
    fn disarm(mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// One connection attempt.
pub struct PeerConnector<T: PeerTransport, R: Rendezvous> {
    role: Role,
    code: SessionCode,
    transport: Arc<T>,
    events: TransportEvents<T::Channel>,
    rendezvous: Arc<R>,
    poll_interval: Duration,
    expiry: SessionExpiry,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T: PeerTransport, R: Rendezvous> PeerConnector<T, R> {
    pub fn new(
        role: Role,
        code: SessionCode,
        transport: Arc<T>,
        events: TransportEvents<T::Channel>,
        rendezvous: Arc<R>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        Self {
            role,
            code,
            transport,
            events,
            rendezvous,
            poll_interval: DEFAULT_POLL_INTERVAL,
            expiry: SessionExpiry::start(),
            state_tx,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_expiry(mut self, expiry: SessionExpiry) -> Self {
        self.expiry = expiry;
        self
    }

    /// Observe the connection state of this attempt.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Run the attempt until a data channel is open, the transport fails,
    /// or the session expires.
    pub async fn establish(self) -> Result<EstablishedLink<T>, ConnectError> {
        let PeerConnector {
            role,
            code,
            transport,
            events,
            rendezvous,
            poll_interval,
            expiry,
            state_tx,
        } = self;
        let TransportEvents {
            local_candidates,
            events: mut transport_events,
        } = events;

        info!("Connecting as {:?} with session code {}", role, code);
        state_tx.send_replace(ConnectionState::Connecting);

        let publisher = tokio::spawn(publish_local_candidates(
            rendezvous.clone(),
            code.clone(),
            role,
            local_candidates,
        ));
        let publisher_guard = TaskGuard(vec![publisher]);

        let result = drive(
            role,
            &code,
            &transport,
            &mut transport_events,
            &rendezvous,
            poll_interval,
            expiry,
            &state_tx,
        )
        .await;

        match result {
            Ok(open) => {
                info!("Data channel open, connection established");
                let monitor = tokio::spawn(forward_state_changes(
                    transport_events,
                    state_tx.clone(),
                ));
                let mut tasks = publisher_guard.disarm();
                tasks.push(monitor);
                Ok(EstablishedLink {
                    transport,
                    channel: Some(open),
                    state_tx,
                    tasks,
                    closed: AtomicBool::new(false),
                })
            }
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                if !state_tx.borrow().is_terminal() {
                    state_tx.send_replace(ConnectionState::Failed);
                }
                if let Err(close_err) = transport.close().await {
                    debug!("Transport close after failure: {}", close_err);
                }
                Err(e)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive<T: PeerTransport, R: Rendezvous>(
    role: Role,
    code: &SessionCode,
    transport: &Arc<T>,
    transport_events: &mut mpsc::UnboundedReceiver<TransportEvent<T::Channel>>,
    rendezvous: &Arc<R>,
    poll_interval: Duration,
    expiry: SessionExpiry,
    state_tx: &watch::Sender<ConnectionState>,
) -> Result<OpenChannel<T::Channel>, ConnectError> {
    let deadline = tokio::time::sleep_until(expiry.expires_at());
    tokio::pin!(deadline);

    if role.is_initiator() {
        // Created before any remote description so it is ready the instant
        // the link opens.
        transport
            .create_data_channel(DATA_CHANNEL_LABEL)
            .await
            .map_err(ConnectError::Transport)?;
        let offer = transport
            .create_offer()
            .await
            .map_err(ConnectError::Transport)?;
        tokio::select! {
            _ = publish_description(rendezvous.as_ref(), code, SdpKind::Offer, &offer, poll_interval) => {}
            _ = &mut deadline => return Err(ConnectError::Expired),
        }
    }

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let _poller = TaskGuard(vec![tokio::spawn(poll_remote(
        rendezvous.clone(),
        code.clone(),
        role,
        poll_interval,
        signal_tx,
    ))]);

    let mut machine = SignalingMachine::new(role);
    let mut connected = false;
    let mut channel: Option<OpenChannel<T::Channel>> = None;

    loop {
        if connected && let Some(open) = channel.take() {
            return Ok(open);
        }

        tokio::select! {
            Some(signal) = signal_rx.recv() => match signal {
                RemoteSignal::Description(sdp) => {
                    if let Some(answer) = machine
                        .apply_remote_description(transport.as_ref(), &sdp)
                        .await?
                    {
                        tokio::select! {
                            _ = publish_description(rendezvous.as_ref(), code, SdpKind::Answer, &answer, poll_interval) => {}
                            _ = &mut deadline => return Err(ConnectError::Expired),
                        }
                    }
                }
                RemoteSignal::Candidates(raw) => {
                    machine.apply_remote_candidates(transport.as_ref(), &raw).await;
                }
            },
            event = transport_events.recv() => match event {
                Some(TransportEvent::StateChanged(state)) => {
                    debug!("Transport state: {:?}", state);
                    state_tx.send_replace(state);
                    match state {
                        ConnectionState::Connected => connected = true,
                        ConnectionState::Failed => return Err(ConnectError::TransportFailed),
                        ConnectionState::Disconnected => {
                            return Err(ConnectError::Disconnected(state));
                        }
                        ConnectionState::New | ConnectionState::Connecting => {}
                    }
                }
                Some(TransportEvent::ChannelOpen(open)) => {
                    debug!("Data channel reported open");
                    channel = Some(open);
                }
                None => return Err(ConnectError::Disconnected(*state_tx.borrow())),
            },
            _ = &mut deadline => return Err(ConnectError::Expired),
        }
    }
}

/// Publish our own description, retrying on every poll tick until the
/// store takes it.
async fn publish_description<R: Rendezvous>(
    rendezvous: &R,
    code: &SessionCode,
    kind: SdpKind,
    sdp: &str,
    retry_interval: Duration,
) {
    loop {
        let result = match kind {
            SdpKind::Offer => rendezvous.publish_offer(code, sdp).await,
            SdpKind::Answer => rendezvous.publish_answer(code, sdp).await,
        };
        match result {
            Ok(()) => {
                info!("Published {:?} for session {}", kind, code);
                return;
            }
            Err(e) => {
                warn!("Failed to publish {:?}, retrying: {}", kind, e);
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}

/// Push every locally discovered candidate as soon as it shows up.
async fn publish_local_candidates<R: Rendezvous>(
    rendezvous: Arc<R>,
    code: SessionCode,
    role: Role,
    mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
) {
    while let Some(candidate) = candidates.recv().await {
        let wire = match candidate.to_wire() {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Cannot encode local ICE candidate: {}", e);
                continue;
            }
        };
        if let Err(e) = rendezvous.publish_ice_candidate(&code, &wire, role).await {
            warn!("Failed to publish ICE candidate: {}", e);
        }
    }
}

/// Poll the store for the peer's description and candidates.
///
/// Candidates are not fetched until the description has been forwarded;
/// the store keeps full history so nothing is lost by waiting.
async fn poll_remote<R: Rendezvous>(
    rendezvous: Arc<R>,
    code: SessionCode,
    role: Role,
    interval: Duration,
    signals: mpsc::UnboundedSender<RemoteSignal>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut description_forwarded = false;

    loop {
        ticker.tick().await;

        if !description_forwarded {
            let fetched = match role {
                Role::Initiator => rendezvous.fetch_answer(&code).await,
                Role::Joiner => rendezvous.fetch_offer(&code).await,
            };
            match fetched {
                Ok(Some(sdp)) => {
                    if signals.send(RemoteSignal::Description(sdp)).is_err() {
                        return;
                    }
                    description_forwarded = true;
                }
                Ok(None) => {
                    debug!("No remote description yet for {}", code);
                    continue;
                }
                Err(e) => {
                    warn!("Rendezvous read failed: {}", e);
                    continue;
                }
            }
        }

        match rendezvous.fetch_ice_candidates(&code, role.peer()).await {
            Ok(candidates) if candidates.is_empty() => {}
            Ok(candidates) => {
                if signals.send(RemoteSignal::Candidates(candidates)).is_err() {
                    return;
                }
            }
            Err(e) => warn!("Rendezvous candidate read failed: {}", e),
        }
    }
}

async fn forward_state_changes<C>(
    mut events: mpsc::UnboundedReceiver<TransportEvent<C>>,
    state_tx: watch::Sender<ConnectionState>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::StateChanged(state) => {
                info!("Connection state changed: {:?}", state);
                state_tx.send_replace(state);
                // A disconnected link may still recover; only failure ends it
                if state == ConnectionState::Failed {
                    break;
                }
            }
            TransportEvent::ChannelOpen(_) => {
                warn!("Ignoring extra data channel on an established link");
            }
        }
    }
}

/// A connected link. The data channel can be taken exactly once and handed
/// to a transfer engine; the link keeps the transport for teardown.
pub struct EstablishedLink<T: PeerTransport> {
    transport: Arc<T>,
    channel: Option<OpenChannel<T::Channel>>,
    state_tx: watch::Sender<ConnectionState>,
    tasks: Vec<JoinHandle<()>>,
    closed: AtomicBool,
}

impl<T: PeerTransport> EstablishedLink<T> {
    pub fn take_channel(&mut self) -> Option<OpenChannel<T::Channel>> {
        self.channel.take()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Tear the link down. Safe to call any number of times.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing peer link");
        for task in &self.tasks {
            task.abort();
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.transport.close().await
    }
}

impl<T: PeerTransport> Drop for EstablishedLink<T> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
