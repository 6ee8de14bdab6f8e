//! Session orchestration.
//!
//! Ties the pieces together for one pairing: the session code names a
//! rendezvous mailbox, the connector negotiates a link through it, and a
//! transfer engine takes over the link's data channel. A coarse
//! [`SessionPhase`] is published for the UI along the way.

use crate::transport::RtcTransport;
use filedrop_core::code::{SessionCode, encode_join_payload};
use filedrop_core::config::{AppConfig, DEFAULT_STUN_SERVERS};
use filedrop_core::connection::{
    ConnectionState, DEFAULT_POLL_INTERVAL, EstablishedLink, PeerConnector, PeerTransport,
    TransportEvents,
};
use filedrop_core::error::{CodeError, ConnectError};
use filedrop_core::expiry::{SESSION_TTL, SessionExpiry};
use filedrop_core::rendezvous::{Rendezvous, Role};
use filedrop_core::transfer::{EngineConfig, TransferEngine, TransferEvent, TransferHandle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where a session is, from the user's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    /// Host is preparing its code and transport
    Creating,
    /// Host is showing its code and waiting for a peer
    Waiting,
    /// Guest has entered a code
    Joining,
    Connecting,
    Connected,
    Transferring,
    /// The last batch finished; the link stays up for more
    Completed,
    Failed,
    Disconnected,
}

impl SessionPhase {
    /// The link is not usable right now. `Disconnected` may still recover
    /// on its own; `Failed` never does.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Failed | SessionPhase::Disconnected)
    }

    /// Phase after a transfer event, if the event moves it.
    pub fn after_event(self, event: &TransferEvent) -> Option<SessionPhase> {
        if self.is_terminal() {
            return None;
        }
        match event {
            TransferEvent::FileStarted { .. } => Some(SessionPhase::Transferring),
            TransferEvent::BatchCompleted { .. } => Some(SessionPhase::Completed),
            TransferEvent::Declined
            | TransferEvent::Cancelled { .. }
            | TransferEvent::AcceptanceTimeout => Some(SessionPhase::Connected),
            _ => None,
        }
    }

    /// Phase after a connection state change on an established link.
    pub fn after_connection_state(self, state: ConnectionState) -> Option<SessionPhase> {
        match (self, state) {
            (SessionPhase::Failed, _) => None,
            (_, ConnectionState::Failed) => Some(SessionPhase::Failed),
            (SessionPhase::Disconnected, ConnectionState::Connected) => {
                Some(SessionPhase::Connected)
            }
            (_, ConnectionState::Disconnected) => Some(SessionPhase::Disconnected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub stun_servers: Vec<String>,
    pub poll_interval: Duration,
    pub session_ttl: Duration,
    pub engine: EngineConfig,
}

impl Default for SessionOptions {
    /// Received files are kept in memory only; use
    /// [`SessionOptions::from_config`] to save them.
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            session_ttl: SESSION_TTL,
            engine: EngineConfig::default(),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stun_servers: config.stun_servers.clone(),
            poll_interval: config.poll_interval(),
            session_ttl: config.session_ttl(),
            engine: EngineConfig::from_app_config(config),
        }
    }
}

/// A session with a code but no link yet.
pub struct PendingSession<T: PeerTransport, R: Rendezvous> {
    code: SessionCode,
    role: Role,
    expiry: SessionExpiry,
    connector: PeerConnector<T, R>,
    phase_tx: watch::Sender<SessionPhase>,
    engine: EngineConfig,
}

impl<T: PeerTransport, R: Rendezvous> PendingSession<T, R> {
    fn new(
        role: Role,
        code: SessionCode,
        transport: Arc<T>,
        events: TransportEvents<T::Channel>,
        rendezvous: Arc<R>,
        options: &SessionOptions,
        phase_tx: watch::Sender<SessionPhase>,
    ) -> Self {
        let expiry = SessionExpiry::with_ttl(options.session_ttl);
        let connector = PeerConnector::new(role, code.clone(), transport, events, rendezvous)
            .with_poll_interval(options.poll_interval)
            .with_expiry(expiry);
        Self {
            code,
            role,
            expiry,
            connector,
            phase_tx,
            engine: options.engine.clone(),
        }
    }

    /// Host a session under `code`, waiting for a guest to join.
    pub fn host(
        code: SessionCode,
        transport: Arc<T>,
        events: TransportEvents<T::Channel>,
        rendezvous: Arc<R>,
        options: &SessionOptions,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Creating);
        let session = Self::new(
            Role::Initiator,
            code,
            transport,
            events,
            rendezvous,
            options,
            phase_tx,
        );
        info!("Hosting session {}", session.code);
        session.phase_tx.send_replace(SessionPhase::Waiting);
        session
    }

    /// Join the session named by a scanned payload or a typed code.
    pub fn join(
        input: &str,
        transport: Arc<T>,
        events: TransportEvents<T::Channel>,
        rendezvous: Arc<R>,
        options: &SessionOptions,
    ) -> Result<Self, CodeError> {
        let code = SessionCode::from_user_input(input)?;
        info!("Joining session {}", code);
        let (phase_tx, _) = watch::channel(SessionPhase::Joining);
        Ok(Self::new(
            Role::Joiner,
            code,
            transport,
            events,
            rendezvous,
            options,
            phase_tx,
        ))
    }

    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    /// What the host renders for the guest to scan.
    pub fn join_payload(&self) -> String {
        encode_join_payload(&self.code)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remaining(&self) -> Duration {
        self.expiry.remaining()
    }

    pub fn phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connector.state()
    }

    /// Negotiate the link and start the transfer engine on it.
    ///
    /// Transfer events are forwarded to `event_tx`. A host stays in
    /// `Waiting` until the link is up; a guest moves to `Connecting`.
    pub async fn connect(
        self,
        event_tx: mpsc::Sender<TransferEvent>,
    ) -> Result<ActiveSession<T>, ConnectError> {
        let PendingSession {
            code,
            role,
            connector,
            phase_tx,
            engine,
            ..
        } = self;

        if role == Role::Joiner {
            phase_tx.send_replace(SessionPhase::Connecting);
        }

        let mut link = match connector.establish().await {
            Ok(link) => link,
            Err(e) => {
                let phase = match &e {
                    ConnectError::Disconnected(_) => SessionPhase::Disconnected,
                    _ => SessionPhase::Failed,
                };
                phase_tx.send_replace(phase);
                return Err(e);
            }
        };
        let Some(open) = link.take_channel() else {
            phase_tx.send_replace(SessionPhase::Failed);
            return Err(ConnectError::Disconnected(link.current_state()));
        };
        phase_tx.send_replace(SessionPhase::Connected);
        info!("Session {} connected", code);

        let (engine_tx, engine_rx) = mpsc::channel(64);
        let (transfers, engine_task) = TransferEngine::spawn(open, engine, engine_tx);
        let relay = tokio::spawn(relay_events(engine_rx, event_tx, phase_tx.clone()));
        let monitor = tokio::spawn(follow_connection(link.state(), phase_tx.clone()));

        Ok(ActiveSession {
            code,
            role,
            link,
            transfers,
            phase_tx,
            tasks: vec![engine_task, relay, monitor],
        })
    }
}

impl<R: Rendezvous> PendingSession<RtcTransport, R> {
    /// Host a WebRTC session under a fresh code.
    pub async fn host_rtc(rendezvous: Arc<R>, options: &SessionOptions) -> anyhow::Result<Self> {
        let code = SessionCode::generate_default();
        let (transport, events) = RtcTransport::new(&options.stun_servers).await?;
        Ok(Self::host(code, transport, events, rendezvous, options))
    }

    /// Join a WebRTC session from a scanned payload or typed code.
    pub async fn join_rtc(
        input: &str,
        rendezvous: Arc<R>,
        options: &SessionOptions,
    ) -> anyhow::Result<Self> {
        // Reject bad codes before building a peer connection
        let code = SessionCode::from_user_input(input)?;
        let (transport, events) = RtcTransport::new(&options.stun_servers).await?;
        Ok(Self::join(code.as_str(), transport, events, rendezvous, options)?)
    }
}

async fn relay_events(
    mut engine_rx: mpsc::Receiver<TransferEvent>,
    event_tx: mpsc::Sender<TransferEvent>,
    phase_tx: watch::Sender<SessionPhase>,
) {
    while let Some(event) = engine_rx.recv().await {
        let current = *phase_tx.borrow();
        if let Some(next) = current.after_event(&event) {
            if next != current {
                debug!("Session phase {:?} -> {:?}", current, next);
                phase_tx.send_replace(next);
            }
        }
        if event_tx.send(event).await.is_err() {
            debug!("Transfer event listener dropped");
        }
    }
}

async fn follow_connection(
    mut state: watch::Receiver<ConnectionState>,
    phase_tx: watch::Sender<SessionPhase>,
) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        let phase = *phase_tx.borrow();
        let Some(next) = phase.after_connection_state(current) else {
            continue;
        };
        if next == phase {
            continue;
        }
        match next {
            SessionPhase::Connected => info!("Link recovered"),
            _ => warn!("Link {:?}: {:?}", next, current),
        }
        phase_tx.send_replace(next);
        if next == SessionPhase::Failed {
            return;
        }
    }
}

/// A connected session with a running transfer engine.
pub struct ActiveSession<T: PeerTransport> {
    code: SessionCode,
    role: Role,
    link: EstablishedLink<T>,
    transfers: TransferHandle,
    phase_tx: watch::Sender<SessionPhase>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: PeerTransport> ActiveSession<T> {
    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Send files, answer incoming manifests, cancel.
    pub fn transfers(&self) -> &TransferHandle {
        &self.transfers
    }

    pub fn phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn current_phase(&self) -> SessionPhase {
        *self.phase_tx.borrow()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.current_state()
    }

    /// Hang up. Safe to call more than once.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.phase_tx.send_replace(SessionPhase::Disconnected);
        self.link.close().await
    }
}

impl<T: PeerTransport> Drop for ActiveSession<T> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
