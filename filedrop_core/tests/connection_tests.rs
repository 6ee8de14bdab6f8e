use anyhow::Result;
use filedrop_core::channel::{LoopbackChannel, loopback_pair};
use filedrop_core::connection::SignalingMachine;
use filedrop_core::{
    ConnectError, ConnectionState, IceCandidate, MemoryRendezvous, PeerConnector, PeerTransport,
    Rendezvous, Role, SdpKind, SessionCode, SessionExpiry, TransportEvent, TransportEvents,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    CreateDataChannel(String),
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind, String),
    AddCandidate(String),
    Close,
}

/// Records every call; never touches a network.
#[derive(Default)]
struct FakeTransport {
    calls: Mutex<Vec<Call>>,
}

impl FakeTransport {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn candidates_added(&self) -> usize {
        self.count(|c| matches!(c, Call::AddCandidate(_)))
    }
}

impl PeerTransport for FakeTransport {
    type Channel = LoopbackChannel;

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        self.record(Call::CreateDataChannel(label.to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        self.record(Call::CreateOffer);
        Ok("offer-sdp".to_string())
    }

    async fn create_answer(&self) -> Result<String> {
        self.record(Call::CreateAnswer);
        Ok("answer-sdp".to_string())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        self.record(Call::SetRemote(kind, sdp.to_string()));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        Ok(())
    }
}

/// The transport-callback side of a fake transport
struct Controls {
    candidates: mpsc::UnboundedSender<IceCandidate>,
    events: mpsc::UnboundedSender<TransportEvent<LoopbackChannel>>,
}

fn fake_transport() -> (Arc<FakeTransport>, TransportEvents<LoopbackChannel>, Controls) {
    let (candidate_tx, local_candidates) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::unbounded_channel();
    (
        Arc::new(FakeTransport::default()),
        TransportEvents {
            local_candidates,
            events,
        },
        Controls {
            candidates: candidate_tx,
            events: event_tx,
        },
    )
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_answer(rendezvous: &MemoryRendezvous, code: &SessionCode) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(answer) = rendezvous.fetch_answer(code).await.unwrap() {
                return answer;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no answer published")
}

fn remote_candidate(n: u32) -> String {
    IceCandidate::new(format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n))
        .to_wire()
        .unwrap()
}

#[tokio::test]
async fn test_initiator_full_handshake() {
    let rendezvous = Arc::new(MemoryRendezvous::new());
    let code = SessionCode::generate_default();
    let (transport, events, controls) = fake_transport();

    let connector = PeerConnector::new(
        Role::Initiator,
        code.clone(),
        transport.clone(),
        events,
        rendezvous.clone(),
    )
    .with_poll_interval(POLL);
    let state = connector.state();
    let attempt = tokio::spawn(connector.establish());

    wait_until(|| transport.count(|c| *c == Call::CreateOffer) == 1).await;
    tokio::time::sleep(POLL).await;
    assert_eq!(
        rendezvous.fetch_offer(&code).await.unwrap().as_deref(),
        Some("offer-sdp")
    );
    assert_eq!(
        transport.calls()[0],
        Call::CreateDataChannel("fileTransfer".to_string())
    );
    assert_eq!(*state.borrow(), ConnectionState::Connecting);

    // Local candidates are published under our own role
    controls
        .candidates
        .send(IceCandidate::new("candidate:9 1 udp 1 192.168.1.5 6000 typ host"))
        .unwrap();

    // A joiner candidate that beats its answer to the store waits
    rendezvous
        .publish_ice_candidate(&code, &remote_candidate(1), Role::Joiner)
        .await
        .unwrap();
    tokio::time::sleep(POLL * 5).await;
    assert_eq!(transport.candidates_added(), 0);

    rendezvous.publish_answer(&code, "answer-sdp").await.unwrap();
    wait_until(|| transport.candidates_added() == 1).await;
    assert_eq!(
        transport.count(|c| *c == Call::SetRemote(SdpKind::Answer, "answer-sdp".into())),
        1
    );

    let published = rendezvous
        .fetch_ice_candidates(&code, Role::Initiator)
        .await
        .unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(
        IceCandidate::from_wire(&published[0]).unwrap().candidate,
        "candidate:9 1 udp 1 192.168.1.5 6000 typ host"
    );

    let (local, _remote) = loopback_pair();
    controls
        .events
        .send(TransportEvent::StateChanged(ConnectionState::Connected))
        .unwrap();
    controls.events.send(TransportEvent::ChannelOpen(local)).unwrap();

    let mut link = attempt.await.unwrap().unwrap();
    assert_eq!(link.current_state(), ConnectionState::Connected);
    assert_eq!(*state.borrow(), ConnectionState::Connected);
    assert!(link.take_channel().is_some());
    assert!(link.take_channel().is_none());
    assert_eq!(transport.count(|c| *c == Call::CreateAnswer), 0);
}

#[tokio::test]
async fn test_duplicate_candidates_applied_once() {
    let rendezvous = Arc::new(MemoryRendezvous::new());
    let code = SessionCode::generate_default();
    let (transport, events, controls) = fake_transport();
    rendezvous.publish_offer(&code, "offer-sdp").await.unwrap();

    let connector = PeerConnector::new(
        Role::Joiner,
        code.clone(),
        transport.clone(),
        events,
        rendezvous.clone(),
    )
    .with_poll_interval(POLL);
    let attempt = tokio::spawn(connector.establish());

    // Same candidate published twice, plus a second distinct one
    for raw in [remote_candidate(1), remote_candidate(1), remote_candidate(2)] {
        rendezvous
            .publish_ice_candidate(&code, &raw, Role::Initiator)
            .await
            .unwrap();
    }
    wait_until(|| transport.candidates_added() == 2).await;

    // Every later poll re-reads the whole history
    tokio::time::sleep(POLL * 5).await;
    assert_eq!(transport.candidates_added(), 2);

    let (local, _remote) = loopback_pair();
    controls.events.send(TransportEvent::ChannelOpen(local)).unwrap();
    controls
        .events
        .send(TransportEvent::StateChanged(ConnectionState::Connected))
        .unwrap();
    assert!(attempt.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_joiner_answers_offer() {
    let rendezvous = Arc::new(MemoryRendezvous::new());
    let code = SessionCode::parse("abcd-23").unwrap();
    let (transport, events, controls) = fake_transport();
    rendezvous.publish_offer(&code, "offer-sdp").await.unwrap();

    let connector = PeerConnector::new(
        Role::Joiner,
        code.clone(),
        transport.clone(),
        events,
        rendezvous.clone(),
    )
    .with_poll_interval(POLL);
    let attempt = tokio::spawn(connector.establish());

    assert_eq!(wait_for_answer(&rendezvous, &code).await, "answer-sdp");
    let calls = transport.calls();
    assert_eq!(calls[0], Call::SetRemote(SdpKind::Offer, "offer-sdp".into()));
    assert_eq!(calls[1], Call::CreateAnswer);
    assert!(!calls.iter().any(|c| matches!(c, Call::CreateDataChannel(_))));

    // Channel may open before the state flips to connected
    let (local, _remote) = loopback_pair();
    controls.events.send(TransportEvent::ChannelOpen(local)).unwrap();
    controls
        .events
        .send(TransportEvent::StateChanged(ConnectionState::Connected))
        .unwrap();

    let link = attempt.await.unwrap().unwrap();
    assert_eq!(link.current_state(), ConnectionState::Connected);
    assert_eq!(transport.count(|c| matches!(c, Call::SetRemote(..))), 1);
}

#[tokio::test]
async fn test_transport_failure_ends_attempt() {
    let rendezvous = Arc::new(MemoryRendezvous::new());
    let code = SessionCode::generate_default();
    let (transport, events, controls) = fake_transport();

    let connector = PeerConnector::new(
        Role::Initiator,
        code.clone(),
        transport.clone(),
        events,
        rendezvous.clone(),
    )
    .with_poll_interval(POLL);
    let state = connector.state();
    let attempt = tokio::spawn(connector.establish());

    wait_until(|| transport.count(|c| *c == Call::CreateOffer) == 1).await;
    controls
        .events
        .send(TransportEvent::StateChanged(ConnectionState::Failed))
        .unwrap();

    let result = attempt.await.unwrap();
    assert!(matches!(result, Err(ConnectError::TransportFailed)));
    assert_eq!(*state.borrow(), ConnectionState::Failed);
    assert_eq!(transport.count(|c| *c == Call::Close), 1);
}

#[tokio::test]
async fn test_session_expiry_ends_attempt() {
    let rendezvous = Arc::new(MemoryRendezvous::new());
    let code = SessionCode::generate_default();
    let (transport, events, _controls) = fake_transport();

    // Nobody ever publishes an offer
    let connector = PeerConnector::new(
        Role::Joiner,
        code,
        transport.clone(),
        events,
        rendezvous,
    )
    .with_poll_interval(POLL)
    .with_expiry(SessionExpiry::with_ttl(Duration::from_millis(100)));

    let result = tokio::time::timeout(Duration::from_secs(5), connector.establish())
        .await
        .unwrap();
    assert!(matches!(result, Err(ConnectError::Expired)));
    assert_eq!(transport.count(|c| *c == Call::Close), 1);
    assert!(!transport.calls().contains(&Call::CreateAnswer));
}

#[tokio::test]
async fn test_link_close_is_idempotent() {
    let rendezvous = Arc::new(MemoryRendezvous::new());
    let code = SessionCode::generate_default();
    let (transport, events, controls) = fake_transport();
    rendezvous.publish_offer(&code, "offer-sdp").await.unwrap();

    let connector = PeerConnector::new(
        Role::Joiner,
        code,
        transport.clone(),
        events,
        rendezvous,
    )
    .with_poll_interval(POLL);
    let attempt = tokio::spawn(connector.establish());

    let (local, _remote) = loopback_pair();
    controls
        .events
        .send(TransportEvent::StateChanged(ConnectionState::Connected))
        .unwrap();
    controls.events.send(TransportEvent::ChannelOpen(local)).unwrap();
    let link = attempt.await.unwrap().unwrap();

    link.close().await.unwrap();
    link.close().await.unwrap();
    assert_eq!(transport.count(|c| *c == Call::Close), 1);
    assert_eq!(link.current_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_state_changes_after_establishment_are_observed() {
    let rendezvous = Arc::new(MemoryRendezvous::new());
    let code = SessionCode::generate_default();
    let (transport, events, controls) = fake_transport();
    rendezvous.publish_offer(&code, "offer-sdp").await.unwrap();

    let connector = PeerConnector::new(Role::Joiner, code, transport, events, rendezvous)
        .with_poll_interval(POLL);
    let attempt = tokio::spawn(connector.establish());

    let (local, _remote) = loopback_pair();
    controls
        .events
        .send(TransportEvent::StateChanged(ConnectionState::Connected))
        .unwrap();
    controls.events.send(TransportEvent::ChannelOpen(local)).unwrap();
    let link = attempt.await.unwrap().unwrap();

    let mut state = link.state();
    controls
        .events
        .send(TransportEvent::StateChanged(ConnectionState::Disconnected))
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    // Disconnected is transient; recovery and later failure still show up
    controls
        .events
        .send(TransportEvent::StateChanged(ConnectionState::Connected))
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    controls
        .events
        .send(TransportEvent::StateChanged(ConnectionState::Failed))
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Failed),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_signaling_machine_apply_once() {
    let transport = FakeTransport::default();
    let mut machine = SignalingMachine::new(Role::Joiner);

    // Candidates before the description are not applied
    assert_eq!(
        machine
            .apply_remote_candidates(&transport, &[remote_candidate(1)])
            .await,
        0
    );
    assert!(!machine.has_remote_description());

    let answer = machine
        .apply_remote_description(&transport, "offer-sdp")
        .await
        .unwrap();
    assert_eq!(answer.as_deref(), Some("answer-sdp"));
    assert!(
        machine
            .apply_remote_description(&transport, "offer-sdp")
            .await
            .unwrap()
            .is_none()
    );

    let history = vec![
        remote_candidate(1),
        "not a candidate".to_string(),
        remote_candidate(2),
    ];
    assert_eq!(machine.apply_remote_candidates(&transport, &history).await, 2);
    assert_eq!(machine.apply_remote_candidates(&transport, &history).await, 0);
    assert_eq!(machine.applied_candidate_count(), 2);
    assert_eq!(transport.count(|c| matches!(c, Call::SetRemote(..))), 1);
    assert_eq!(transport.candidates_added(), 2);
}
