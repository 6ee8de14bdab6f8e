use anyhow::{Context, Result};
use bytes::Bytes;
use filedrop_core::channel::{ChannelMessage, DataChannel, OpenChannel};
use filedrop_core::connection::{
    ConnectionState, IceCandidate, PeerTransport, SdpKind, TransportEvent, TransportEvents,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

type EventSender = mpsc::UnboundedSender<TransportEvent<RtcDataChannel>>;

/// Collapse the peer connection's states onto the ones the connector acts on.
pub fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
            ConnectionState::Disconnected
        }
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
    }
}

pub fn to_core_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

pub fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

/// WebRTC data channel carrying the transfer protocol.
#[derive(Clone)]
pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    pub fn label(&self) -> &str {
        self.inner.label()
    }
}

impl DataChannel for RtcDataChannel {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.inner
            .send_text(text.to_string())
            .await
            .context("Failed to send text frame")?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.inner
            .send(&data)
            .await
            .context("Failed to send binary frame")?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) -> Result<()> {
        match self.inner.ready_state() {
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => Ok(()),
            _ => Ok(self.inner.close().await?),
        }
    }
}

/// Route a data channel's messages into an inbox and announce it once open.
fn attach_channel(dc: Arc<RTCDataChannel>, events: EventSender) {
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    // Shared with the close handler, which drops it to end the inbox
    let inbox_tx = Arc::new(Mutex::new(Some(inbox_tx)));

    let message_tx = inbox_tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let frame = if msg.is_string {
            ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            ChannelMessage::Binary(msg.data)
        };
        if let Some(tx) = message_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.send(frame);
        }
        Box::pin(async {})
    }));

    let label = dc.label().to_string();
    dc.on_close(Box::new(move || {
        debug!("Data channel '{}' closed", label);
        inbox_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        Box::pin(async {})
    }));

    let open_dc = dc.clone();
    let inbox = Mutex::new(inbox);
    dc.on_open(Box::new(move || {
        info!("Data channel '{}' open", open_dc.label());
        let inbox = inbox.into_inner().unwrap_or_else(PoisonError::into_inner);
        let _ = events.send(TransportEvent::ChannelOpen(OpenChannel {
            channel: RtcDataChannel { inner: open_dc },
            inbox,
        }));
        Box::pin(async {})
    }));
}

/// A WebRTC peer connection configured with STUN servers only.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: EventSender,
    closed: AtomicBool,
}

impl RtcTransport {
    pub async fn new(stun_servers: &[String]) -> Result<(Arc<Self>, TransportEvents<RtcDataChannel>)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !stun_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );
        info!("Peer connection created with {} STUN servers", stun_servers.len());

        let (candidate_tx, local_candidates) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // None marks the end of gathering
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        debug!("Local ICE candidate: {}", init.candidate);
                        let _ = candidate_tx.send(to_core_candidate(init));
                    }
                    Err(e) => warn!("Cannot serialize local ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let state_tx = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Peer connection state: {}", state);
            let _ = state_tx.send(TransportEvent::StateChanged(map_connection_state(state)));
            Box::pin(async {})
        }));

        let channel_tx = event_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            info!("Remote opened data channel '{}'", dc.label());
            attach_channel(dc, channel_tx.clone());
            Box::pin(async {})
        }));

        let transport = Arc::new(Self {
            pc,
            events: event_tx,
            closed: AtomicBool::new(false),
        });
        Ok((
            transport,
            TransportEvents {
                local_candidates,
                events,
            },
        ))
    }
}

impl PeerTransport for RtcTransport {
    type Channel = RtcDataChannel;

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .context("Failed to create data channel")?;
        attach_channel(dc, self.events.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .context("Failed to set local offer")?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .context("Failed to set local answer")?;
        Ok(sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string())?,
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string())?,
        };
        self.pc
            .set_remote_description(description)
            .await
            .context("Failed to set remote description")?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .context("Failed to add ICE candidate")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing peer connection");
        self.pc.close().await?;
        Ok(())
    }
}
