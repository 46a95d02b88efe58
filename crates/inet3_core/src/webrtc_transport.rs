/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use inet3_protocol::{IceCandidate, SessionDescription};
use tracing::{debug, warn};

use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::CoreConfig;
use crate::error::{SessionError, SessionResult};
use crate::transport::{
    ChannelMessage, DataChannel, EventSink, PeerTransport, TransportEventKind, TransportFactory, TransportState,
};

/// Sends block while the SCTP send buffer holds more than this.
const BUFFERED_HIGH_WATER: usize = 1024 * 1024;
const BUFFERED_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct WebrtcTransportFactory {
    ice_urls: Vec<String>,
    ice_username: Option<String>,
    ice_credential: Option<String>,
    label: String,
}

impl WebrtcTransportFactory {
    pub fn new(
        ice_urls: Vec<String>,
        ice_username: Option<String>,
        ice_credential: Option<String>,
        label: &str,
    ) -> Self {
        Self {
            ice_urls,
            ice_username,
            ice_credential,
            label: label.to_string(),
        }
    }

    pub fn from_config(cfg: &CoreConfig) -> Self {
        Self::new(cfg.ice_urls(), cfg.ice_username(), cfg.ice_credential(), &cfg.channel_label())
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_urls.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_urls.clone(),
            username: self.ice_username.clone().unwrap_or_default(),
            credential: self.ice_credential.clone().unwrap_or_default(),
            ..Default::default()
        }]
    }
}

#[async_trait]
impl TransportFactory for WebrtcTransportFactory {
    async fn create(&self, peer_id: &str, events: EventSink) -> SessionResult<Arc<dyn PeerTransport>> {
        let api = APIBuilder::new().build();
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers(),
                ..Default::default()
            })
            .await
            .map_err(SessionError::transport)?;
        let pc = Arc::new(pc);

        // Trickle ICE from us -> remote, via the manager.
        {
            let sink = events.clone();
            pc.on_ice_candidate(Box::new(move |cand| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(cand) = cand else { return };
                    match cand.to_json() {
                        Ok(init) => sink.emit(TransportEventKind::LocalCandidate(candidate_from_init(init))),
                        Err(e) => warn!(peer=%sink.peer_id(), "webrtc candidate to_json failed: {e:#}"),
                    }
                })
            }));
        }

        {
            let sink = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    if let Some(state) = map_state(st) {
                        sink.emit(TransportEventKind::StateChanged(state));
                    }
                })
            }));
        }

        // Answerer side: the remote creates the channel.
        {
            let sink = events.clone();
            let label = self.label.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let sink = sink.clone();
                let label = label.clone();
                Box::pin(async move {
                    if dc.label() != label {
                        debug!(peer=%sink.peer_id(), got=%dc.label(), want=%label, "unexpected data channel label");
                    }
                    wire_channel(dc, sink);
                })
            }));
        }

        debug!(peer=%peer_id, session=events.session(), "webrtc peer connection created");
        Ok(Arc::new(WebrtcTransport {
            pc,
            sink: events,
            label: self.label.clone(),
        }))
    }
}

fn map_state(st: RTCPeerConnectionState) -> Option<TransportState> {
    match st {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn candidate_to_init(c: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

fn to_rtc(desc: SessionDescription) -> SessionResult<RTCSessionDescription> {
    let v = serde_json::to_value(&desc).map_err(SessionError::transport)?;
    serde_json::from_value(v).map_err(|e| SessionError::MalformedFrame(format!("session description: {e}")))
}

fn from_rtc(desc: &RTCSessionDescription) -> SessionResult<SessionDescription> {
    let v = serde_json::to_value(desc).map_err(SessionError::transport)?;
    serde_json::from_value(v).map_err(SessionError::transport)
}

/// Registers open/message/close handlers; the channel is handed to the
/// session layer only once it is open.
fn wire_channel(dc: Arc<RTCDataChannel>, sink: EventSink) {
    {
        let sink = sink.clone();
        let dc2 = dc.clone();
        dc.on_open(Box::new(move || {
            let channel: Arc<dyn DataChannel> = Arc::new(WebrtcChannel {
                peer_id: sink.peer_id().to_string(),
                dc: dc2,
            });
            sink.emit(TransportEventKind::ChannelOpen(channel));
            Box::pin(async {})
        }));
    }
    {
        let sink = sink.clone();
        dc.on_message(Box::new(move |m: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                let msg = if m.is_string {
                    ChannelMessage::Text(String::from_utf8_lossy(&m.data).into_owned())
                } else {
                    ChannelMessage::Binary(m.data)
                };
                sink.emit(TransportEventKind::ChannelMessage(msg));
            })
        }));
    }
    dc.on_close(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(TransportEventKind::ChannelClosed);
        })
    }));
}

pub struct WebrtcTransport {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
    label: String,
}

#[async_trait]
impl PeerTransport for WebrtcTransport {
    async fn create_offer(&self) -> SessionResult<SessionDescription> {
        let dc = self
            .pc
            .create_data_channel(
                &self.label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SessionError::Transport(format!("create datachannel failed: {e:#}")))?;
        wire_channel(dc, self.sink.clone());

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| SessionError::Transport(format!("create_offer failed: {e:#}")))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| SessionError::Transport(format!("set_local_description failed: {e:#}")))?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> SessionResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SessionError::Transport(format!("create_answer failed: {e:#}")))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| SessionError::Transport(format!("set_local_description failed: {e:#}")))?;
        from_rtc(&answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> SessionResult<()> {
        let desc = to_rtc(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| SessionError::Transport(format!("set_remote_description failed: {e:#}")))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SessionResult<()> {
        if self.pc.remote_description().await.is_none() {
            return Err(SessionError::Transport("remote description not set".to_string()));
        }
        self.pc
            .add_ice_candidate(candidate_to_init(candidate))
            .await
            .map_err(|e| SessionError::Transport(format!("add_ice_candidate failed: {e:#}")))
    }

    async fn close(&self) -> SessionResult<()> {
        self.pc.close().await.map_err(SessionError::transport)
    }
}

struct WebrtcChannel {
    peer_id: String,
    dc: Arc<RTCDataChannel>,
}

impl WebrtcChannel {
    async fn wait_writable(&self) -> SessionResult<()> {
        while self.dc.buffered_amount().await > BUFFERED_HIGH_WATER {
            if !self.is_open() {
                return Err(SessionError::ChannelNotOpen(self.peer_id.clone()));
            }
            tokio::time::sleep(BUFFERED_POLL).await;
        }
        if !self.is_open() {
            return Err(SessionError::ChannelNotOpen(self.peer_id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl DataChannel for WebrtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> SessionResult<()> {
        self.wait_writable().await?;
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Transport(format!("dc send: {e:#}")))
    }

    async fn send_binary(&self, data: Bytes) -> SessionResult<()> {
        self.wait_writable().await?;
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Transport(format!("dc send: {e:#}")))
    }

    async fn close(&self) -> SessionResult<()> {
        self.dc.close().await.map_err(SessionError::transport)
    }
}
