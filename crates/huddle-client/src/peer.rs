use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use huddle_common::{ClientEvent, IceCandidate, RoomName, SdpKind, SessionDescription};

use crate::media::{LocalMedia, RemoteMedia};
use crate::types::{CallEvent, MediaKind};

/// One WebRTC connection to the other occupant of the room.
pub struct PeerLink {
    pc: Arc<RTCPeerConnection>,
    /// Candidates that arrived before the remote description.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

impl PeerLink {
    /// Creates the connection and wires its callbacks.
    ///
    /// Local candidates are sent to the relay as `ice-candidate` for `room`,
    /// incoming tracks are handed to `remote`.
    pub async fn new(
        ice_servers: &[String],
        room: RoomName,
        outbound: mpsc::Sender<ClientEvent>,
        remote: Arc<RemoteMedia>,
        events: broadcast::Sender<CallEvent>,
    ) -> Result<Self> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let outbound = outbound.clone();
            let room = room.clone();
            Box::pin(async move {
                // `None` marks the end of gathering; browsers ignore it too.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let event = ClientEvent::IceCandidate {
                            room,
                            candidate: candidate_to_wire(init),
                        };
                        if outbound.send(event).await.is_err() {
                            debug!("signaling gone, dropping local ICE candidate");
                        }
                    }
                    Err(e) => warn!("failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = MediaKind::from_codec_type(track.kind());
            remote.attach(track);
            if let Some(kind) = kind {
                let _ = track_events.send(CallEvent::RemoteTrack(kind));
            }
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("peer connection state: {}", state);
            if state == RTCPeerConnectionState::Connected {
                let _ = events.send(CallEvent::PeerConnected);
            }
            Box::pin(async {})
        }));

        Ok(Self {
            pc,
            pending_candidates: Mutex::new(Vec::new()),
        })
    }

    /// Adds audio then video. Without local media both directions are
    /// negotiated receive-only so the peer's tracks still arrive.
    pub async fn add_local_tracks(&self, media: Option<&LocalMedia>) -> Result<()> {
        let Some(media) = media else {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                self.pc
                    .add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
            }
            return Ok(());
        };

        for track in media.tracks() {
            let sender = self.pc.add_track(track).await?;
            // RTCP has to be read for interceptors (NACK, reports) to run.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    /// Creates an offer and installs it as the local description.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        description_to_wire(&offer)
    }

    /// Applies the peer's offer and returns our answer, already installed locally.
    pub async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        description_to_wire(&answer)
    }

    pub async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        self.set_remote_description(answer).await
    }

    /// Adds a remote candidate, or queues it until the remote description is known.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = candidate_from_wire(candidate);
        if self.pc.remote_description().await.is_none() {
            let mut pending = self.pending_candidates.lock().await;
            pending.push(init);
            debug!("queued remote ICE candidate ({} pending)", pending.len());
            return Ok(());
        }
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    pub async fn pending_candidates(&self) -> usize {
        self.pending_candidates.lock().await.len()
    }

    /// Detaches callbacks and closes the connection.
    pub async fn close(self) -> Result<()> {
        self.pc
            .on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.close().await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(description_from_wire(description)?)
            .await?;

        let pending = std::mem::take(&mut *self.pending_candidates.lock().await);
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!("failed to apply queued ICE candidate: {}", e);
            }
        }
        Ok(())
    }
}

pub fn description_to_wire(description: &RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => return Err(anyhow!("session description has no type")),
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

pub fn description_from_wire(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpKind::Rollback => return Err(anyhow!("rollback descriptions are not supported")),
    };
    Ok(parsed)
}

pub fn candidate_to_wire(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

pub fn candidate_from_wire(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}
