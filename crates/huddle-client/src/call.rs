//! Room call orchestration: who offers, who answers, and cleanup when a side leaves.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use huddle_common::{ClientEvent, IceCandidate, RelayEvent, SessionDescription};

use crate::media::{LocalMedia, RemoteMedia};
use crate::peer::PeerLink;
use crate::signaling::{self, SignalingLink};
use crate::types::{CallCommand, CallConfig, CallEvent, CallOutcome, MediaKind, Role};

const EVENT_CAPACITY: usize = 64;

pub struct Call {
    config: CallConfig,
    signaling: SignalingLink,
    role: Role,
    local: Option<LocalMedia>,
    peer: Option<PeerLink>,
    remote: Arc<RemoteMedia>,
    events: broadcast::Sender<CallEvent>,
}

impl Call {
    /// Connects to the relay named in `config`.
    pub async fn connect(config: CallConfig) -> Result<Self> {
        let link = signaling::connect(&config.signaling_url).await?;
        Ok(Self::new(config, link))
    }

    pub fn new(config: CallConfig, signaling: SignalingLink) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            signaling,
            role: Role::Guest,
            local: None,
            peer: None,
            remote: Arc::new(RemoteMedia::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// The sink receiving the peer's tracks, shared with the running call.
    pub fn remote_media(&self) -> Arc<RemoteMedia> {
        Arc::clone(&self.remote)
    }

    /// Joins the room and drives the call until we leave, the room turns out
    /// full, or the relay goes away. `commands` closing counts as leaving.
    pub async fn run(mut self, mut commands: mpsc::Receiver<CallCommand>) -> Result<CallOutcome> {
        info!("joining room {}", self.config.room);
        self.signaling
            .emit(ClientEvent::Join {
                room: self.config.room.clone(),
            })
            .await?;

        loop {
            tokio::select! {
                event = self.signaling.next_event() => {
                    let Some(event) = event else {
                        warn!("signaling connection closed");
                        self.teardown().await;
                        return Ok(CallOutcome::Disconnected);
                    };
                    if let Some(outcome) = self.handle_relay_event(event).await {
                        return Ok(outcome);
                    }
                }
                command = commands.recv() => match command {
                    Some(CallCommand::ToggleMic) => self.toggle_mic(),
                    Some(CallCommand::ToggleCamera) => self.toggle_camera(),
                    Some(CallCommand::Stats) => {
                        let stats = self.remote.stats();
                        info!(
                            "remote media: {} track(s), {} packet(s), {} byte(s)",
                            stats.tracks, stats.packets, stats.bytes
                        );
                        self.publish(CallEvent::Stats(stats));
                    }
                    Some(CallCommand::Leave) | None => {
                        self.leave_room().await;
                        return Ok(CallOutcome::Left);
                    }
                },
            }
        }
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) -> Option<CallOutcome> {
        debug!("relay event: {}", event.name());
        match event {
            RelayEvent::Created => self.on_room_created(),
            RelayEvent::Joined => self.on_room_joined().await,
            RelayEvent::Ready => self.on_peer_ready().await,
            RelayEvent::Offer { description } => self.on_offer(description).await,
            RelayEvent::Answer { description } => self.on_answer(description).await,
            RelayEvent::IceCandidate { candidate } => self.on_remote_candidate(candidate).await,
            RelayEvent::Leave => self.on_peer_left().await,
            RelayEvent::Full => {
                warn!("room {} is full", self.config.room);
                self.publish(CallEvent::RoomFull);
                self.teardown().await;
                return Some(CallOutcome::RoomFull);
            }
        }
        None
    }

    fn on_room_created(&mut self) {
        info!("created room {}, waiting for a peer", self.config.room);
        self.role = Role::Host;
        self.publish(CallEvent::RoleAssigned(Role::Host));
        self.acquire_local_media();
    }

    async fn on_room_joined(&mut self) {
        info!("joined room {}", self.config.room);
        self.role = Role::Guest;
        self.publish(CallEvent::RoleAssigned(Role::Guest));
        self.acquire_local_media();
        let ready = ClientEvent::Ready {
            room: self.config.room.clone(),
        };
        if let Err(e) = self.signaling.emit(ready).await {
            error!("failed to announce readiness: {:#}", e);
        }
    }

    async fn on_peer_ready(&mut self) {
        if self.role != Role::Host {
            debug!("ignoring ready as guest");
            return;
        }
        if let Err(e) = self.start_call().await {
            error!("failed to start call: {:#}", e);
        }
    }

    async fn start_call(&mut self) -> Result<()> {
        let peer = self.new_peer().await?;
        let offer = peer.create_offer().await?;
        info!("sending offer to peer");
        self.signaling
            .emit(ClientEvent::Offer {
                room: self.config.room.clone(),
                description: offer,
            })
            .await
    }

    async fn on_offer(&mut self, description: SessionDescription) {
        if self.role != Role::Guest {
            debug!("ignoring offer as host");
            return;
        }
        if let Err(e) = self.answer_call(description).await {
            error!("failed to answer call: {:#}", e);
        }
    }

    async fn answer_call(&mut self, offer: SessionDescription) -> Result<()> {
        let peer = self.new_peer().await?;
        let answer = peer.accept_offer(offer).await?;
        info!("sending answer to peer");
        self.signaling
            .emit(ClientEvent::Answer {
                room: self.config.room.clone(),
                description: answer,
            })
            .await
    }

    async fn on_answer(&mut self, description: SessionDescription) {
        let Some(peer) = self.peer.as_ref() else {
            debug!("answer arrived without a peer connection");
            return;
        };
        if let Err(e) = peer.accept_answer(description).await {
            error!("failed to apply answer: {:#}", e);
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(peer) = self.peer.as_ref() else {
            warn!("ICE candidate arrived with no peer connection");
            return;
        };
        if let Err(e) = peer.add_remote_candidate(candidate).await {
            warn!("failed to add remote ICE candidate: {:#}", e);
        }
    }

    async fn on_peer_left(&mut self) {
        // Whoever stays is alone in the room and offers to the next arrival.
        info!("peer left room {}", self.config.room);
        self.role = Role::Host;
        self.remote.stop();
        self.close_peer().await;
        self.publish(CallEvent::PeerLeft);
    }

    /// Replaces any existing connection with a fresh one carrying our tracks.
    async fn new_peer(&mut self) -> Result<&PeerLink> {
        self.close_peer().await;
        let peer = PeerLink::new(
            &self.config.ice_servers,
            self.config.room.clone(),
            self.signaling.sender(),
            Arc::clone(&self.remote),
            self.events.clone(),
        )
        .await?;
        if self.local.is_none() {
            warn!("no local media, negotiating receive-only");
        }
        peer.add_local_tracks(self.local.as_ref()).await?;
        Ok(&*self.peer.insert(peer))
    }

    fn acquire_local_media(&mut self) {
        if self.local.is_some() {
            return;
        }
        match LocalMedia::acquire(&self.config.media) {
            Ok(media) => {
                self.local = Some(media);
                self.publish(CallEvent::LocalMediaReady);
            }
            Err(e) => error!("failed to open local media: {:#}", e),
        }
    }

    fn toggle_mic(&mut self) {
        if let Some(active) = self.toggle(MediaKind::Audio) {
            info!("microphone {}", if active { "unmuted" } else { "muted" });
            self.publish(CallEvent::MicToggled { active });
        }
    }

    fn toggle_camera(&mut self) {
        if let Some(active) = self.toggle(MediaKind::Video) {
            info!("camera {}", if active { "started" } else { "stopped" });
            self.publish(CallEvent::CameraToggled { active });
        }
    }

    fn toggle(&self, kind: MediaKind) -> Option<bool> {
        match self.local.as_ref() {
            Some(local) => Some(local.toggle(kind)),
            None => {
                warn!("no local media to toggle {}", kind);
                None
            }
        }
    }

    /// Tells the relay we are going, then releases everything.
    async fn leave_room(&mut self) {
        info!("leaving room {}", self.config.room);
        let leave = ClientEvent::Leave {
            room: self.config.room.clone(),
        };
        if let Err(e) = self.signaling.emit(leave).await {
            warn!("could not notify relay about leaving: {:#}", e);
        }
        self.teardown().await;
        self.publish(CallEvent::Left);
    }

    async fn teardown(&mut self) {
        if let Some(mut local) = self.local.take() {
            local.stop();
        }
        self.remote.stop();
        self.close_peer().await;
        self.signaling.disconnect().await;
    }

    async fn close_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!("error closing peer connection: {:#}", e);
            }
        }
    }

    fn publish(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}
