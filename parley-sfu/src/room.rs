use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use parley_core::models::{ChannelId, UserId};

use crate::manager::Sfu;
use crate::peer::VoicePeer;

/// One voice channel's live session.
///
/// Lock discipline: peer handles are cloned out of the map before any
/// signaling call; nothing awaits while holding the map lock.
pub struct Room {
    pub channel_id: ChannelId,
    sfu: Weak<Sfu>,
    peers: RwLock<HashMap<UserId, Arc<VoicePeer>>>,
}

impl Room {
    pub(crate) fn new(channel_id: ChannelId, sfu: Weak<Sfu>) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            sfu,
            peers: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn peer(&self, user_id: &UserId) -> Option<Arc<VoicePeer>> {
        self.peers.read().get(user_id).cloned()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<UserId> {
        self.peers.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub(crate) fn peers_snapshot(&self) -> Vec<Arc<VoicePeer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Create the server-side leg for a joining user and send them an
    /// offer. On failure no partial state remains.
    pub async fn add_peer(self: &Arc<Self>, user_id: &UserId) -> Result<Arc<VoicePeer>> {
        let sfu = self.sfu.upgrade().context("sfu dropped")?;
        let pc = Arc::new(
            sfu.voice_api()
                .new_peer_connection(sfu.rtc_config())
                .await?,
        );

        // The client only ever sends audio to us on this leg.
        if let Err(e) = pc
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
        {
            let _ = pc.close().await;
            return Err(e.into());
        }

        let peer = Arc::new(VoicePeer::new(
            user_id.clone(),
            self.channel_id.clone(),
            Arc::clone(&pc),
        ));

        {
            let room = Arc::downgrade(self);
            let peer = Arc::downgrade(&peer);
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let room = room.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    if let (Some(room), Some(peer)) = (room.upgrade(), peer.upgrade()) {
                        room.on_peer_track(peer, track).await;
                    }
                })
            }));
        }

        {
            let sfu_weak = Arc::downgrade(&sfu);
            let uid = user_id.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let sfu = sfu_weak.clone();
                let uid = uid.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let Some(sfu) = sfu.upgrade() else { return };
                    let Some(sink) = sfu.sink() else { return };
                    match candidate.to_json() {
                        Ok(init) => match serde_json::to_value(init) {
                            Ok(value) => {
                                sink.signal(&uid, "webrtc_ice", json!({ "candidate": value }));
                            }
                            Err(e) => warn!(user_id = %uid, error = %e, "serialize ICE candidate"),
                        },
                        Err(e) => warn!(user_id = %uid, error = %e, "ICE candidate to_json"),
                    }
                })
            }));
        }

        {
            let room = Arc::downgrade(self);
            let uid = user_id.clone();
            let channel_id = self.channel_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let room = room.clone();
                let uid = uid.clone();
                let channel_id = channel_id.clone();
                Box::pin(async move {
                    debug!(channel_id = %channel_id, user_id = %uid, state = %state, "voice peer state");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(room) = room.upgrade() {
                            room.remove_peer(&uid).await;
                        }
                    }
                })
            }));
        }

        // Forward the existing participants' audio to the newcomer.
        for other in self.peers_snapshot() {
            if other.user_id == *user_id {
                continue;
            }
            if let Some(track) = other.local_track() {
                match pc
                    .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                {
                    Ok(sender) => drain_rtcp(sender),
                    Err(e) => {
                        warn!(user_id = %user_id, from = %other.user_id, error = %e, "add existing track");
                    }
                }
            }
        }

        // Claim the gate and send the initial offer before the peer becomes
        // visible in the map, so a concurrent track change defers instead of
        // racing a second offer.
        peer.gate_request(true);
        let offer = match pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e.into());
            }
        };
        let sdp = offer.sdp.clone();
        if let Err(e) = pc.set_local_description(offer).await {
            let _ = pc.close().await;
            return Err(e.into());
        }

        self.peers.write().insert(user_id.clone(), Arc::clone(&peer));

        if let Some(sink) = sfu.sink() {
            sink.signal(user_id, "webrtc_offer", json!({ "sdp": sdp }));
        }

        debug!(channel_id = %self.channel_id, user_id = %user_id, peers = self.peer_count(), "peer joined voice");
        Ok(peer)
    }

    /// Idempotent: explicit leave and disconnect can race.
    pub async fn remove_peer(&self, user_id: &UserId) {
        let (peer, empty) = {
            let mut peers = self.peers.write();
            let Some(peer) = peers.remove(user_id) else {
                return;
            };
            (peer, peers.is_empty())
        };

        let _ = peer.pc().close().await;

        let sfu = self.sfu.upgrade();
        if let Some(sink) = sfu.as_ref().and_then(|s| s.sink()) {
            sink.peer_removed(user_id);
        }

        // Remaining peers renegotiate so the departed track is dropped.
        for peer in self.peers_snapshot() {
            self.renegotiate(&peer).await;
        }

        // Empty rooms are deleted immediately; re-creation is cheap.
        if empty {
            if let Some(sfu) = sfu {
                sfu.remove_room(&self.channel_id);
            }
        }
        debug!(channel_id = %self.channel_id, user_id = %user_id, "peer left voice");
    }

    pub async fn handle_answer(&self, user_id: &UserId, sdp: String) {
        let Some(peer) = self.peer(user_id) else {
            debug!(channel_id = %self.channel_id, user_id = %user_id, "answer for unknown peer");
            return;
        };
        let answer = match RTCSessionDescription::answer(sdp) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "malformed answer");
                return;
            }
        };
        if let Err(e) = peer.pc().set_remote_description(answer).await {
            warn!(user_id = %user_id, error = %e, "set remote description");
            return;
        }
        if peer.gate_complete() {
            debug!(user_id = %user_id, "replaying deferred renegotiation");
            self.renegotiate(&peer).await;
        }
    }

    pub async fn handle_ice(&self, user_id: &UserId, candidate: RTCIceCandidateInit) {
        let Some(peer) = self.peer(user_id) else {
            return;
        };
        if let Err(e) = peer.pc().add_ice_candidate(candidate).await {
            warn!(user_id = %user_id, error = %e, "add ICE candidate");
        }
    }

    /// A newly published track is added to every other peer's leg, each of
    /// which then renegotiates (or defers).
    async fn on_peer_track(self: Arc<Self>, peer: Arc<VoicePeer>, track: Arc<TrackRemote>) {
        debug!(channel_id = %self.channel_id, user_id = %peer.user_id, "got audio track");

        let local = Arc::new(TrackLocalStaticRTP::new(
            track.codec().capability,
            track.id(),
            track.stream_id(),
        ));
        peer.set_local_track(Arc::clone(&local));

        self.add_track_to_others(&peer.user_id, &local).await;

        // Forward loop; server mute discards instead of forwarding so the
        // flag flips mid-stream without touching the transport.
        let forward_peer = Arc::clone(&peer);
        tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                if forward_peer.server_muted() {
                    continue;
                }
                if local.write_rtp(&packet).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn add_track_to_others(&self, from: &UserId, track: &Arc<TrackLocalStaticRTP>) {
        for peer in self.peers_snapshot() {
            if peer.user_id == *from {
                continue;
            }
            match peer
                .pc()
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => drain_rtcp(sender),
                Err(e) => {
                    warn!(from = %from, to = %peer.user_id, error = %e, "add track");
                    continue;
                }
            }
            self.renegotiate(&peer).await;
        }
    }

    pub(crate) async fn renegotiate(&self, peer: &Arc<VoicePeer>) {
        let transport_stable = peer.pc().signaling_state() == RTCSignalingState::Stable;
        if !peer.gate_request(transport_stable) {
            debug!(user_id = %peer.user_id, "renegotiation deferred");
            return;
        }
        if let Err(e) = self.send_offer(peer).await {
            peer.gate_abort();
            warn!(user_id = %peer.user_id, error = %e, "renegotiation offer failed");
        }
    }

    async fn send_offer(&self, peer: &Arc<VoicePeer>) -> Result<()> {
        let offer = peer.pc().create_offer(None).await?;
        let sdp = offer.sdp.clone();
        peer.pc().set_local_description(offer).await?;
        if let Some(sink) = self.sfu.upgrade().and_then(|s| s.sink()) {
            sink.signal(&peer.user_id, "webrtc_offer", json!({ "sdp": sdp }));
        }
        Ok(())
    }
}

/// The sender is unusable until its RTCP stream is consumed.
pub(crate) fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}
