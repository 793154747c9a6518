use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use parley_core::models::{ChannelId, UserId};

use crate::manager::Sfu;
use crate::peer::RenegotiationGate;
use crate::room::drain_rtcp;

/// One viewer's independent signaling leg.
pub(crate) struct ScreenViewer {
    pub(crate) user_id: UserId,
    pc: Arc<RTCPeerConnection>,
    gate: Mutex<RenegotiationGate>,
}

#[derive(Default)]
struct ScreenRoomInner {
    presenter_pc: Option<Arc<RTCPeerConnection>>,
    video_track: Option<Arc<TrackLocalStaticRTP>>,
    audio_track: Option<Arc<TrackLocalStaticRTP>>,
    viewers: HashMap<UserId, Arc<ScreenViewer>>,
    stopped: bool,
}

/// One active presenter session in a channel: a single presenter leg fans
/// video (and optionally audio) out to any number of viewer legs.
///
/// Teardown always goes through [`Sfu::stop_screen_share`], which emits the
/// stopped notification exactly once no matter which path triggered it.
pub struct ScreenRoom {
    pub channel_id: ChannelId,
    pub presenter_id: UserId,
    sfu: Weak<Sfu>,
    inner: RwLock<ScreenRoomInner>,
}

impl ScreenRoom {
    pub(crate) fn new(channel_id: ChannelId, presenter_id: UserId, sfu: Weak<Sfu>) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            presenter_id,
            sfu,
            inner: RwLock::new(ScreenRoomInner::default()),
        })
    }

    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.inner.read().viewers.len()
    }

    pub(crate) fn has_viewer(&self, user_id: &UserId) -> bool {
        self.inner.read().viewers.contains_key(user_id)
    }

    fn viewer(&self, user_id: &UserId) -> Option<Arc<ScreenViewer>> {
        self.inner.read().viewers.get(user_id).cloned()
    }

    fn viewers_snapshot(&self) -> Vec<Arc<ScreenViewer>> {
        self.inner.read().viewers.values().cloned().collect()
    }

    /// Build the presenter's recv-only leg and send them an offer.
    pub(crate) async fn setup_presenter(self: &Arc<Self>) -> Result<()> {
        let sfu = self.sfu.upgrade().context("sfu dropped")?;
        let pc = Arc::new(
            sfu.screen_api()
                .new_peer_connection(sfu.rtc_config())
                .await
                .context("create presenter leg")?,
        );

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            if let Err(e) = pc
                .add_transceiver_from_kind(
                    kind,
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
        }

        {
            let room = Arc::downgrade(self);
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let room = room.clone();
                Box::pin(async move {
                    if let Some(room) = room.upgrade() {
                        room.on_presenter_track(track).await;
                    }
                })
            }));
        }

        self.wire_ice(&pc, self.presenter_id.clone());

        {
            let sfu_weak = Arc::downgrade(&sfu);
            let channel_id = self.channel_id.clone();
            let presenter_id = self.presenter_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let sfu = sfu_weak.clone();
                let channel_id = channel_id.clone();
                let presenter_id = presenter_id.clone();
                Box::pin(async move {
                    debug!(channel_id = %channel_id, presenter_id = %presenter_id, state = %state, "presenter state");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(sfu) = sfu.upgrade() {
                            sfu.stop_screen_share(&channel_id).await;
                        }
                    }
                })
            }));
        }

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

        self.inner.write().presenter_pc = Some(pc);

        if let Some(sink) = sfu.sink() {
            sink.signal(&self.presenter_id, "webrtc_screen_offer", json!({ "sdp": sdp }));
        }
        Ok(())
    }

    /// Each viewer gets its own sendonly leg with its own
    /// offer/answer/ICE exchange.
    pub async fn add_viewer(self: &Arc<Self>, user_id: &UserId) -> Result<()> {
        let sfu = self.sfu.upgrade().context("sfu dropped")?;
        let pc = Arc::new(
            sfu.screen_api()
                .new_peer_connection(sfu.rtc_config())
                .await
                .context("create viewer leg")?,
        );

        let viewer = Arc::new(ScreenViewer {
            user_id: user_id.clone(),
            pc: Arc::clone(&pc),
            gate: Mutex::new(RenegotiationGate::new()),
        });

        // Tracks the presenter has already published.
        let (video, audio) = {
            let inner = self.inner.read();
            (inner.video_track.clone(), inner.audio_track.clone())
        };
        for track in [video, audio].into_iter().flatten() {
            match pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => drain_rtcp(sender),
                Err(e) => warn!(user_id = %user_id, error = %e, "add screen track to viewer"),
            }
        }

        self.wire_ice(&pc, user_id.clone());

        {
            let room = Arc::downgrade(self);
            let uid = user_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let room = room.clone();
                let uid = uid.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(room) = room.upgrade() {
                            room.remove_viewer(&uid).await;
                        }
                    }
                })
            }));
        }

        viewer.gate.lock().request(true);
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

        self.inner.write().viewers.insert(user_id.clone(), viewer);

        if let Some(sink) = sfu.sink() {
            sink.signal(user_id, "webrtc_screen_offer", json!({ "sdp": sdp }));
        }
        debug!(channel_id = %self.channel_id, user_id = %user_id, "viewer subscribed");
        Ok(())
    }

    pub async fn remove_viewer(&self, user_id: &UserId) {
        let viewer = self.inner.write().viewers.remove(user_id);
        if let Some(viewer) = viewer {
            let _ = viewer.pc.close().await;
            debug!(channel_id = %self.channel_id, user_id = %user_id, "viewer unsubscribed");
        }
    }

    /// Close every leg. Idempotent; notification is the manager's job.
    pub(crate) async fn stop(&self) {
        let (presenter, viewers) = {
            let mut inner = self.inner.write();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            inner.video_track = None;
            inner.audio_track = None;
            (
                inner.presenter_pc.take(),
                std::mem::take(&mut inner.viewers),
            )
        };
        for viewer in viewers.into_values() {
            let _ = viewer.pc.close().await;
        }
        if let Some(pc) = presenter {
            let _ = pc.close().await;
        }
    }

    pub(crate) async fn handle_answer(&self, user_id: &UserId, sdp: String, presenter: bool) {
        let answer = match RTCSessionDescription::answer(sdp) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "malformed screen answer");
                return;
            }
        };

        if presenter && *user_id == self.presenter_id {
            let pc = self.inner.read().presenter_pc.clone();
            if let Some(pc) = pc {
                if let Err(e) = pc.set_remote_description(answer).await {
                    warn!(user_id = %user_id, error = %e, "presenter answer");
                }
            }
            return;
        }

        let Some(viewer) = self.viewer(user_id) else {
            return;
        };
        if let Err(e) = viewer.pc.set_remote_description(answer).await {
            warn!(user_id = %user_id, error = %e, "viewer answer");
            return;
        }
        let replay = viewer.gate.lock().complete();
        if replay {
            debug!(user_id = %user_id, "replaying deferred viewer renegotiation");
            self.renegotiate_viewer(&viewer).await;
        }
    }

    pub(crate) async fn handle_ice(
        &self,
        user_id: &UserId,
        candidate: RTCIceCandidateInit,
        presenter: bool,
    ) {
        let pc = if presenter && *user_id == self.presenter_id {
            self.inner.read().presenter_pc.clone()
        } else {
            self.viewer(user_id).map(|v| Arc::clone(&v.pc))
        };
        let Some(pc) = pc else { return };
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            warn!(user_id = %user_id, error = %e, "add screen ICE candidate");
        }
    }

    async fn on_presenter_track(self: Arc<Self>, track: Arc<TrackRemote>) {
        let kind = track.kind();
        debug!(channel_id = %self.channel_id, presenter_id = %self.presenter_id, kind = %kind, "presenter track");

        let local = Arc::new(TrackLocalStaticRTP::new(
            track.codec().capability,
            track.id(),
            track.stream_id(),
        ));

        {
            let mut inner = self.inner.write();
            if kind == RTPCodecType::Video {
                inner.video_track = Some(Arc::clone(&local));
            } else {
                inner.audio_track = Some(Arc::clone(&local));
            }
        }

        // Viewers who subscribed before the track arrived pick it up now.
        for viewer in self.viewers_snapshot() {
            match viewer
                .pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => drain_rtcp(sender),
                Err(e) => {
                    warn!(user_id = %viewer.user_id, error = %e, "add presenter track to viewer");
                    continue;
                }
            }
            self.renegotiate_viewer(&viewer).await;
        }

        tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                if local.write_rtp(&packet).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn renegotiate_viewer(&self, viewer: &Arc<ScreenViewer>) {
        let transport_stable = viewer.pc.signaling_state() == RTCSignalingState::Stable;
        if !viewer.gate.lock().request(transport_stable) {
            debug!(user_id = %viewer.user_id, "viewer renegotiation deferred");
            return;
        }
        let result: Result<()> = async {
            let offer = viewer.pc.create_offer(None).await?;
            let sdp = offer.sdp.clone();
            viewer.pc.set_local_description(offer).await?;
            if let Some(sink) = self.sfu.upgrade().and_then(|s| s.sink()) {
                sink.signal(&viewer.user_id, "webrtc_screen_offer", json!({ "sdp": sdp }));
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            viewer.gate.lock().abort();
            warn!(user_id = %viewer.user_id, error = %e, "viewer renegotiation failed");
        }
    }

    fn wire_ice(&self, pc: &Arc<RTCPeerConnection>, user_id: UserId) {
        let sfu = self.sfu.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sfu = sfu.clone();
            let uid = user_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Some(sink) = sfu.upgrade().and_then(|s| s.sink()) else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_value(init) {
                        Ok(value) => {
                            sink.signal(&uid, "webrtc_screen_ice", json!({ "candidate": value }));
                        }
                        Err(e) => warn!(user_id = %uid, error = %e, "serialize screen ICE"),
                    },
                    Err(e) => warn!(user_id = %uid, error = %e, "screen ICE to_json"),
                }
            })
        }));
    }
}
