//! Top-level SFU registry: voice rooms and screen-share rooms by channel,
//! reverse lookups by user, and the signaling seam back to the session
//! layer.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;

use parley_core::config::WebRtcConfig;
use parley_core::models::{ChannelId, ScreenShareState, UserId, VoiceState};

use crate::engine;
use crate::room::Room;
use crate::screen::ScreenRoom;

/// Signaling and lifecycle events pushed back to the session layer.
pub trait SignalSink: Send + Sync {
    /// Deliver a signaling event to one user's connection.
    fn signal(&self, user_id: &UserId, op: &'static str, data: serde_json::Value);

    /// A peer left voice, by any path; broadcast the empty voice state.
    fn peer_removed(&self, user_id: &UserId);

    /// A screen share ended, by any path. Emitted exactly once per share.
    fn screen_share_stopped(&self, presenter_id: &UserId, channel_id: &ChannelId);
}

/// Which leg of a screen room a signaling frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenRole {
    Presenter,
    Viewer,
}

pub struct Sfu {
    voice_api: API,
    screen_api: API,
    rtc_config: RTCConfiguration,
    sink: RwLock<Option<Arc<dyn SignalSink>>>,
    rooms: RwLock<HashMap<ChannelId, Arc<Room>>>,
    screen_rooms: RwLock<HashMap<ChannelId, Arc<ScreenRoom>>>,
}

impl Sfu {
    pub fn new(config: &WebRtcConfig) -> Result<Arc<Self>> {
        let voice_api = engine::voice_api(config.public_ip.as_deref())?;
        let screen_api = engine::screen_api(config.public_ip.as_deref())?;
        info!(
            ice_servers = config.ice_servers.len(),
            public_ip = config.public_ip.as_deref().unwrap_or("-"),
            "SFU initialized"
        );
        Ok(Arc::new(Self {
            voice_api,
            screen_api,
            rtc_config: engine::rtc_configuration(&config.ice_servers),
            sink: RwLock::new(None),
            rooms: RwLock::new(HashMap::new()),
            screen_rooms: RwLock::new(HashMap::new()),
        }))
    }

    /// Wire the session layer in. Until set, signaling events are dropped.
    pub fn set_signal_sink(&self, sink: Arc<dyn SignalSink>) {
        *self.sink.write() = Some(sink);
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn SignalSink>> {
        self.sink.read().clone()
    }

    pub(crate) fn voice_api(&self) -> &API {
        &self.voice_api
    }

    pub(crate) fn screen_api(&self) -> &API {
        &self.screen_api
    }

    pub(crate) fn rtc_config(&self) -> RTCConfiguration {
        self.rtc_config.clone()
    }

    // ---- voice rooms ----

    pub fn get_or_create_room(self: &Arc<Self>, channel_id: &ChannelId) -> Arc<Room> {
        let mut rooms = self.rooms.write();
        if let Some(room) = rooms.get(channel_id) {
            return Arc::clone(room);
        }
        let room = Room::new(channel_id.clone(), Arc::downgrade(self));
        rooms.insert(channel_id.clone(), Arc::clone(&room));
        info!(channel_id = %channel_id, "voice room created");
        room
    }

    #[must_use]
    pub fn room(&self, channel_id: &ChannelId) -> Option<Arc<Room>> {
        self.rooms.read().get(channel_id).cloned()
    }

    pub(crate) fn remove_room(&self, channel_id: &ChannelId) {
        if self.rooms.write().remove(channel_id).is_some() {
            info!(channel_id = %channel_id, "voice room removed");
        }
    }

    /// Reverse lookup: the room a user currently occupies, if any.
    #[must_use]
    pub fn user_room(&self, user_id: &UserId) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .values()
            .find(|room| room.peer(user_id).is_some())
            .cloned()
    }

    /// All voice states across all rooms, for the ready snapshot.
    #[must_use]
    pub fn voice_states(&self) -> Vec<VoiceState> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().values().cloned().collect();
        rooms
            .iter()
            .flat_map(|room| {
                room.peers_snapshot()
                    .into_iter()
                    .map(|peer| peer.voice_state())
            })
            .collect()
    }

    // ---- screen share ----

    /// At most one share per channel, and a user presents in at most one
    /// room at a time. The caller validates that the presenter is in the
    /// channel's voice room.
    pub async fn start_screen_share(
        self: &Arc<Self>,
        channel_id: &ChannelId,
        presenter_id: &UserId,
    ) -> Result<Arc<ScreenRoom>> {
        let room = {
            let mut screen_rooms = self.screen_rooms.write();
            if screen_rooms.contains_key(channel_id) {
                return Err(anyhow!(
                    "screen share already active in channel {channel_id}"
                ));
            }
            if screen_rooms
                .values()
                .any(|room| room.presenter_id == *presenter_id)
            {
                return Err(anyhow!(
                    "user {presenter_id} is already sharing in another channel"
                ));
            }
            let room = ScreenRoom::new(
                channel_id.clone(),
                presenter_id.clone(),
                Arc::downgrade(self),
            );
            screen_rooms.insert(channel_id.clone(), Arc::clone(&room));
            room
        };

        if let Err(e) = room.setup_presenter().await {
            self.screen_rooms.write().remove(channel_id);
            warn!(channel_id = %channel_id, presenter_id = %presenter_id, error = %e, "screen share setup failed");
            return Err(e);
        }

        info!(channel_id = %channel_id, presenter_id = %presenter_id, "screen share started");
        Ok(room)
    }

    /// The single teardown path: user stop, presenter disconnect, and
    /// leave-voice all land here, and the stopped notification fires once.
    pub async fn stop_screen_share(&self, channel_id: &ChannelId) {
        let Some(room) = self.screen_rooms.write().remove(channel_id) else {
            return;
        };
        room.stop().await;
        info!(channel_id = %channel_id, presenter_id = %room.presenter_id, "screen share stopped");
        if let Some(sink) = self.sink() {
            sink.screen_share_stopped(&room.presenter_id, channel_id);
        }
    }

    #[must_use]
    pub fn screen_room(&self, channel_id: &ChannelId) -> Option<Arc<ScreenRoom>> {
        self.screen_rooms.read().get(channel_id).cloned()
    }

    /// The room a user is presenting in, if any.
    #[must_use]
    pub fn user_screen_room(&self, user_id: &UserId) -> Option<Arc<ScreenRoom>> {
        self.screen_rooms
            .read()
            .values()
            .find(|room| room.presenter_id == *user_id)
            .cloned()
    }

    #[must_use]
    pub fn screen_shares(&self) -> Vec<ScreenShareState> {
        self.screen_rooms
            .read()
            .values()
            .map(|room| ScreenShareState {
                channel_id: room.channel_id.clone(),
                user_id: room.presenter_id.clone(),
            })
            .collect()
    }

    /// Route a screen answer to the right leg. The `role` tag picks the
    /// presenter leg when the presenter also views another share.
    pub async fn handle_screen_answer(
        &self,
        user_id: &UserId,
        sdp: String,
        role: Option<ScreenRole>,
    ) {
        if role != Some(ScreenRole::Viewer) {
            if let Some(room) = self.user_screen_room(user_id) {
                room.handle_answer(user_id, sdp, true).await;
                return;
            }
        }
        let room = self
            .screen_rooms
            .read()
            .values()
            .find(|room| room.has_viewer(user_id))
            .cloned();
        if let Some(room) = room {
            room.handle_answer(user_id, sdp, false).await;
        }
    }

    pub async fn handle_screen_ice(
        &self,
        user_id: &UserId,
        candidate: RTCIceCandidateInit,
        role: Option<ScreenRole>,
    ) {
        if role != Some(ScreenRole::Viewer) {
            if let Some(room) = self.user_screen_room(user_id) {
                room.handle_ice(user_id, candidate, true).await;
                return;
            }
        }
        let room = self
            .screen_rooms
            .read()
            .values()
            .find(|room| room.has_viewer(user_id))
            .cloned();
        if let Some(room) = room {
            room.handle_ice(user_id, candidate, false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, String)>>,
    }

    impl RecordingSink {
        fn count(&self, op: &str) -> usize {
            self.events.lock().iter().filter(|(o, _)| o == op).count()
        }
    }

    impl SignalSink for RecordingSink {
        fn signal(&self, user_id: &UserId, op: &'static str, _data: serde_json::Value) {
            self.events
                .lock()
                .push((op.to_string(), user_id.as_str().to_string()));
        }

        fn peer_removed(&self, user_id: &UserId) {
            self.events
                .lock()
                .push(("peer_removed".to_string(), user_id.as_str().to_string()));
        }

        fn screen_share_stopped(&self, presenter_id: &UserId, _channel_id: &ChannelId) {
            self.events.lock().push((
                "screen_share_stopped".to_string(),
                presenter_id.as_str().to_string(),
            ));
        }
    }

    fn sfu_with_sink() -> (Arc<Sfu>, Arc<RecordingSink>) {
        let sfu = Sfu::new(&WebRtcConfig {
            ice_servers: Vec::new(),
            public_ip: None,
        })
        .expect("sfu");
        let sink = Arc::new(RecordingSink::default());
        sfu.set_signal_sink(sink.clone());
        (sfu, sink)
    }

    #[tokio::test]
    async fn membership_is_unique_and_removal_idempotent() {
        let (sfu, sink) = sfu_with_sink();
        let channel = ChannelId::from("voice-1");
        let user = UserId::from("u1");

        let room = sfu.get_or_create_room(&channel);
        room.add_peer(&user).await.expect("join");

        assert_eq!(
            sfu.user_room(&user).map(|r| r.channel_id.clone()),
            Some(channel.clone())
        );
        assert_eq!(sink.count("webrtc_offer"), 1);

        room.remove_peer(&user).await;
        assert!(sfu.user_room(&user).is_none());
        assert_eq!(sink.count("peer_removed"), 1);

        // Disconnect racing an explicit leave.
        room.remove_peer(&user).await;
        assert_eq!(sink.count("peer_removed"), 1);
    }

    #[tokio::test]
    async fn empty_room_is_deleted() {
        let (sfu, _sink) = sfu_with_sink();
        let channel = ChannelId::from("voice-1");
        let user = UserId::from("u1");

        let room = sfu.get_or_create_room(&channel);
        room.add_peer(&user).await.expect("join");
        assert!(sfu.room(&channel).is_some());

        room.remove_peer(&user).await;
        assert!(sfu.room(&channel).is_none());
    }

    #[tokio::test]
    async fn voice_states_snapshot() {
        let (sfu, _sink) = sfu_with_sink();
        let channel = ChannelId::from("voice-1");
        let room = sfu.get_or_create_room(&channel);
        let peer = room.add_peer(&UserId::from("u1")).await.expect("join");

        let state = peer.set_self_mute(true);
        assert!(state.self_mute);
        assert!(!state.self_deafen);

        let states = sfu.voice_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].channel_id, "voice-1");
        assert!(states[0].self_mute);
    }

    #[tokio::test]
    async fn screen_share_exclusive_per_channel() {
        let (sfu, sink) = sfu_with_sink();
        let channel = ChannelId::from("voice-1");

        sfu.start_screen_share(&channel, &UserId::from("u1"))
            .await
            .expect("first share");
        assert!(sfu
            .start_screen_share(&channel, &UserId::from("u2"))
            .await
            .is_err());

        sfu.stop_screen_share(&channel).await;
        assert_eq!(sink.count("screen_share_stopped"), 1);
        assert!(sfu.screen_room(&channel).is_none());

        // Channel is free again after stop.
        sfu.start_screen_share(&channel, &UserId::from("u2"))
            .await
            .expect("restart");
        assert_eq!(sfu.screen_shares().len(), 1);
    }

    #[tokio::test]
    async fn presenter_is_exclusive_across_channels() {
        let (sfu, _sink) = sfu_with_sink();
        let user = UserId::from("u1");

        sfu.start_screen_share(&ChannelId::from("voice-1"), &user)
            .await
            .expect("first share");
        assert!(sfu
            .start_screen_share(&ChannelId::from("voice-2"), &user)
            .await
            .is_err());
        assert_eq!(sfu.screen_shares().len(), 1);

        // Stopping the first share frees the presenter for another room,
        // and the reverse lookup tracks the move.
        sfu.stop_screen_share(&ChannelId::from("voice-1")).await;
        sfu.start_screen_share(&ChannelId::from("voice-2"), &user)
            .await
            .expect("share after stop");
        assert_eq!(
            sfu.user_screen_room(&user).map(|r| r.channel_id.clone()),
            Some(ChannelId::from("voice-2"))
        );
    }

    #[tokio::test]
    async fn stop_notification_fires_once() {
        let (sfu, sink) = sfu_with_sink();
        let channel = ChannelId::from("voice-1");
        sfu.start_screen_share(&channel, &UserId::from("u1"))
            .await
            .expect("share");

        sfu.stop_screen_share(&channel).await;
        sfu.stop_screen_share(&channel).await;
        assert_eq!(sink.count("screen_share_stopped"), 1);
    }
}
