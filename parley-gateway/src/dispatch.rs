//! Operation dispatch for authenticated connections.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use parley_core::config::SessionConfig;
use parley_core::models::{ChannelId, ChannelKind, UserId};
use parley_core::radio::{now_unix, playback_payload, RadioCoordinator};
use parley_core::store::{ChannelStore, RadioStore, UserStore};
use parley_sfu::Sfu;

use crate::hub::{ClientHandle, HubHandle};
use crate::protocol::{
    AnswerPayload, DeafenPayload, Envelope, IcePayload, JoinVoicePayload, MutePayload,
    PlaylistSnapshot, RadioPlayPayload, RadioPositionPayload, RadioStationRef, ReadyPayload,
    ScreenAnswerPayload, ScreenChannelPayload, ScreenIcePayload, ScreenShareErrorPayload,
    ScreenSharePayload, ServerMutePayload, SpeakingPayload,
};

/// Everything the session layer needs to serve one connection: the hub,
/// the SFU, the radio coordinator, and the external collaborators.
pub struct Gateway {
    pub(crate) hub: HubHandle,
    pub(crate) sfu: Arc<Sfu>,
    pub(crate) radio: Arc<RadioCoordinator>,
    pub(crate) users: Arc<dyn UserStore>,
    pub(crate) channels: Arc<dyn ChannelStore>,
    pub(crate) radio_store: Arc<dyn RadioStore>,
    pub(crate) session: SessionConfig,
}

impl Gateway {
    #[must_use]
    pub fn new(
        hub: HubHandle,
        sfu: Arc<Sfu>,
        radio: Arc<RadioCoordinator>,
        users: Arc<dyn UserStore>,
        channels: Arc<dyn ChannelStore>,
        radio_store: Arc<dyn RadioStore>,
        session: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            sfu,
            radio,
            users,
            channels,
            radio_store,
            session,
        })
    }

    /// Route one inbound frame. Unknown operations and payloads that fail
    /// to parse are dropped; the connection stays up.
    pub async fn dispatch(&self, client: &ClientHandle, envelope: Envelope) {
        let user = &client.user;
        match envelope.op.as_str() {
            "join_voice" => {
                let Some(d) = parse::<JoinVoicePayload>(envelope.data) else {
                    return;
                };
                self.join_voice(client, ChannelId::from(d.channel_id)).await;
            }
            "leave_voice" => self.leave_voice(&user.id).await,
            "webrtc_answer" => {
                let Some(d) = parse::<AnswerPayload>(envelope.data) else {
                    return;
                };
                if let Some(room) = self.sfu.user_room(&user.id) {
                    room.handle_answer(&user.id, d.sdp).await;
                }
            }
            "webrtc_ice" => {
                let Some(d) = parse::<IcePayload>(envelope.data) else {
                    return;
                };
                if let Some(room) = self.sfu.user_room(&user.id) {
                    room.handle_ice(&user.id, d.candidate).await;
                }
            }
            "voice_self_mute" => {
                if let Some(d) = parse::<MutePayload>(envelope.data) {
                    self.update_voice_flags(&user.id, |peer| peer.set_self_mute(d.muted));
                }
            }
            "voice_self_deafen" => {
                if let Some(d) = parse::<DeafenPayload>(envelope.data) {
                    self.update_voice_flags(&user.id, |peer| peer.set_self_deafen(d.deafened));
                }
            }
            "voice_speaking" => {
                if let Some(d) = parse::<SpeakingPayload>(envelope.data) {
                    self.update_voice_flags(&user.id, |peer| peer.set_speaking(d.speaking));
                }
            }
            "voice_server_mute" => {
                if !user.is_admin {
                    debug!(user_id = %user.id, "voice_server_mute from non-admin ignored");
                    return;
                }
                if let Some(d) = parse::<ServerMutePayload>(envelope.data) {
                    let target = UserId::from(d.user_id);
                    self.update_voice_flags(&target, |peer| peer.set_server_mute(d.muted));
                }
            }
            "screen_share_start" => self.screen_share_start(client).await,
            "screen_share_stop" => {
                if let Some(room) = self.sfu.user_screen_room(&user.id) {
                    let channel_id = room.channel_id.clone();
                    self.sfu.stop_screen_share(&channel_id).await;
                }
            }
            "screen_share_subscribe" => {
                let Some(d) = parse::<ScreenChannelPayload>(envelope.data) else {
                    return;
                };
                let Some(room) = self.sfu.screen_room(&ChannelId::from(d.channel_id)) else {
                    self.screen_error(client, "no active screen share in this channel");
                    return;
                };
                if let Err(e) = room.add_viewer(&user.id).await {
                    warn!(user_id = %user.id, error = %e, "screen share subscribe");
                }
            }
            "screen_share_unsubscribe" => {
                let Some(d) = parse::<ScreenChannelPayload>(envelope.data) else {
                    return;
                };
                if let Some(room) = self.sfu.screen_room(&ChannelId::from(d.channel_id)) {
                    room.remove_viewer(&user.id).await;
                }
            }
            "webrtc_screen_answer" => {
                if let Some(d) = parse::<ScreenAnswerPayload>(envelope.data) {
                    self.sfu.handle_screen_answer(&user.id, d.sdp, d.role).await;
                }
            }
            "webrtc_screen_ice" => {
                if let Some(d) = parse::<ScreenIcePayload>(envelope.data) {
                    self.sfu.handle_screen_ice(&user.id, d.candidate, d.role).await;
                }
            }
            "radio_play" => {
                if let Some(d) = parse::<RadioPlayPayload>(envelope.data) {
                    self.radio.play(user, &d.station_id, &d.playlist_id).await;
                }
            }
            "radio_pause" => {
                if let Some(d) = parse::<RadioPositionPayload>(envelope.data) {
                    self.radio.pause(user, &d.station_id, d.position).await;
                }
            }
            "radio_resume" => {
                if let Some(d) = parse::<RadioStationRef>(envelope.data) {
                    self.radio.resume(user, &d.station_id).await;
                }
            }
            "radio_seek" => {
                if let Some(d) = parse::<RadioPositionPayload>(envelope.data) {
                    self.radio.seek(user, &d.station_id, d.position).await;
                }
            }
            "radio_next" => {
                if let Some(d) = parse::<RadioStationRef>(envelope.data) {
                    self.radio.next(user, &d.station_id).await;
                }
            }
            "radio_stop" => {
                if let Some(d) = parse::<RadioStationRef>(envelope.data) {
                    self.radio.stop(user, &d.station_id).await;
                }
            }
            "radio_track_ended" => {
                if let Some(d) = parse::<RadioStationRef>(envelope.data) {
                    self.radio.track_ended(&d.station_id).await;
                }
            }
            "radio_tune" => {
                if let Some(d) = parse::<RadioStationRef>(envelope.data) {
                    self.radio.tune(&user.id, &d.station_id);
                }
            }
            "radio_untune" => self.radio.untune(&user.id),
            "ping" => {
                if let Ok(frame) = Envelope::event("pong", &Value::Null) {
                    client.enqueue(frame);
                }
            }
            other => debug!(user_id = %user.id, op = %other, "unknown operation"),
        }
    }

    /// Join only real voice channels; anything else is silently ignored.
    /// Joining while in another room leaves that room first.
    async fn join_voice(&self, client: &ClientHandle, channel_id: ChannelId) {
        let user_id = &client.user.id;
        match self.channels.channel(&channel_id).await {
            Ok(Some(channel)) if channel.kind == ChannelKind::Voice => {}
            _ => {
                debug!(user_id = %user_id, channel_id = %channel_id, "join_voice for non-voice channel ignored");
                return;
            }
        }

        if let Some(current) = self.sfu.user_room(user_id) {
            if current.channel_id == channel_id {
                return;
            }
            // Moving rooms is a leave: a presenter's share ends with it,
            // same as leave_voice.
            if let Some(screen_room) = self.sfu.user_screen_room(user_id) {
                let screen_channel = screen_room.channel_id.clone();
                self.sfu.stop_screen_share(&screen_channel).await;
            }
            current.remove_peer(user_id).await;
        }

        let room = self.sfu.get_or_create_room(&channel_id);
        match room.add_peer(user_id).await {
            Ok(peer) => self.hub.broadcast_event("voice_state_update", &peer.voice_state()),
            Err(e) => warn!(user_id = %user_id, channel_id = %channel_id, error = %e, "join voice"),
        }
    }

    /// Leaving voice also stops the user's own screen share; a presenter
    /// cannot present in a channel they are not in.
    async fn leave_voice(&self, user_id: &UserId) {
        if let Some(screen_room) = self.sfu.user_screen_room(user_id) {
            let channel_id = screen_room.channel_id.clone();
            self.sfu.stop_screen_share(&channel_id).await;
        }
        if let Some(room) = self.sfu.user_room(user_id) {
            room.remove_peer(user_id).await;
        }
    }

    fn update_voice_flags<F>(&self, user_id: &UserId, apply: F)
    where
        F: FnOnce(&Arc<parley_sfu::VoicePeer>) -> parley_core::models::VoiceState,
    {
        let Some(peer) = self.sfu.user_room(user_id).and_then(|room| room.peer(user_id)) else {
            return;
        };
        let state = apply(&peer);
        self.hub.broadcast_event("voice_state_update", &state);
    }

    async fn screen_share_start(&self, client: &ClientHandle) {
        let user_id = &client.user.id;
        let Some(room) = self.sfu.user_room(user_id) else {
            self.screen_error(client, "must be in a voice channel to share screen");
            return;
        };
        let channel_id = room.channel_id.clone();

        match self.sfu.start_screen_share(&channel_id, user_id).await {
            Ok(_) => self.hub.broadcast_event(
                "screen_share_started",
                &ScreenSharePayload {
                    user_id: user_id.as_str().to_owned(),
                    channel_id: channel_id.as_str().to_owned(),
                },
            ),
            Err(e) => self.screen_error(client, &e.to_string()),
        }
    }

    /// Hook for channel administration: a deleted voice channel drains
    /// its room (each departure broadcasts the empty voice state) and
    /// stops any active screen share there.
    pub async fn channel_deleted(&self, channel_id: &ChannelId) {
        if self.sfu.screen_room(channel_id).is_some() {
            self.sfu.stop_screen_share(channel_id).await;
        }
        if let Some(room) = self.sfu.room(channel_id) {
            for user_id in room.peer_ids() {
                room.remove_peer(&user_id).await;
            }
        }
    }

    /// Hook for catalog administration: a deleted playlist stops any
    /// station currently playing it.
    pub fn playlist_deleted(&self, playlist_id: &parley_core::models::PlaylistId) {
        self.radio.playlist_deleted(playlist_id);
    }

    /// Screen share failures are reported, not swallowed; the client needs
    /// to know to stop waiting for an offer.
    fn screen_error(&self, client: &ClientHandle, reason: &str) {
        if let Ok(frame) = Envelope::event(
            "screen_share_error",
            &ScreenShareErrorPayload {
                error: reason.to_string(),
            },
        ) {
            client.enqueue(frame);
        }
    }

    /// Assemble the post-authenticate snapshot. Collaborator failures
    /// degrade their slice to empty rather than failing the handshake.
    pub(crate) async fn ready_payload(&self, user: &parley_core::models::UserProfile) -> ReadyPayload {
        let channels = self.channels.channels().await.unwrap_or_default();
        let online_users = self.hub.online_users().await;
        let radio_stations = self.radio_store.stations().await.unwrap_or_default();

        let mut radio_playlists = Vec::new();
        for station in &radio_stations {
            let playlist_ids = self
                .radio_store
                .playlists_for_station(&station.id)
                .await
                .unwrap_or_default();
            for playlist_id in playlist_ids {
                let tracks = self
                    .radio_store
                    .tracks_for_playlist(&playlist_id)
                    .await
                    .unwrap_or_default();
                radio_playlists.push(PlaylistSnapshot {
                    id: playlist_id,
                    station_id: station.id.clone(),
                    tracks,
                });
            }
        }

        let screen_shares = self
            .sfu
            .screen_shares()
            .into_iter()
            .map(|share| ScreenSharePayload {
                user_id: share.user_id.as_str().to_owned(),
                channel_id: share.channel_id.as_str().to_owned(),
            })
            .collect();

        ReadyPayload {
            user: user.clone(),
            channels,
            online_users,
            voice_states: self.sfu.voice_states(),
            screen_shares,
            radio_stations,
            radio_playlists,
            radio_playback: self
                .radio
                .playback_snapshot()
                .iter()
                .map(playback_payload)
                .collect(),
            radio_listeners: serde_json::to_value(self.radio.listeners_snapshot())
                .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
            server_time: now_unix(),
        }
    }
}

fn parse<T: DeserializeOwned>(data: Value) -> Option<T> {
    serde_json::from_value(data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use parley_core::config::WebRtcConfig;
    use parley_core::models::{
        ChannelInfo, PlayMode, PlaylistId, StationId, StationInfo, TrackId, TrackInfo, UserProfile,
    };
    use parley_core::store::{MemoryChannelStore, MemoryRadioStore, MemoryUserStore};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn profile(id: &str, admin: bool) -> UserProfile {
        UserProfile {
            id: UserId::from(id),
            username: id.to_string(),
            is_admin: admin,
            is_approved: true,
        }
    }

    struct Harness {
        gateway: Arc<Gateway>,
        radio_store: Arc<MemoryRadioStore>,
        channel_store: Arc<MemoryChannelStore>,
    }

    fn harness() -> Harness {
        let sfu = Sfu::new(&WebRtcConfig {
            ice_servers: Vec::new(),
            public_ip: None,
        })
        .expect("sfu");
        let radio_store = Arc::new(MemoryRadioStore::new());
        let channel_store = Arc::new(MemoryChannelStore::new());
        let radio = Arc::new(RadioCoordinator::new(
            Arc::clone(&radio_store) as Arc<dyn RadioStore>
        ));
        let (hub, handle) = Hub::new(Arc::clone(&sfu), Arc::clone(&radio));
        sfu.set_signal_sink(Arc::new(handle.clone()));
        radio.set_broadcaster(Arc::new(handle.clone()));
        tokio::spawn(hub.run());

        let gateway = Gateway::new(
            handle,
            sfu,
            radio,
            Arc::new(MemoryUserStore::new()),
            Arc::clone(&channel_store) as Arc<dyn ChannelStore>,
            Arc::clone(&radio_store) as Arc<dyn RadioStore>,
            SessionConfig::default(),
        );
        Harness {
            gateway,
            radio_store,
            channel_store,
        }
    }

    fn connected(h: &Harness, id: &str, admin: bool) -> (ClientHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        let client = ClientHandle::new(profile(id, admin), tx, CancellationToken::new());
        h.gateway.hub.register(client.clone());
        (client, rx)
    }

    async fn next_op(rx: &mut mpsc::Receiver<String>) -> (String, Value) {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open");
        let envelope = Envelope::parse(&frame).expect("envelope");
        (envelope.op, envelope.data)
    }

    fn envelope(op: &str, data: Value) -> Envelope {
        Envelope {
            op: op.to_string(),
            data,
        }
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let h = harness();
        let (client, mut rx) = connected(&h, "u1", false);
        h.gateway.dispatch(&client, envelope("ping", Value::Null)).await;
        let (op, _) = next_op(&mut rx).await;
        assert_eq!(op, "pong");
    }

    #[tokio::test]
    async fn unknown_op_is_ignored() {
        let h = harness();
        let (client, mut rx) = connected(&h, "u1", false);
        h.gateway
            .dispatch(&client, envelope("definitely_not_an_op", json!({})))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_voice_rejects_text_channels() {
        let h = harness();
        h.channel_store.insert(ChannelInfo {
            id: ChannelId::from("general"),
            name: "general".to_string(),
            kind: ChannelKind::Text,
            position: 0,
        });
        let (client, _rx) = connected(&h, "u1", false);

        h.gateway
            .dispatch(&client, envelope("join_voice", json!({"channel_id": "general"})))
            .await;
        assert!(h.gateway.sfu.user_room(&client.user.id).is_none());
    }

    #[tokio::test]
    async fn join_voice_moves_between_rooms() {
        let h = harness();
        for id in ["voice-1", "voice-2"] {
            h.channel_store.insert(ChannelInfo {
                id: ChannelId::from(id),
                name: id.to_string(),
                kind: ChannelKind::Voice,
                position: 0,
            });
        }
        let (client, _rx) = connected(&h, "u1", false);

        h.gateway
            .dispatch(&client, envelope("join_voice", json!({"channel_id": "voice-1"})))
            .await;
        h.gateway
            .dispatch(&client, envelope("join_voice", json!({"channel_id": "voice-2"})))
            .await;

        let room = h.gateway.sfu.user_room(&client.user.id).expect("in a room");
        assert_eq!(room.channel_id.as_str(), "voice-2");
        assert!(h.gateway.sfu.room(&ChannelId::from("voice-1")).is_none());
    }

    #[tokio::test]
    async fn screen_share_start_outside_voice_errors() {
        let h = harness();
        let (client, mut rx) = connected(&h, "u1", false);

        h.gateway
            .dispatch(&client, envelope("screen_share_start", json!({})))
            .await;

        let (op, data) = next_op(&mut rx).await;
        assert_eq!(op, "screen_share_error");
        assert!(data["error"].as_str().is_some());
        assert!(h.gateway.sfu.screen_shares().is_empty());
    }

    #[tokio::test]
    async fn screen_share_subscribe_to_nothing_errors() {
        let h = harness();
        let (client, mut rx) = connected(&h, "u1", false);

        h.gateway
            .dispatch(
                &client,
                envelope("screen_share_subscribe", json!({"channel_id": "voice-1"})),
            )
            .await;

        let (op, _) = next_op(&mut rx).await;
        assert_eq!(op, "screen_share_error");
    }

    #[tokio::test]
    async fn server_mute_requires_admin() {
        let h = harness();
        h.channel_store.insert(ChannelInfo {
            id: ChannelId::from("voice-1"),
            name: "voice-1".to_string(),
            kind: ChannelKind::Voice,
            position: 0,
        });
        let (target, _rx_t) = connected(&h, "target", false);
        h.gateway
            .dispatch(&target, envelope("join_voice", json!({"channel_id": "voice-1"})))
            .await;
        let peer = h
            .gateway
            .sfu
            .user_room(&target.user.id)
            .and_then(|room| room.peer(&target.user.id))
            .expect("peer");

        let (pleb, _rx_p) = connected(&h, "pleb", false);
        h.gateway
            .dispatch(
                &pleb,
                envelope("voice_server_mute", json!({"user_id": "target", "muted": true})),
            )
            .await;
        assert!(!peer.voice_state().server_mute);

        let (admin, _rx_a) = connected(&h, "admin", true);
        h.gateway
            .dispatch(
                &admin,
                envelope("voice_server_mute", json!({"user_id": "target", "muted": true})),
            )
            .await;
        assert!(peer.voice_state().server_mute);
    }

    #[tokio::test]
    async fn moving_voice_rooms_stops_presenters_share() {
        let h = harness();
        for id in ["voice-1", "voice-2"] {
            h.channel_store.insert(ChannelInfo {
                id: ChannelId::from(id),
                name: id.to_string(),
                kind: ChannelKind::Voice,
                position: 0,
            });
        }
        let (client, _rx) = connected(&h, "u1", false);

        h.gateway
            .dispatch(&client, envelope("join_voice", json!({"channel_id": "voice-1"})))
            .await;
        h.gateway
            .dispatch(&client, envelope("screen_share_start", json!({})))
            .await;
        assert_eq!(h.gateway.sfu.screen_shares().len(), 1);

        h.gateway
            .dispatch(&client, envelope("join_voice", json!({"channel_id": "voice-2"})))
            .await;
        assert!(h.gateway.sfu.screen_shares().is_empty());

        h.gateway
            .dispatch(&client, envelope("screen_share_start", json!({})))
            .await;
        let shares = h.gateway.sfu.screen_shares();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].channel_id.as_str(), "voice-2");
    }

    #[tokio::test]
    async fn deleted_channel_drains_voice_and_screen() {
        let h = harness();
        h.channel_store.insert(ChannelInfo {
            id: ChannelId::from("voice-1"),
            name: "voice-1".to_string(),
            kind: ChannelKind::Voice,
            position: 0,
        });
        let (client, _rx) = connected(&h, "u1", false);
        h.gateway
            .dispatch(&client, envelope("join_voice", json!({"channel_id": "voice-1"})))
            .await;
        h.gateway
            .dispatch(&client, envelope("screen_share_start", json!({})))
            .await;
        assert_eq!(h.gateway.sfu.screen_shares().len(), 1);

        h.gateway.channel_deleted(&ChannelId::from("voice-1")).await;

        assert!(h.gateway.sfu.user_room(&client.user.id).is_none());
        assert!(h.gateway.sfu.screen_shares().is_empty());
        assert!(h.gateway.sfu.room(&ChannelId::from("voice-1")).is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let h = harness();
        let (client, _rx) = connected(&h, "u1", false);
        // channel_id has the wrong type; the frame must be ignored.
        h.gateway
            .dispatch(&client, envelope("join_voice", json!({"channel_id": 7})))
            .await;
        assert!(h.gateway.sfu.user_room(&client.user.id).is_none());
    }

    #[tokio::test]
    async fn ready_snapshot_degrades_and_reports() {
        let h = harness();
        h.channel_store.insert(ChannelInfo {
            id: ChannelId::from("general"),
            name: "general".to_string(),
            kind: ChannelKind::Text,
            position: 0,
        });
        h.radio_store.insert_station(StationInfo {
            id: StationId::from("s1"),
            name: "lounge".to_string(),
            playback_mode: PlayMode::LoopAll,
            manager_ids: vec![],
        });
        h.radio_store
            .insert_playlist(&StationId::from("s1"), PlaylistId::from("p1"));
        h.radio_store.insert_track(
            &PlaylistId::from("p1"),
            TrackInfo {
                id: TrackId::from("t1"),
                playlist_id: PlaylistId::from("p1"),
                title: "t1".to_string(),
                url: "/radio/t1.opus".to_string(),
                duration: 30.0,
                position: 0,
            },
        );

        let ready = h.gateway.ready_payload(&profile("u1", false)).await;
        assert_eq!(ready.channels.len(), 1);
        assert_eq!(ready.radio_stations.len(), 1);
        assert_eq!(ready.radio_playlists.len(), 1);
        assert_eq!(ready.radio_playlists[0].tracks.len(), 1);
        assert!(ready.radio_playback.is_empty());
        assert!(ready.server_time > 0.0);
    }
}
