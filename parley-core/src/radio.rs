//! Server-authoritative radio playback.
//!
//! Each station has at most one live [`StationPlayback`]; clients never
//! control the clock directly. Position is reconstructed from the stored
//! position plus elapsed wall time while playing, so every mutation stamps
//! `updated_at`. Listener sets only scope network fan-out of the
//! high-frequency playback events; the lightweight `radio_status`
//! indicator goes to every connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, warn};

use crate::models::{PlayMode, PlaylistId, StationId, TrackInfo, UserId, UserProfile};
use crate::store::RadioStore;

/// Fan-out seam so the coordinator can notify clients without knowing
/// about the connection registry.
pub trait RadioBroadcaster: Send + Sync {
    fn send_to_users(&self, user_ids: &[UserId], op: &'static str, data: serde_json::Value);
    fn broadcast_all(&self, op: &'static str, data: serde_json::Value);
}

/// Unix seconds with millisecond precision.
#[must_use]
pub fn now_unix() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// One station's live playback state.
#[derive(Debug, Clone)]
pub struct StationPlayback {
    pub station_id: StationId,
    pub playlist_id: PlaylistId,
    pub track_index: usize,
    pub playing: bool,
    /// Stored position in seconds at `updated_at`.
    pub position: f64,
    /// Unix seconds of the last mutation.
    pub updated_at: f64,
    /// User who started or last retargeted playback.
    pub user_id: UserId,
    /// Track list cached at play time; playlist edits take effect on the
    /// next playlist (re)start.
    pub tracks: Vec<TrackInfo>,
}

impl StationPlayback {
    #[must_use]
    pub fn current_track(&self) -> Option<&TrackInfo> {
        self.tracks.get(self.track_index)
    }

    /// Position at `now`, clamped to `[0, duration]` when the track's
    /// duration is known.
    #[must_use]
    pub fn current_position(&self, now: f64) -> f64 {
        let mut pos = if self.playing {
            self.position + (now - self.updated_at).max(0.0)
        } else {
            self.position
        };
        if let Some(track) = self.current_track() {
            if track.duration > 0.0 && pos > track.duration {
                pos = track.duration;
            }
        }
        pos.max(0.0)
    }
}

/// Result of trying to advance one track within the cached playlist.
enum TrackStep {
    Advanced(StationPlayback),
    Exhausted { playlist_id: PlaylistId, user_id: UserId },
    Idle,
}

pub struct RadioCoordinator {
    store: Arc<dyn RadioStore>,
    broadcaster: RwLock<Option<Arc<dyn RadioBroadcaster>>>,
    playback: RwLock<HashMap<StationId, StationPlayback>>,
    listeners: RwLock<HashMap<StationId, HashSet<UserId>>>,
}

impl RadioCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn RadioStore>) -> Self {
        Self {
            store,
            broadcaster: RwLock::new(None),
            playback: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Wire the fan-out sink. Events are silently skipped until this is set.
    pub fn set_broadcaster(&self, broadcaster: Arc<dyn RadioBroadcaster>) {
        *self.broadcaster.write() = Some(broadcaster);
    }

    fn broadcaster(&self) -> Option<Arc<dyn RadioBroadcaster>> {
        self.broadcaster.read().clone()
    }

    // ---- snapshots (ready event) ----

    #[must_use]
    pub fn playback_snapshot(&self) -> Vec<StationPlayback> {
        self.playback.read().values().cloned().collect()
    }

    #[must_use]
    pub fn listeners_snapshot(&self) -> HashMap<StationId, Vec<UserId>> {
        self.listeners
            .read()
            .iter()
            .map(|(station, users)| (station.clone(), users.iter().cloned().collect()))
            .collect()
    }

    #[must_use]
    pub fn playback_for(&self, station_id: &StationId) -> Option<StationPlayback> {
        self.playback.read().get(station_id).cloned()
    }

    // ---- authorization ----

    async fn can_manage(&self, user: &UserProfile, station_id: &StationId) -> bool {
        if user.is_admin {
            return true;
        }
        self.store
            .is_station_manager(station_id, &user.id)
            .await
            .unwrap_or(false)
    }

    // ---- control operations ----
    //
    // Rejected operations (unknown station/playlist, empty playlist, caller
    // not a manager) change no state and send no error frame.

    pub async fn play(&self, user: &UserProfile, station_id: &StationId, playlist_id: &PlaylistId) {
        if !self.can_manage(user, station_id).await {
            debug!(user_id = %user.id, station_id = %station_id, "radio play rejected");
            return;
        }
        let Ok(Some(_)) = self.store.station(station_id).await else {
            return;
        };
        if !self.store.playlist_exists(playlist_id).await.unwrap_or(false) {
            return;
        }
        let tracks = match self.store.tracks_for_playlist(playlist_id).await {
            Ok(tracks) if !tracks.is_empty() => tracks,
            _ => return,
        };
        self.start_playlist(station_id, playlist_id, &user.id, tracks);
    }

    pub async fn pause(&self, user: &UserProfile, station_id: &StationId, position: f64) {
        if !self.can_manage(user, station_id).await {
            return;
        }
        let updated = {
            let mut playback = self.playback.write();
            match playback.get_mut(station_id) {
                Some(pb) => {
                    pb.playing = false;
                    pb.position = position.max(0.0);
                    pb.updated_at = now_unix();
                    Some(pb.clone())
                }
                None => None,
            }
        };
        if let Some(pb) = updated {
            self.broadcast_playback(&pb);
            self.broadcast_status(&pb);
        }
    }

    pub async fn resume(&self, user: &UserProfile, station_id: &StationId) {
        if !self.can_manage(user, station_id).await {
            return;
        }
        let updated = {
            let mut playback = self.playback.write();
            match playback.get_mut(station_id) {
                Some(pb) => {
                    pb.playing = true;
                    pb.updated_at = now_unix();
                    Some(pb.clone())
                }
                None => None,
            }
        };
        if let Some(pb) = updated {
            self.broadcast_playback(&pb);
            self.broadcast_status(&pb);
        }
    }

    /// Concurrent seeks from two managers are last-write-wins.
    pub async fn seek(&self, user: &UserProfile, station_id: &StationId, position: f64) {
        if !self.can_manage(user, station_id).await {
            return;
        }
        let updated = {
            let mut playback = self.playback.write();
            match playback.get_mut(station_id) {
                Some(pb) => {
                    pb.position = position.max(0.0);
                    pb.updated_at = now_unix();
                    Some(pb.clone())
                }
                None => None,
            }
        };
        if let Some(pb) = updated {
            self.broadcast_playback(&pb);
        }
    }

    pub async fn next(&self, user: &UserProfile, station_id: &StationId) {
        if !self.can_manage(user, station_id).await {
            return;
        }
        self.step_or_advance(station_id).await;
    }

    pub async fn stop(&self, user: &UserProfile, station_id: &StationId) {
        if !self.can_manage(user, station_id).await {
            return;
        }
        if self.playback.read().contains_key(station_id) {
            self.stop_station(station_id);
        }
    }

    /// Any listener may report that the current track finished; the server
    /// clock makes the report idempotent enough (a stale report for an
    /// already-advanced index still only moves forward).
    pub async fn track_ended(&self, station_id: &StationId) {
        self.step_or_advance(station_id).await;
    }

    // ---- listener sets ----

    /// Moves the user's subscription; a user listens to at most one station.
    pub fn tune(&self, user_id: &UserId, station_id: &StationId) {
        let previous = {
            let mut listeners = self.listeners.write();
            let previous = Self::remove_from_sets(&mut listeners, user_id);
            listeners
                .entry(station_id.clone())
                .or_default()
                .insert(user_id.clone());
            previous
        };
        if let Some(prev) = previous {
            if prev != *station_id {
                self.broadcast_listeners(&prev);
            }
        }
        self.broadcast_listeners(station_id);
    }

    /// Drops the user's subscription, if any. Also the disconnect path.
    pub fn untune(&self, user_id: &UserId) {
        let left = {
            let mut listeners = self.listeners.write();
            Self::remove_from_sets(&mut listeners, user_id)
        };
        if let Some(station_id) = left {
            self.broadcast_listeners(&station_id);
        }
    }

    fn remove_from_sets(
        listeners: &mut HashMap<StationId, HashSet<UserId>>,
        user_id: &UserId,
    ) -> Option<StationId> {
        let station = listeners
            .iter()
            .find(|(_, users)| users.contains(user_id))
            .map(|(station, _)| station.clone())?;
        if let Some(users) = listeners.get_mut(&station) {
            users.remove(user_id);
            if users.is_empty() {
                listeners.remove(&station);
            }
        }
        Some(station)
    }

    // ---- cross-cutting cleanup ----

    /// Called when a playlist is deleted: any station currently playing it
    /// stops, and its listeners are told.
    pub fn playlist_deleted(&self, playlist_id: &PlaylistId) {
        let stations: Vec<StationId> = {
            let playback = self.playback.read();
            playback
                .values()
                .filter(|pb| pb.playlist_id == *playlist_id)
                .map(|pb| pb.station_id.clone())
                .collect()
        };
        for station_id in stations {
            warn!(station_id = %station_id, playlist_id = %playlist_id, "playlist deleted while playing");
            self.stop_station(&station_id);
        }
    }

    // ---- internals ----

    fn step_track(&self, station_id: &StationId) -> TrackStep {
        let mut playback = self.playback.write();
        let Some(pb) = playback.get_mut(station_id) else {
            return TrackStep::Idle;
        };
        let next = pb.track_index + 1;
        if next < pb.tracks.len() {
            pb.track_index = next;
            pb.position = 0.0;
            pb.playing = true;
            pb.updated_at = now_unix();
            TrackStep::Advanced(pb.clone())
        } else {
            TrackStep::Exhausted {
                playlist_id: pb.playlist_id.clone(),
                user_id: pb.user_id.clone(),
            }
        }
    }

    async fn step_or_advance(&self, station_id: &StationId) {
        match self.step_track(station_id) {
            TrackStep::Advanced(pb) => {
                self.broadcast_playback(&pb);
                self.broadcast_status(&pb);
            }
            TrackStep::Exhausted {
                playlist_id,
                user_id,
            } => self.advance_playlist(station_id, &playlist_id, &user_id).await,
            TrackStep::Idle => {}
        }
    }

    /// Playlist ran out: apply the station's playback mode.
    async fn advance_playlist(
        &self,
        station_id: &StationId,
        playlist_id: &PlaylistId,
        user_id: &UserId,
    ) {
        let station = match self.store.station(station_id).await {
            Ok(Some(station)) => station,
            _ => {
                self.stop_station(station_id);
                return;
            }
        };

        match station.playback_mode {
            PlayMode::LoopOne => {
                let tracks = self
                    .store
                    .tracks_for_playlist(playlist_id)
                    .await
                    .unwrap_or_default();
                if tracks.is_empty() {
                    self.stop_station(station_id);
                } else {
                    self.start_playlist(station_id, playlist_id, user_id, tracks);
                }
            }
            PlayMode::PlayAll => {
                match self.next_playlist_with_tracks(station_id, playlist_id, false).await {
                    Some((next_id, tracks)) => {
                        self.start_playlist(station_id, &next_id, user_id, tracks);
                    }
                    None => self.stop_station(station_id),
                }
            }
            PlayMode::LoopAll => {
                match self.next_playlist_with_tracks(station_id, playlist_id, true).await {
                    Some((next_id, tracks)) => {
                        self.start_playlist(station_id, &next_id, user_id, tracks);
                    }
                    None => {
                        // Sole non-empty playlist: loop it.
                        let tracks = self
                            .store
                            .tracks_for_playlist(playlist_id)
                            .await
                            .unwrap_or_default();
                        if tracks.is_empty() {
                            self.stop_station(station_id);
                        } else {
                            self.start_playlist(station_id, playlist_id, user_id, tracks);
                        }
                    }
                }
            }
            PlayMode::Single => self.stop_station(station_id),
        }
    }

    /// Next playlist (creation order) with at least one track, skipping
    /// empty ones; never revisits the starting playlist, so an all-empty
    /// station terminates.
    async fn next_playlist_with_tracks(
        &self,
        station_id: &StationId,
        current: &PlaylistId,
        wrap: bool,
    ) -> Option<(PlaylistId, Vec<TrackInfo>)> {
        let playlists = self.store.playlists_for_station(station_id).await.ok()?;
        let current_idx = playlists.iter().position(|p| p == current)?;
        for offset in 1..playlists.len() {
            let mut idx = current_idx + offset;
            if idx >= playlists.len() {
                if !wrap {
                    return None;
                }
                idx %= playlists.len();
            }
            let tracks = self
                .store
                .tracks_for_playlist(&playlists[idx])
                .await
                .unwrap_or_default();
            if !tracks.is_empty() {
                return Some((playlists[idx].clone(), tracks));
            }
        }
        None
    }

    fn start_playlist(
        &self,
        station_id: &StationId,
        playlist_id: &PlaylistId,
        user_id: &UserId,
        tracks: Vec<TrackInfo>,
    ) {
        let pb = StationPlayback {
            station_id: station_id.clone(),
            playlist_id: playlist_id.clone(),
            track_index: 0,
            playing: true,
            position: 0.0,
            updated_at: now_unix(),
            user_id: user_id.clone(),
            tracks,
        };
        self.playback.write().insert(station_id.clone(), pb.clone());
        self.broadcast_playback(&pb);
        self.broadcast_status(&pb);
    }

    fn stop_station(&self, station_id: &StationId) {
        self.playback.write().remove(station_id);
        self.send_to_listeners(
            station_id,
            "radio_playback",
            json!({ "station_id": station_id, "stopped": true }),
        );
        if let Some(broadcaster) = self.broadcaster() {
            broadcaster.broadcast_all(
                "radio_status",
                json!({ "station_id": station_id, "live": false }),
            );
        }
    }

    // ---- fan-out ----

    fn send_to_listeners(&self, station_id: &StationId, op: &'static str, data: serde_json::Value) {
        let Some(broadcaster) = self.broadcaster() else {
            return;
        };
        let users: Vec<UserId> = self
            .listeners
            .read()
            .get(station_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if !users.is_empty() {
            broadcaster.send_to_users(&users, op, data);
        }
    }

    fn broadcast_playback(&self, pb: &StationPlayback) {
        self.send_to_listeners(&pb.station_id, "radio_playback", playback_payload(pb));
    }

    fn broadcast_status(&self, pb: &StationPlayback) {
        if let Some(broadcaster) = self.broadcaster() {
            broadcaster.broadcast_all(
                "radio_status",
                json!({
                    "station_id": pb.station_id,
                    "live": pb.playing,
                    "track": pb.current_track().map(|t| t.title.clone()),
                    "user_id": pb.user_id,
                }),
            );
        }
    }

    fn broadcast_listeners(&self, station_id: &StationId) {
        let Some(broadcaster) = self.broadcaster() else {
            return;
        };
        let user_ids: Vec<UserId> = self
            .listeners
            .read()
            .get(station_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        broadcaster.broadcast_all(
            "radio_listeners",
            json!({ "station_id": station_id, "user_ids": user_ids }),
        );
    }
}

/// The full playback event body, shared by control ops and the ready path.
#[must_use]
pub fn playback_payload(pb: &StationPlayback) -> serde_json::Value {
    json!({
        "station_id": pb.station_id,
        "playlist_id": pb.playlist_id,
        "track_index": pb.track_index,
        "track": pb.current_track(),
        "playing": pb.playing,
        "position": pb.position,
        "updated_at": pb.updated_at,
        "user_id": pb.user_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlayMode, StationInfo, TrackId, TrackInfo};
    use crate::store::MemoryRadioStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingBroadcaster {
        events: Mutex<Vec<(String, &'static str, serde_json::Value)>>,
    }

    impl RecordingBroadcaster {
        fn ops(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(|(_, op, _)| *op).collect()
        }

        fn last_of(&self, op: &str) -> Option<serde_json::Value> {
            self.events
                .lock()
                .iter()
                .rev()
                .find(|(_, o, _)| *o == op)
                .map(|(_, _, d)| d.clone())
        }
    }

    impl RadioBroadcaster for RecordingBroadcaster {
        fn send_to_users(&self, user_ids: &[UserId], op: &'static str, data: serde_json::Value) {
            let targets = user_ids
                .iter()
                .map(UserId::as_str)
                .collect::<Vec<_>>()
                .join(",");
            self.events.lock().push((targets, op, data));
        }

        fn broadcast_all(&self, op: &'static str, data: serde_json::Value) {
            self.events.lock().push(("*".to_string(), op, data));
        }
    }

    fn track(id: &str, playlist: &str, secs: f64, pos: i32) -> TrackInfo {
        TrackInfo {
            id: TrackId::from(id),
            playlist_id: PlaylistId::from(playlist),
            title: id.to_string(),
            url: format!("/tracks/{id}"),
            duration: secs,
            position: pos,
        }
    }

    fn admin() -> UserProfile {
        UserProfile {
            id: UserId::from("admin"),
            username: "admin".to_string(),
            is_admin: true,
            is_approved: true,
        }
    }

    fn listener(id: &str) -> UserProfile {
        UserProfile {
            id: UserId::from(id),
            username: id.to_string(),
            is_admin: false,
            is_approved: true,
        }
    }

    struct Fixture {
        store: Arc<MemoryRadioStore>,
        radio: RadioCoordinator,
        broadcaster: Arc<RecordingBroadcaster>,
        station: StationId,
    }

    fn fixture(mode: PlayMode) -> Fixture {
        let store = Arc::new(MemoryRadioStore::new());
        let station = StationId::from("s1");
        store.insert_station(StationInfo {
            id: station.clone(),
            name: "lofi".to_string(),
            playback_mode: mode,
            manager_ids: vec![UserId::from("mgr")],
        });
        let radio = RadioCoordinator::new(store.clone());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        radio.set_broadcaster(broadcaster.clone());
        Fixture {
            store,
            radio,
            broadcaster,
            station,
        }
    }

    fn seed_playlist(fx: &Fixture, playlist: &str, durations: &[f64]) -> PlaylistId {
        let playlist_id = PlaylistId::from(playlist);
        fx.store.insert_playlist(&fx.station, playlist_id.clone());
        for (i, secs) in durations.iter().enumerate() {
            fx.store.insert_track(
                &playlist_id,
                track(&format!("{playlist}-t{i}"), playlist, *secs, i as i32),
            );
        }
        playlist_id
    }

    #[tokio::test]
    async fn play_requires_manager_or_admin() {
        let fx = fixture(PlayMode::Single);
        let playlist = seed_playlist(&fx, "p1", &[30.0]);

        fx.radio.play(&listener("rando"), &fx.station, &playlist).await;
        assert!(fx.radio.playback_for(&fx.station).is_none());

        let manager = UserProfile {
            id: UserId::from("mgr"),
            username: "mgr".to_string(),
            is_admin: false,
            is_approved: true,
        };
        fx.radio.play(&manager, &fx.station, &playlist).await;
        assert!(fx.radio.playback_for(&fx.station).is_some());
    }

    #[tokio::test]
    async fn play_empty_playlist_is_ignored() {
        let fx = fixture(PlayMode::Single);
        let playlist = seed_playlist(&fx, "p1", &[]);
        fx.radio.play(&admin(), &fx.station, &playlist).await;
        assert!(fx.radio.playback_for(&fx.station).is_none());
        assert!(fx.broadcaster.ops().is_empty());
    }

    #[tokio::test]
    async fn play_unknown_station_or_playlist_is_ignored() {
        let fx = fixture(PlayMode::Single);
        seed_playlist(&fx, "p1", &[30.0]);
        fx.radio
            .play(&admin(), &StationId::from("nope"), &PlaylistId::from("p1"))
            .await;
        fx.radio
            .play(&admin(), &fx.station, &PlaylistId::from("nope"))
            .await;
        assert!(fx.radio.playback_for(&fx.station).is_none());
    }

    #[tokio::test]
    async fn position_is_monotonic_and_clamped() {
        let fx = fixture(PlayMode::Single);
        let playlist = seed_playlist(&fx, "p1", &[30.0]);
        fx.radio.play(&admin(), &fx.station, &playlist).await;

        let pb = fx.radio.playback_for(&fx.station).expect("playing");
        let t0 = pb.updated_at;
        let p1 = pb.current_position(t0 + 5.0);
        let p2 = pb.current_position(t0 + 10.0);
        assert!(p2 >= p1);
        // Clamped to the 30s track, never past it.
        assert_eq!(pb.current_position(t0 + 100.0), 30.0);
        // Clock skew must not send it negative.
        assert!(pb.current_position(t0 - 100.0) >= 0.0);
    }

    #[tokio::test]
    async fn pause_freezes_position() {
        let fx = fixture(PlayMode::Single);
        let playlist = seed_playlist(&fx, "p1", &[30.0]);
        fx.radio.play(&admin(), &fx.station, &playlist).await;
        fx.radio.pause(&admin(), &fx.station, 12.5).await;

        let pb = fx.radio.playback_for(&fx.station).expect("paused");
        assert!(!pb.playing);
        assert_eq!(pb.current_position(pb.updated_at + 60.0), 12.5);

        fx.radio.resume(&admin(), &fx.station).await;
        let pb = fx.radio.playback_for(&fx.station).expect("resumed");
        assert!(pb.playing);
        assert_eq!(pb.position, 12.5);
    }

    #[tokio::test]
    async fn seek_is_last_write_wins() {
        let fx = fixture(PlayMode::Single);
        let playlist = seed_playlist(&fx, "p1", &[300.0]);
        fx.radio.play(&admin(), &fx.station, &playlist).await;

        fx.radio.seek(&admin(), &fx.station, 100.0).await;
        let manager = UserProfile {
            id: UserId::from("mgr"),
            username: "mgr".to_string(),
            is_admin: false,
            is_approved: true,
        };
        fx.radio.seek(&manager, &fx.station, 42.0).await;

        let pb = fx.radio.playback_for(&fx.station).expect("playing");
        assert_eq!(pb.position, 42.0);
    }

    #[tokio::test]
    async fn next_advances_within_playlist() {
        let fx = fixture(PlayMode::Single);
        let playlist = seed_playlist(&fx, "p1", &[30.0, 45.0]);
        fx.radio.play(&admin(), &fx.station, &playlist).await;
        fx.radio.next(&admin(), &fx.station).await;

        let pb = fx.radio.playback_for(&fx.station).expect("playing");
        assert_eq!(pb.track_index, 1);
        assert_eq!(pb.position, 0.0);
        assert!(pb.playing);
    }

    #[tokio::test]
    async fn mode_single_stops_after_last_track() {
        let fx = fixture(PlayMode::Single);
        let playlist = seed_playlist(&fx, "p1", &[30.0]);
        fx.radio.play(&admin(), &fx.station, &playlist).await;
        fx.radio.track_ended(&fx.station).await;

        assert!(fx.radio.playback_for(&fx.station).is_none());
        let stopped = fx.broadcaster.last_of("radio_status").expect("status");
        assert_eq!(stopped["live"], false);
    }

    #[tokio::test]
    async fn mode_loop_one_restarts_playlist() {
        // Two tracks, two track_ended reports: back at index 0, position 0,
        // still playing.
        let fx = fixture(PlayMode::LoopOne);
        let playlist = seed_playlist(&fx, "p1", &[30.0, 45.0]);
        fx.radio.play(&admin(), &fx.station, &playlist).await;
        fx.radio.track_ended(&fx.station).await;
        fx.radio.track_ended(&fx.station).await;

        let pb = fx.radio.playback_for(&fx.station).expect("looped");
        assert_eq!(pb.playlist_id, playlist);
        assert_eq!(pb.track_index, 0);
        assert_eq!(pb.position, 0.0);
        assert!(pb.playing);
    }

    #[tokio::test]
    async fn mode_play_all_advances_and_stops_at_end() {
        let fx = fixture(PlayMode::PlayAll);
        let p1 = seed_playlist(&fx, "p1", &[30.0]);
        seed_playlist(&fx, "empty", &[]);
        let p2 = seed_playlist(&fx, "p2", &[20.0]);

        fx.radio.play(&admin(), &fx.station, &p1).await;
        fx.radio.track_ended(&fx.station).await;

        // Skipped the empty playlist.
        let pb = fx.radio.playback_for(&fx.station).expect("advanced");
        assert_eq!(pb.playlist_id, p2);
        assert_eq!(pb.track_index, 0);

        fx.radio.track_ended(&fx.station).await;
        assert!(fx.radio.playback_for(&fx.station).is_none());
    }

    #[tokio::test]
    async fn mode_loop_all_wraps_around() {
        let fx = fixture(PlayMode::LoopAll);
        let p1 = seed_playlist(&fx, "p1", &[30.0]);
        let p2 = seed_playlist(&fx, "p2", &[20.0]);

        fx.radio.play(&admin(), &fx.station, &p2).await;
        fx.radio.track_ended(&fx.station).await;

        let pb = fx.radio.playback_for(&fx.station).expect("wrapped");
        assert_eq!(pb.playlist_id, p1);
        assert_eq!(pb.track_index, 0);
        assert!(pb.playing);
    }

    #[tokio::test]
    async fn mode_loop_all_single_playlist_loops_itself() {
        let fx = fixture(PlayMode::LoopAll);
        let p1 = seed_playlist(&fx, "p1", &[30.0]);
        fx.radio.play(&admin(), &fx.station, &p1).await;
        fx.radio.track_ended(&fx.station).await;

        let pb = fx.radio.playback_for(&fx.station).expect("looped");
        assert_eq!(pb.playlist_id, p1);
        assert_eq!(pb.track_index, 0);
    }

    #[tokio::test]
    async fn all_empty_sibling_playlists_terminate() {
        let fx = fixture(PlayMode::PlayAll);
        let p1 = seed_playlist(&fx, "p1", &[30.0]);
        seed_playlist(&fx, "e1", &[]);
        seed_playlist(&fx, "e2", &[]);

        fx.radio.play(&admin(), &fx.station, &p1).await;
        fx.radio.track_ended(&fx.station).await;
        assert!(fx.radio.playback_for(&fx.station).is_none());
    }

    #[tokio::test]
    async fn track_ended_on_idle_station_is_noop() {
        let fx = fixture(PlayMode::Single);
        fx.radio.track_ended(&fx.station).await;
        assert!(fx.broadcaster.ops().is_empty());
    }

    #[tokio::test]
    async fn listener_exclusivity() {
        let fx = fixture(PlayMode::Single);
        let other = StationId::from("s2");
        let user = UserId::from("u1");

        fx.radio.tune(&user, &fx.station);
        fx.radio.tune(&user, &other);

        let sets = fx.radio.listeners_snapshot();
        assert!(!sets.contains_key(&fx.station));
        assert_eq!(sets.get(&other).map(Vec::len), Some(1));

        fx.radio.untune(&user);
        assert!(fx.radio.listeners_snapshot().is_empty());
    }

    #[tokio::test]
    async fn playback_events_only_reach_listeners() {
        let fx = fixture(PlayMode::Single);
        let playlist = seed_playlist(&fx, "p1", &[30.0]);
        fx.radio.tune(&UserId::from("u1"), &fx.station);
        fx.radio.play(&admin(), &fx.station, &playlist).await;

        let events = fx.broadcaster.events.lock();
        let (targets, _, _) = events
            .iter()
            .find(|(_, op, _)| *op == "radio_playback")
            .expect("playback event");
        assert_eq!(targets, "u1");
    }

    #[tokio::test]
    async fn playlist_deletion_clears_playback() {
        let fx = fixture(PlayMode::Single);
        let playlist = seed_playlist(&fx, "p1", &[30.0]);
        fx.radio.play(&admin(), &fx.station, &playlist).await;

        fx.radio.playlist_deleted(&playlist);
        assert!(fx.radio.playback_for(&fx.station).is_none());
        let status = fx.broadcaster.last_of("radio_status").expect("status");
        assert_eq!(status["live"], false);
    }
}
