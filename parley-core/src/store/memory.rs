use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::models::{
    ChannelInfo, ChannelId, PlaylistId, StationId, StationInfo, TrackInfo, UserId, UserProfile,
};
use crate::store::{ChannelStore, RadioStore, UserStore};
use crate::Result;

/// Token-keyed user table.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, UserProfile>>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, profile: UserProfile) {
        self.users.write().insert(token.into(), profile);
    }

    pub fn revoke(&self, token: &str) {
        self.users.write().remove(token);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn resolve_token(&self, token: &str) -> Result<Option<UserProfile>> {
        Ok(self.users.read().get(token).cloned())
    }
}

#[derive(Default)]
pub struct MemoryChannelStore {
    channels: RwLock<Vec<ChannelInfo>>,
}

impl MemoryChannelStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, channel: ChannelInfo) {
        let mut channels = self.channels.write();
        channels.retain(|c| c.id != channel.id);
        channels.push(channel);
        channels.sort_by_key(|c| c.position);
    }

    pub fn remove(&self, id: &ChannelId) {
        self.channels.write().retain(|c| c.id != *id);
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn channel(&self, id: &ChannelId) -> Result<Option<ChannelInfo>> {
        Ok(self.channels.read().iter().find(|c| c.id == *id).cloned())
    }

    async fn channels(&self) -> Result<Vec<ChannelInfo>> {
        Ok(self.channels.read().clone())
    }
}

#[derive(Default)]
struct RadioTables {
    stations: Vec<StationInfo>,
    // station → playlists in creation order
    playlists: HashMap<StationId, Vec<PlaylistId>>,
    tracks: HashMap<PlaylistId, Vec<TrackInfo>>,
}

#[derive(Default)]
pub struct MemoryRadioStore {
    tables: RwLock<RadioTables>,
}

impl MemoryRadioStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_station(&self, station: StationInfo) {
        let mut tables = self.tables.write();
        tables.stations.retain(|s| s.id != station.id);
        tables.stations.push(station);
    }

    pub fn insert_playlist(&self, station_id: &StationId, playlist_id: PlaylistId) {
        let mut tables = self.tables.write();
        let playlists = tables.playlists.entry(station_id.clone()).or_default();
        if !playlists.contains(&playlist_id) {
            playlists.push(playlist_id.clone());
        }
        tables.tracks.entry(playlist_id).or_default();
    }

    pub fn insert_track(&self, playlist_id: &PlaylistId, track: TrackInfo) {
        let mut tables = self.tables.write();
        let tracks = tables.tracks.entry(playlist_id.clone()).or_default();
        tracks.push(track);
        tracks.sort_by_key(|t| t.position);
    }

    pub fn remove_playlist(&self, playlist_id: &PlaylistId) {
        let mut tables = self.tables.write();
        tables.tracks.remove(playlist_id);
        for playlists in tables.playlists.values_mut() {
            playlists.retain(|p| p != playlist_id);
        }
    }
}

#[async_trait]
impl RadioStore for MemoryRadioStore {
    async fn station(&self, id: &StationId) -> Result<Option<StationInfo>> {
        Ok(self
            .tables
            .read()
            .stations
            .iter()
            .find(|s| s.id == *id)
            .cloned())
    }

    async fn stations(&self) -> Result<Vec<StationInfo>> {
        Ok(self.tables.read().stations.clone())
    }

    async fn playlist_exists(&self, id: &PlaylistId) -> Result<bool> {
        Ok(self.tables.read().tracks.contains_key(id))
    }

    async fn playlists_for_station(&self, station_id: &StationId) -> Result<Vec<PlaylistId>> {
        Ok(self
            .tables
            .read()
            .playlists
            .get(station_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn tracks_for_playlist(&self, playlist_id: &PlaylistId) -> Result<Vec<TrackInfo>> {
        Ok(self
            .tables
            .read()
            .tracks
            .get(playlist_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_station_manager(&self, station_id: &StationId, user_id: &UserId) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .stations
            .iter()
            .find(|s| s.id == *station_id)
            .is_some_and(|s| s.manager_ids.contains(user_id)))
    }
}
