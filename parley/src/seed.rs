//! JSON seed file for the in-memory stores.
//!
//! The standalone server has no database; users, channels, and the radio
//! catalog come from a seed file loaded at startup.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use parley_core::models::{
    generate_id, ChannelId, ChannelInfo, ChannelKind, PlayMode, PlaylistId, StationId,
    StationInfo, TrackId, TrackInfo, UserId, UserProfile,
};
use parley_core::store::{MemoryChannelStore, MemoryRadioStore, MemoryUserStore};

#[derive(Debug, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub channels: Vec<SeedChannel>,
    #[serde(default)]
    pub stations: Vec<SeedStation>,
}

#[derive(Debug, Deserialize)]
pub struct SeedUser {
    pub token: String,
    pub id: Option<String>,
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default = "default_true")]
    pub is_approved: bool,
}

#[derive(Debug, Deserialize)]
pub struct SeedChannel {
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub position: i32,
}

#[derive(Debug, Deserialize)]
pub struct SeedStation {
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_mode")]
    pub playback_mode: PlayMode,
    #[serde(default)]
    pub manager_ids: Vec<String>,
    #[serde(default)]
    pub playlists: Vec<SeedPlaylist>,
}

#[derive(Debug, Deserialize)]
pub struct SeedPlaylist {
    pub id: Option<String>,
    #[serde(default)]
    pub tracks: Vec<SeedTrack>,
}

#[derive(Debug, Deserialize)]
pub struct SeedTrack {
    pub id: Option<String>,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub duration: f64,
}

const fn default_true() -> bool {
    true
}

const fn default_mode() -> PlayMode {
    PlayMode::PlayAll
}

pub fn load(path: &str) -> Result<SeedData> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read seed file {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parse seed file {path}"))
}

pub fn apply(
    data: SeedData,
    users: &Arc<MemoryUserStore>,
    channels: &Arc<MemoryChannelStore>,
    radio: &Arc<MemoryRadioStore>,
) {
    let (user_count, channel_count, station_count) =
        (data.users.len(), data.channels.len(), data.stations.len());

    for user in data.users {
        let id = user.id.unwrap_or_else(generate_id);
        users.insert(
            user.token,
            UserProfile {
                id: UserId::from(id),
                username: user.username,
                is_admin: user.is_admin,
                is_approved: user.is_approved,
            },
        );
    }

    for channel in data.channels {
        channels.insert(ChannelInfo {
            id: ChannelId::from(channel.id.unwrap_or_else(generate_id)),
            name: channel.name,
            kind: channel.kind,
            position: channel.position,
        });
    }

    for station in data.stations {
        let station_id = StationId::from(station.id.unwrap_or_else(generate_id));
        radio.insert_station(StationInfo {
            id: station_id.clone(),
            name: station.name,
            playback_mode: station.playback_mode,
            manager_ids: station.manager_ids.into_iter().map(UserId::from).collect(),
        });
        for playlist in station.playlists {
            let playlist_id = PlaylistId::from(playlist.id.unwrap_or_else(generate_id));
            radio.insert_playlist(&station_id, playlist_id.clone());
            for (index, track) in playlist.tracks.into_iter().enumerate() {
                radio.insert_track(
                    &playlist_id,
                    TrackInfo {
                        id: TrackId::from(track.id.unwrap_or_else(generate_id)),
                        playlist_id: playlist_id.clone(),
                        title: track.title,
                        url: track.url,
                        duration: track.duration,
                        position: index as i32,
                    },
                );
            }
        }
    }

    info!(
        users = user_count,
        channels = channel_count,
        stations = station_count,
        "seed data loaded"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::store::{ChannelStore, RadioStore, UserStore};

    const SAMPLE: &str = r#"{
        "users": [
            {"token": "tok-admin", "id": "admin", "username": "admin", "is_admin": true}
        ],
        "channels": [
            {"id": "general", "name": "general", "type": "text"},
            {"id": "lounge", "name": "lounge", "type": "voice", "position": 1}
        ],
        "stations": [
            {
                "id": "s1", "name": "chill", "playback_mode": "loop_all",
                "manager_ids": ["admin"],
                "playlists": [
                    {"id": "p1", "tracks": [
                        {"title": "one", "url": "/radio/one.opus", "duration": 30}
                    ]}
                ]
            }
        ]
    }"#;

    #[tokio::test]
    async fn sample_seed_round_trips() {
        let data: SeedData = serde_json::from_str(SAMPLE).expect("parse");
        let users = Arc::new(MemoryUserStore::new());
        let channels = Arc::new(MemoryChannelStore::new());
        let radio = Arc::new(MemoryRadioStore::new());
        apply(data, &users, &channels, &radio);

        let admin = users
            .resolve_token("tok-admin")
            .await
            .expect("lookup")
            .expect("seeded");
        assert!(admin.is_admin);
        assert!(admin.is_approved);

        assert_eq!(channels.channels().await.expect("channels").len(), 2);

        let stations = radio.stations().await.expect("stations");
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].playback_mode, PlayMode::LoopAll);

        let tracks = radio
            .tracks_for_playlist(&PlaylistId::from("p1"))
            .await
            .expect("tracks");
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].position, 0);
    }
}
