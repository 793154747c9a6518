//! External collaborator lookups.
//!
//! The session layer treats user, channel, and radio catalogs as
//! read-mostly collaborators behind traits; the in-memory
//! implementations back the standalone server and the tests.

mod memory;

pub use memory::{MemoryChannelStore, MemoryRadioStore, MemoryUserStore};

use async_trait::async_trait;

use crate::models::{
    ChannelInfo, ChannelId, PlaylistId, StationId, StationInfo, TrackInfo, UserId, UserProfile,
};
use crate::Result;

/// Resolves session tokens to user identities.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// `None` means unknown or expired token.
    async fn resolve_token(&self, token: &str) -> Result<Option<UserProfile>>;
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn channel(&self, id: &ChannelId) -> Result<Option<ChannelInfo>>;

    /// All channels in display order, for the ready snapshot.
    async fn channels(&self) -> Result<Vec<ChannelInfo>>;
}

#[async_trait]
pub trait RadioStore: Send + Sync {
    async fn station(&self, id: &StationId) -> Result<Option<StationInfo>>;

    async fn stations(&self) -> Result<Vec<StationInfo>>;

    async fn playlist_exists(&self, id: &PlaylistId) -> Result<bool>;

    /// Playlists of a station in creation order.
    async fn playlists_for_station(&self, station_id: &StationId) -> Result<Vec<PlaylistId>>;

    /// Tracks of a playlist ordered by position.
    async fn tracks_for_playlist(&self, playlist_id: &PlaylistId) -> Result<Vec<TrackInfo>>;

    async fn is_station_manager(&self, station_id: &StationId, user_id: &UserId) -> Result<bool>;
}
