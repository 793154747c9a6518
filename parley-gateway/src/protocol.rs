//! Wire protocol: the `{"op", "d"}` JSON envelope and its payloads.
//!
//! Inbound payloads deserialize leniently (unknown fields ignored, frames
//! that fail to parse are dropped by the caller). Outbound events are
//! serialized once and the resulting string is cloned per recipient.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use parley_core::models::{
    ChannelInfo, PlaylistId, StationId, StationInfo, TrackInfo, UserProfile, VoiceState,
};
use parley_core::Result;
use parley_sfu::ScreenRole;

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub op: String,
    #[serde(rename = "d", default)]
    pub data: Value,
}

impl Envelope {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Serialize a server event to a wire frame.
    pub fn event<T: Serialize>(op: &str, data: &T) -> Result<String> {
        let frame = serde_json::to_string(&Envelope {
            op: op.to_string(),
            data: serde_json::to_value(data)?,
        })?;
        Ok(frame)
    }
}

// ---- client -> server ----

#[derive(Debug, Deserialize)]
pub struct AuthenticatePayload {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinVoicePayload {
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AnswerPayload {
    pub sdp: String,
}

#[derive(Debug, Deserialize)]
pub struct IcePayload {
    pub candidate: RTCIceCandidateInit,
}

#[derive(Debug, Deserialize)]
pub struct MutePayload {
    pub muted: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeafenPayload {
    pub deafened: bool,
}

#[derive(Debug, Deserialize)]
pub struct SpeakingPayload {
    pub speaking: bool,
}

#[derive(Debug, Deserialize)]
pub struct ServerMutePayload {
    pub user_id: String,
    pub muted: bool,
}

#[derive(Debug, Deserialize)]
pub struct ScreenChannelPayload {
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ScreenAnswerPayload {
    pub sdp: String,
    #[serde(default)]
    pub role: Option<ScreenRole>,
}

#[derive(Debug, Deserialize)]
pub struct ScreenIcePayload {
    pub candidate: RTCIceCandidateInit,
    #[serde(default)]
    pub role: Option<ScreenRole>,
}

#[derive(Debug, Deserialize)]
pub struct RadioPlayPayload {
    pub station_id: StationId,
    pub playlist_id: PlaylistId,
}

#[derive(Debug, Deserialize)]
pub struct RadioPositionPayload {
    pub station_id: StationId,
    #[serde(default)]
    pub position: f64,
}

#[derive(Debug, Deserialize)]
pub struct RadioStationRef {
    pub station_id: StationId,
}

// ---- server -> client ----

#[derive(Debug, Serialize)]
pub struct UserEventPayload {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct ScreenSharePayload {
    pub user_id: String,
    pub channel_id: String,
}

#[derive(Debug, Serialize)]
pub struct ScreenShareErrorPayload {
    pub error: String,
}

/// One station's playlists with tracks, for the ready snapshot.
#[derive(Debug, Serialize)]
pub struct PlaylistSnapshot {
    pub id: PlaylistId,
    pub station_id: StationId,
    pub tracks: Vec<TrackInfo>,
}

/// Full state snapshot sent once after a successful authenticate.
#[derive(Debug, Serialize)]
pub struct ReadyPayload {
    pub user: UserProfile,
    pub channels: Vec<ChannelInfo>,
    pub online_users: Vec<UserProfile>,
    pub voice_states: Vec<VoiceState>,
    pub screen_shares: Vec<ScreenSharePayload>,
    pub radio_stations: Vec<StationInfo>,
    pub radio_playlists: Vec<PlaylistSnapshot>,
    pub radio_playback: Vec<Value>,
    pub radio_listeners: Value,
    /// Unix seconds; lets the client correct radio position for clock skew.
    pub server_time: f64,
}
