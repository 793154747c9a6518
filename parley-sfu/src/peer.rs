use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use parley_core::models::{ChannelId, UserId, VoiceState};

/// Per-peer renegotiation state.
///
/// The SFU must never have two offers in flight for one peer connection;
/// a second `create_offer` while the first awaits its answer corrupts the
/// signaling state. The transition table:
///
/// | State      | request()           | answer applied        |
/// |------------|---------------------|-----------------------|
/// | `Stable`   | -> `InFlight`, send | -> `Stable`           |
/// | `InFlight` | -> `Pending`, defer | -> `Stable`, replay?  |
/// | `Pending`  | stays `Pending`     | -> `Stable`, replay   |
///
/// "replay" means the caller immediately requests again, which sends the
/// deferred offer from the now-stable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renegotiation {
    Stable,
    Pending,
    InFlight,
}

#[derive(Debug)]
pub(crate) struct RenegotiationGate {
    state: Renegotiation,
}

impl RenegotiationGate {
    pub(crate) const fn new() -> Self {
        Self {
            state: Renegotiation::Stable,
        }
    }

    /// A renegotiation (or the initial offer) is wanted. Returns whether
    /// the caller may send an offer now; `false` means it was deferred.
    /// `transport_stable` is the peer connection's signaling state — even a
    /// `Stable` gate defers when the transport is mid-exchange (e.g. an
    /// answer is being applied concurrently).
    pub(crate) fn request(&mut self, transport_stable: bool) -> bool {
        match self.state {
            Renegotiation::Stable if transport_stable => {
                self.state = Renegotiation::InFlight;
                true
            }
            _ => {
                self.state = Renegotiation::Pending;
                false
            }
        }
    }

    /// The client's answer was applied. Returns whether a deferred
    /// renegotiation must be replayed.
    pub(crate) fn complete(&mut self) -> bool {
        let replay = self.state == Renegotiation::Pending;
        self.state = Renegotiation::Stable;
        replay
    }

    /// Offer creation failed; release the in-flight claim.
    pub(crate) fn abort(&mut self) {
        if self.state == Renegotiation::InFlight {
            self.state = Renegotiation::Stable;
        }
    }

    #[cfg(test)]
    pub(crate) const fn state(&self) -> Renegotiation {
        self.state
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerFlags {
    self_mute: bool,
    self_deafen: bool,
    server_mute: bool,
    speaking: bool,
}

/// One user's presence in a voice [`Room`](crate::Room).
pub struct VoicePeer {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pc: Arc<RTCPeerConnection>,
    flags: RwLock<PeerFlags>,
    local_track: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    gate: Mutex<RenegotiationGate>,
}

impl VoicePeer {
    pub(crate) fn new(user_id: UserId, channel_id: ChannelId, pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            user_id,
            channel_id,
            pc,
            flags: RwLock::new(PeerFlags::default()),
            local_track: RwLock::new(None),
            gate: Mutex::new(RenegotiationGate::new()),
        }
    }

    pub(crate) fn pc(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    pub(crate) fn set_local_track(&self, track: Arc<TrackLocalStaticRTP>) {
        *self.local_track.write() = Some(track);
    }

    pub(crate) fn local_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.local_track.read().clone()
    }

    pub(crate) fn gate_request(&self, transport_stable: bool) -> bool {
        self.gate.lock().request(transport_stable)
    }

    pub(crate) fn gate_complete(&self) -> bool {
        self.gate.lock().complete()
    }

    pub(crate) fn gate_abort(&self) {
        self.gate.lock().abort()
    }

    /// Full snapshot for `voice_state_update` broadcasts.
    #[must_use]
    pub fn voice_state(&self) -> VoiceState {
        let flags = *self.flags.read();
        VoiceState {
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.as_str().to_owned(),
            self_mute: flags.self_mute,
            self_deafen: flags.self_deafen,
            server_mute: flags.server_mute,
            speaking: flags.speaking,
        }
    }

    pub fn set_self_mute(&self, muted: bool) -> VoiceState {
        self.flags.write().self_mute = muted;
        self.voice_state()
    }

    pub fn set_self_deafen(&self, deafened: bool) -> VoiceState {
        self.flags.write().self_deafen = deafened;
        self.voice_state()
    }

    /// Privileged; authorization is the caller's job. Takes effect in the
    /// RTP forward loop, no renegotiation needed.
    pub fn set_server_mute(&self, muted: bool) -> VoiceState {
        self.flags.write().server_mute = muted;
        self.voice_state()
    }

    pub fn set_speaking(&self, speaking: bool) -> VoiceState {
        self.flags.write().speaking = speaking;
        self.voice_state()
    }

    pub(crate) fn server_muted(&self) -> bool {
        self.flags.read().server_mute
    }

    #[cfg(test)]
    pub(crate) fn gate_state(&self) -> Renegotiation {
        self.gate.lock().state()
    }
}
