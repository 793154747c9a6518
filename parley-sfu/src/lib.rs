//! Parley SFU (Selective Forwarding Unit)
//!
//! Server-side WebRTC media routing for voice channels and screen share.
//! Each participant uploads media once; the SFU forwards it to every other
//! participant, so clients never mesh with each other.
//!
//! ## Architecture
//!
//! - **`Sfu`**: top-level registry of voice rooms and screen-share rooms,
//!   plus the two media engines (Opus-only for voice, VP8+Opus for screen).
//! - **`Room` / `VoicePeer`**: one voice channel's live session; owns the
//!   peer connections and the audio-track fan-out.
//! - **`ScreenRoom` / `ScreenViewer`**: one presenter leg plus independent
//!   viewer legs per channel.
//! - **`SignalSink`**: the seam back to the session layer; offers, ICE
//!   candidates, and lifecycle events are pushed through it rather than
//!   through a direct dependency.
//!
//! Signaling is server-initiated: the SFU creates offers, clients answer.
//! When the track set changes while an offer/answer exchange is already in
//! flight, the renegotiation is deferred and replayed after the answer
//! lands (see [`peer::Renegotiation`]).

mod engine;
mod manager;
mod peer;
mod room;
mod screen;

pub use manager::{ScreenRole, SignalSink, Sfu};
pub use peer::{Renegotiation, VoicePeer};
pub use room::Room;
pub use screen::ScreenRoom;
