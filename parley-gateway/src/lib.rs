//! WebSocket session layer.
//!
//! Every client holds exactly one WebSocket connection. The [`Hub`] is a
//! single-owner actor holding the connection registry; everything else
//! reaches it through a [`HubHandle`] over a command channel, so the hot
//! broadcast path never takes a lock. Per-connection state (auth, rate
//! limiting, the outbound queue) lives in [`session`].

pub mod dispatch;
pub mod hub;
pub mod protocol;
pub mod ratelimit;
pub mod session;

pub use dispatch::Gateway;
pub use hub::{ClientHandle, Hub, HubHandle};
pub use session::ws_handler;
