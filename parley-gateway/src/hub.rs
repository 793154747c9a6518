//! Connection registry actor.
//!
//! The hub owns the user-to-connection map exclusively; registration,
//! teardown, and fan-out all arrive as [`HubCommand`]s over an unbounded
//! channel and are applied by one consuming loop. Unbounded is deliberate:
//! the SFU and radio coordinator push events from inside hub-driven
//! cleanup, and a bounded command bus would deadlock there. Per-client
//! backpressure is handled at the outbound queues instead.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::models::{generate_id, ChannelId, UserId, UserProfile, VoiceState};
use parley_core::radio::{RadioBroadcaster, RadioCoordinator};
use parley_sfu::{Sfu, SignalSink};

use crate::protocol::{Envelope, ScreenSharePayload};

/// Hub-side view of one connection: identity plus the outbound queue and
/// the cancellation scope shared with the socket tasks.
#[derive(Clone)]
pub struct ClientHandle {
    pub conn_id: String,
    pub user: UserProfile,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl ClientHandle {
    #[must_use]
    pub fn new(user: UserProfile, outbound: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self {
            conn_id: generate_id(),
            user,
            outbound,
            cancel,
        }
    }

    /// Queue a frame for the write pump. A full queue means the consumer
    /// cannot keep up; the connection is sacrificed on the spot rather
    /// than blocking the caller.
    pub fn enqueue(&self, frame: String) {
        if self.outbound.try_send(frame).is_err() {
            warn!(user_id = %self.user.id, conn_id = %self.conn_id, "outbound queue full, disconnecting");
            self.cancel.cancel();
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

pub enum HubCommand {
    Register(ClientHandle),
    Unregister { user_id: UserId, conn_id: String },
    SendTo(UserId, String),
    BroadcastAll(String),
    DisconnectUser(UserId),
    OnlineUsers(oneshot::Sender<Vec<UserProfile>>),
}

pub struct Hub {
    rx: mpsc::UnboundedReceiver<HubCommand>,
    clients: HashMap<UserId, ClientHandle>,
    sfu: Arc<Sfu>,
    radio: Arc<RadioCoordinator>,
}

impl Hub {
    #[must_use]
    pub fn new(sfu: Arc<Sfu>, radio: Arc<RadioCoordinator>) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            rx,
            clients: HashMap::new(),
            sfu,
            radio,
        };
        (hub, HubHandle { tx })
    }

    /// The single consuming loop; runs until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                HubCommand::Register(client) => self.register(client).await,
                HubCommand::Unregister { user_id, conn_id } => {
                    self.unregister(&user_id, &conn_id).await;
                }
                HubCommand::SendTo(user_id, frame) => {
                    if let Some(client) = self.clients.get(&user_id) {
                        client.enqueue(frame);
                    }
                }
                HubCommand::BroadcastAll(frame) => self.broadcast_all(&frame),
                HubCommand::DisconnectUser(user_id) => {
                    if let Some(client) = self.clients.get(&user_id) {
                        info!(user_id = %user_id, "forcing disconnect");
                        client.close();
                    }
                }
                HubCommand::OnlineUsers(reply) => {
                    let users = self.clients.values().map(|c| c.user.clone()).collect();
                    let _ = reply.send(users);
                }
            }
        }
        debug!("hub loop exited");
    }

    /// Single-session policy: a new connection for an already-online user
    /// evicts the old one, and the old session's media state is torn down
    /// here so its (now superseded) unregister can be a pure no-op.
    async fn register(&mut self, client: ClientHandle) {
        let user_id = client.user.id.clone();
        if let Some(existing) = self.clients.remove(&user_id) {
            info!(user_id = %user_id, "evicting previous session");
            existing.close();
            self.cleanup_media(&user_id).await;
        }

        let online = Envelope::event("user_online", &json!({ "user": client.user }));
        self.clients.insert(user_id.clone(), client);
        if let Ok(frame) = online {
            self.broadcast_except(&frame, &user_id);
        }
        debug!(user_id = %user_id, online = self.clients.len(), "client registered");
    }

    /// Identity-guarded: if a newer connection already replaced this one,
    /// the eviction path has done all cleanup and this is a no-op.
    async fn unregister(&mut self, user_id: &UserId, conn_id: &str) {
        let current = self
            .clients
            .get(user_id)
            .is_some_and(|client| client.conn_id == conn_id);
        if !current {
            debug!(user_id = %user_id, conn_id = %conn_id, "unregister for superseded connection");
            return;
        }
        if let Some(client) = self.clients.remove(user_id) {
            client.close();
        }

        self.cleanup_media(user_id).await;

        if let Ok(frame) = Envelope::event("user_offline", &json!({ "user_id": user_id })) {
            self.broadcast_all(&frame);
        }
        debug!(user_id = %user_id, online = self.clients.len(), "client unregistered");
    }

    /// Shared teardown for disconnect and eviction: screen share first so
    /// its stop notification precedes the voice-leave update, then voice,
    /// then the radio listener set.
    async fn cleanup_media(&self, user_id: &UserId) {
        if let Some(screen_room) = self.sfu.user_screen_room(user_id) {
            let channel_id = screen_room.channel_id.clone();
            self.sfu.stop_screen_share(&channel_id).await;
        }
        if let Some(room) = self.sfu.user_room(user_id) {
            room.remove_peer(user_id).await;
        }
        self.radio.untune(user_id);
    }

    fn broadcast_all(&self, frame: &str) {
        for client in self.clients.values() {
            client.enqueue(frame.to_string());
        }
    }

    fn broadcast_except(&self, frame: &str, exclude: &UserId) {
        for (user_id, client) in &self.clients {
            if user_id != exclude {
                client.enqueue(frame.to_string());
            }
        }
    }
}

/// Cloneable entry point to the hub; also the seam the SFU and radio
/// coordinator push events through.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn register(&self, client: ClientHandle) {
        let _ = self.tx.send(HubCommand::Register(client));
    }

    pub fn unregister(&self, user_id: UserId, conn_id: String) {
        let _ = self.tx.send(HubCommand::Unregister { user_id, conn_id });
    }

    pub fn send_to(&self, user_id: &UserId, frame: String) {
        let _ = self.tx.send(HubCommand::SendTo(user_id.clone(), frame));
    }

    pub fn broadcast_frame(&self, frame: String) {
        let _ = self.tx.send(HubCommand::BroadcastAll(frame));
    }

    /// Administrative kick: cancels the user's session; teardown then
    /// flows through the normal unregister path.
    pub fn disconnect_user(&self, user_id: &UserId) {
        let _ = self.tx.send(HubCommand::DisconnectUser(user_id.clone()));
    }

    /// Snapshot of everyone currently registered; empty if the hub loop
    /// has shut down.
    pub async fn online_users(&self) -> Vec<UserProfile> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::OnlineUsers(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub(crate) fn send_event_to(&self, user_id: &UserId, op: &str, data: &serde_json::Value) {
        match Envelope::event(op, data) {
            Ok(frame) => self.send_to(user_id, frame),
            Err(e) => warn!(op = %op, error = %e, "serialize event"),
        }
    }

    pub(crate) fn broadcast_event<T: serde::Serialize>(&self, op: &str, data: &T) {
        match Envelope::event(op, data) {
            Ok(frame) => self.broadcast_frame(frame),
            Err(e) => warn!(op = %op, error = %e, "serialize event"),
        }
    }
}

impl SignalSink for HubHandle {
    fn signal(&self, user_id: &UserId, op: &'static str, data: serde_json::Value) {
        self.send_event_to(user_id, op, &data);
    }

    fn peer_removed(&self, user_id: &UserId) {
        self.broadcast_event(
            "voice_state_update",
            &VoiceState {
                user_id: user_id.clone(),
                channel_id: String::new(),
                self_mute: false,
                self_deafen: false,
                server_mute: false,
                speaking: false,
            },
        );
    }

    fn screen_share_stopped(&self, presenter_id: &UserId, channel_id: &ChannelId) {
        self.broadcast_event(
            "screen_share_stopped",
            &ScreenSharePayload {
                user_id: presenter_id.as_str().to_owned(),
                channel_id: channel_id.as_str().to_owned(),
            },
        );
    }
}

impl RadioBroadcaster for HubHandle {
    fn send_to_users(&self, user_ids: &[UserId], op: &'static str, data: serde_json::Value) {
        for user_id in user_ids {
            self.send_event_to(user_id, op, &data);
        }
    }

    fn broadcast_all(&self, op: &'static str, data: serde_json::Value) {
        self.broadcast_event(op, &data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::config::WebRtcConfig;
    use parley_core::store::MemoryRadioStore;
    use std::time::Duration;
    use tokio::time::timeout;

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            id: UserId::from(id),
            username: id.to_string(),
            is_admin: false,
            is_approved: true,
        }
    }

    struct Harness {
        handle: HubHandle,
        sfu: Arc<Sfu>,
    }

    fn start_hub() -> Harness {
        let sfu = Sfu::new(&WebRtcConfig {
            ice_servers: Vec::new(),
            public_ip: None,
        })
        .expect("sfu");
        let radio = Arc::new(RadioCoordinator::new(Arc::new(MemoryRadioStore::new())));
        let (hub, handle) = Hub::new(Arc::clone(&sfu), radio);
        sfu.set_signal_sink(Arc::new(handle.clone()));
        tokio::spawn(hub.run());
        Harness { handle, sfu }
    }

    fn client(id: &str, buffer: usize) -> (ClientHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        let handle = ClientHandle::new(profile(id), tx, CancellationToken::new());
        (handle, rx)
    }

    async fn recv_op(rx: &mut mpsc::Receiver<String>) -> String {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open");
        Envelope::parse(&frame).expect("envelope").op
    }

    #[tokio::test]
    async fn register_evicts_previous_session() {
        let h = start_hub();
        let (first, _rx1) = client("u1", 8);
        let first_cancel = first.cancel.clone();
        let (second, _rx2) = client("u1", 8);

        h.handle.register(first);
        h.handle.register(second);

        let online = h.handle.online_users().await;
        assert_eq!(online.len(), 1);
        assert!(first_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn superseded_unregister_is_noop() {
        let h = start_hub();
        let (first, _rx1) = client("u1", 8);
        let first_conn = first.conn_id.clone();
        let (second, _rx2) = client("u1", 8);

        h.handle.register(first);
        h.handle.register(second);
        h.handle.unregister(UserId::from("u1"), first_conn);

        let online = h.handle.online_users().await;
        assert_eq!(online.len(), 1);
    }

    #[tokio::test]
    async fn eviction_removes_voice_peer() {
        let h = start_hub();
        let user = UserId::from("u1");
        let (first, _rx1) = client("u1", 8);
        h.handle.register(first);

        let room = h.sfu.get_or_create_room(&ChannelId::from("voice-1"));
        room.add_peer(&user).await.expect("join");
        assert!(h.sfu.user_room(&user).is_some());

        let (second, _rx2) = client("u1", 8);
        h.handle.register(second);
        h.handle.online_users().await; // fence: eviction processed

        assert!(h.sfu.user_room(&user).is_none());
    }

    #[tokio::test]
    async fn presence_events_fan_out() {
        let h = start_hub();
        let (a, mut rx_a) = client("a", 8);
        let a_conn = a.conn_id.clone();
        let (b, mut rx_b) = client("b", 8);

        h.handle.register(a);
        h.handle.register(b);
        // a hears that b came online; b hears nothing about itself.
        assert_eq!(recv_op(&mut rx_a).await, "user_online");

        h.handle.unregister(UserId::from("a"), a_conn);
        assert_eq!(recv_op(&mut rx_b).await, "user_offline");
    }

    #[tokio::test]
    async fn full_outbound_queue_disconnects_only_slow_client() {
        let h = start_hub();
        let (slow, _rx_slow) = client("slow", 1);
        let slow_cancel = slow.cancel.clone();
        let (fast, mut rx_fast) = client("fast", 8);
        let fast_cancel = fast.cancel.clone();

        h.handle.register(slow);
        h.handle.register(fast);
        // "slow" already has the user_online frame for "fast" queued and
        // never drains; the next broadcast overflows it.
        h.handle.broadcast_frame(r#"{"op":"pong","d":null}"#.to_string());
        h.handle.online_users().await; // fence

        assert!(slow_cancel.is_cancelled());
        assert!(!fast_cancel.is_cancelled());
        assert_eq!(recv_op(&mut rx_fast).await, "pong");
    }

    #[tokio::test]
    async fn disconnect_user_cancels_session() {
        let h = start_hub();
        let (client, _rx) = client("u1", 8);
        let cancel = client.cancel.clone();
        h.handle.register(client);

        h.handle.disconnect_user(&UserId::from("u1"));
        h.handle.online_users().await; // fence
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn send_to_targets_one_user() {
        let h = start_hub();
        let (a, mut rx_a) = client("a", 8);
        let (b, mut rx_b) = client("b", 8);
        h.handle.register(a);
        h.handle.register(b);
        assert_eq!(recv_op(&mut rx_a).await, "user_online");

        h.handle
            .send_to(&UserId::from("b"), r#"{"op":"pong","d":null}"#.to_string());
        assert_eq!(recv_op(&mut rx_b).await, "pong");
        assert!(rx_a.try_recv().is_err());
    }
}
