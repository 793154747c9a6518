//! Per-connection socket handling.
//!
//! The read pump enforces the authenticate-first handshake and the
//! inbound rate limit; the write pump drains the outbound queue and
//! emits keepalive pings. Both pumps share one cancellation scope, and
//! teardown converges on the hub's unregister path regardless of which
//! side exits first.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::models::UserProfile;

use crate::dispatch::Gateway;
use crate::hub::ClientHandle;
use crate::protocol::{AuthenticatePayload, Envelope};
use crate::ratelimit::RateLimiter;

pub async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(gateway, socket))
}

async fn handle_socket(gateway: Arc<Gateway>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let Some(user) = authenticate(&gateway, &mut sink, &mut stream).await else {
        return;
    };

    // The ready snapshot goes out before registration, so it reflects the
    // world just before this user becomes visible to everyone else.
    let ready = gateway.ready_payload(&user).await;
    let frame = match Envelope::event("ready", &ready) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(user_id = %user.id, error = %e, "serialize ready");
            return;
        }
    };
    if sink.send(Message::Text(frame.into())).await.is_err() {
        return;
    }

    let (out_tx, out_rx) = mpsc::channel(gateway.session.send_buffer);
    let cancel = CancellationToken::new();
    let client = ClientHandle::new(user, out_tx, cancel.clone());
    let user_id = client.user.id.clone();
    let conn_id = client.conn_id.clone();

    gateway.hub.register(client.clone());
    info!(user_id = %user_id, conn_id = %conn_id, "session established");

    let ping_every = Duration::from_secs(gateway.session.ping_interval_seconds);
    let writer = tokio::spawn(write_pump(sink, out_rx, cancel.clone(), ping_every));

    read_pump(&gateway, &client, &mut stream).await;

    // Exactly-once teardown: the hub ignores this if a newer connection
    // already replaced us.
    gateway.hub.unregister(user_id.clone(), conn_id);
    cancel.cancel();
    let _ = writer.await;
    info!(user_id = %user_id, "session closed");
}

/// First frame must be a valid `authenticate` within the timeout; any
/// failure closes the socket with a policy-violation status and the
/// connection never reaches the hub.
async fn authenticate(
    gateway: &Gateway,
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
) -> Option<UserProfile> {
    let deadline = Duration::from_secs(gateway.session.auth_timeout_seconds);
    let raw = match timeout(deadline, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            policy_close(sink, "expected authenticate").await;
            return None;
        }
        Err(_) => {
            policy_close(sink, "auth timeout").await;
            return None;
        }
    };

    let Some(envelope) = Envelope::parse(&raw) else {
        policy_close(sink, "invalid message").await;
        return None;
    };
    if envelope.op != "authenticate" {
        policy_close(sink, "expected authenticate").await;
        return None;
    }
    let Ok(auth) = serde_json::from_value::<AuthenticatePayload>(envelope.data) else {
        policy_close(sink, "invalid auth data").await;
        return None;
    };

    let user = match gateway.users.resolve_token(&auth.token).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            policy_close(sink, "invalid token").await;
            return None;
        }
        Err(e) => {
            warn!(error = %e, "token lookup failed");
            policy_close(sink, "invalid token").await;
            return None;
        }
    };
    if !user.is_approved {
        policy_close(sink, "account pending approval").await;
        return None;
    }
    Some(user)
}

async fn policy_close(sink: &mut SplitSink<WebSocket, Message>, reason: &'static str) {
    debug!(reason, "closing unauthenticated socket");
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}

async fn read_pump(
    gateway: &Gateway,
    client: &ClientHandle,
    stream: &mut SplitStream<WebSocket>,
) {
    let mut limiter = RateLimiter::per_second(gateway.session.rate_limit_per_second);
    loop {
        let next = tokio::select! {
            () = client.cancel_token().cancelled() => break,
            next = stream.next() => next,
        };
        let Some(Ok(msg)) = next else { break };
        match msg {
            Message::Text(text) => {
                if !limiter.allow() {
                    warn!(user_id = %client.user.id, "rate limit exceeded, disconnecting");
                    break;
                }
                // Malformed frames are dropped, the loop continues.
                let Some(envelope) = Envelope::parse(&text) else {
                    continue;
                };
                gateway.dispatch(client, envelope).await;
            }
            Message::Close(_) => break,
            // Pings are answered by the transport layer.
            _ => {}
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    ping_every: Duration,
) {
    let mut ticker = interval(ping_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
