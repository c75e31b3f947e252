use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use teamwire_core::events::EventStream;
use teamwire_core::{observability, Caller, CoreError};
use teamwire_models::gateway::*;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use crate::dispatch::{dispatch, Reply};
use crate::limits::{classify, OpClass};
use crate::session::Session;
use crate::GatewayState;

/// Close code for a user over the per-user connection cap.
const CLOSE_POLICY: u16 = 1008;
/// Close code used when the gateway cannot take or keep a connection.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
const CLOSE_INTERNAL: u16 = 1011;

fn wire_log_ws_in(caller: Option<Caller>, op: &str, payload: &str, frame_type: &str) {
    if !observability::wire_trace_enabled() {
        return;
    }
    let payload_preview = observability::wire_trace_payload_preview(payload);
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "in",
        frame_type,
        user_id = ?caller.map(|c| c.user_id),
        connection_id = ?caller.map(|c| c.connection_id),
        op,
        bytes = payload.len(),
        payload_preview = ?payload_preview,
        "server_in"
    );
}

fn wire_log_ws_out(caller: Option<Caller>, frame: &ServerFrame, payload: &str, frame_type: &str) {
    if !observability::wire_trace_enabled() {
        return;
    }
    let payload_preview = observability::wire_trace_payload_preview(payload);
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "out",
        frame_type,
        user_id = ?caller.map(|c| c.user_id),
        connection_id = ?caller.map(|c| c.connection_id),
        event_type = %frame.t,
        sequence = ?frame.s,
        bytes = payload.len(),
        payload_preview = ?payload_preview,
        "server_out"
    );
}

fn wire_log_ws_close(caller: Option<Caller>, code: u16, reason: &str, frame_type: &str) {
    if !observability::wire_trace_enabled() {
        return;
    }
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "out",
        frame_type,
        user_id = ?caller.map(|c| c.user_id),
        connection_id = ?caller.map(|c| c.connection_id),
        code,
        reason,
        "server_out"
    );
}

async fn send_frame_logged(
    sender: &mut (impl SinkExt<Message> + Unpin),
    frame: &ServerFrame,
    caller: Option<Caller>,
    frame_type: &str,
) -> Result<(), ()> {
    let payload = match serde_json::to_string(frame) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(event = %frame.t, "failed to encode gateway frame: {e}");
            return Ok(());
        }
    };
    wire_log_ws_out(caller, frame, &payload, frame_type);
    sender
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| ())
}

async fn send_close_logged(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
    caller: Option<Caller>,
    frame_type: &str,
) -> Result<(), ()> {
    wire_log_ws_close(caller, code, reason, frame_type);
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

fn error_frame(request_id: Option<String>, code: &str, message: String, extra: Option<(&str, Value)>) -> ServerFrame {
    let mut body = json!({ "code": code, "message": message });
    if let (Some((key, value)), Some(map)) = (extra, body.as_object_mut()) {
        map.insert(key.to_string(), value);
    }
    ServerFrame::reply(EVENT_ERROR, request_id, body)
}

/// Holds one slot of the gateway-wide connection cap.
struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        observability::ws_connection_close();
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn try_acquire_connection_slot(state: &GatewayState) -> Option<ConnectionGuard> {
    let mut current = state.active.load(Ordering::SeqCst);
    loop {
        if current >= state.config.max_connections {
            return None;
        }
        match state
            .active
            .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                observability::ws_connection_open();
                return Some(ConnectionGuard {
                    active: state.active.clone(),
                });
            }
            Err(observed) => current = observed,
        }
    }
}

pub async fn handle_connection(socket: WebSocket, state: GatewayState) {
    let (mut sender, mut receiver) = socket.split();
    let Some(_slot) = try_acquire_connection_slot(&state) else {
        let _ = send_close_logged(
            &mut sender,
            CLOSE_TRY_AGAIN_LATER,
            "gateway is at connection capacity",
            None,
            "capacity_close",
        )
        .await;
        return;
    };

    let hello = ServerFrame::event(
        EVENT_HELLO,
        None,
        json!(Hello {
            heartbeat_interval_ms: state.config.heartbeat_interval.as_millis() as u64,
        }),
    );
    if send_frame_logged(&mut sender, &hello, None, "hello")
        .await
        .is_err()
    {
        return;
    }

    let identified = tokio::time::timeout(
        state.config.identify_timeout,
        wait_for_identify(&mut receiver, &state),
    )
    .await;
    let (caller, events) = match identified {
        Ok(Ok(identified)) => identified,
        Ok(Err(err)) => {
            let code = match err {
                CoreError::Unauthenticated | CoreError::BadRequest(_) => CLOSE_UNAUTHENTICATED,
                CoreError::Conflict(_) => CLOSE_POLICY,
                CoreError::State(_) => CLOSE_GOING_AWAY,
                _ => CLOSE_INTERNAL,
            };
            tracing::debug!(error = %err, code, "identify refused");
            let _ = send_close_logged(&mut sender, code, err.code(), None, "identify_close").await;
            return;
        }
        Err(_) => {
            let _ = send_close_logged(
                &mut sender,
                CLOSE_UNAUTHENTICATED,
                "identify timeout",
                None,
                "identify_close",
            )
            .await;
            return;
        }
    };

    let authenticated = ServerFrame::event(
        EVENT_AUTHENTICATED,
        None,
        json!(Authenticated {
            connection_id: caller.connection_id,
            user_id: caller.user_id,
        }),
    );
    if send_frame_logged(&mut sender, &authenticated, Some(caller), "authenticated")
        .await
        .is_err()
    {
        state.service.disconnect(caller).await;
        return;
    }

    let session = Session::new(caller);
    let (session, reason, heartbeat_timed_out) =
        run_session(&mut sender, &mut receiver, session, events, &state).await;
    state.service.disconnect(session.caller).await;

    if heartbeat_timed_out {
        tracing::warn!(
            user_id = session.user_id(),
            connection_id = session.connection_id(),
            "client disconnected: {reason}"
        );
    } else {
        tracing::info!(
            user_id = session.user_id(),
            connection_id = session.connection_id(),
            frames_in = session.frames_in,
            events_out = session.events_out,
            uptime_secs = session.uptime_secs(),
            "client disconnected: {reason}"
        );
    }
}

/// Read frames until `identify` arrives, then authenticate it. Anything else that
/// is not a heartbeat ends the handshake.
async fn wait_for_identify(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &GatewayState,
) -> Result<(Caller, EventStream), CoreError> {
    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            wire_log_ws_in(None, "?", &text, "identify");
            return Err(CoreError::Unauthenticated);
        };
        wire_log_ws_in(None, &frame.op, &text, "identify");
        match frame.op.as_str() {
            OP_HEARTBEAT => continue,
            OP_IDENTIFY => {
                let identify: Identify = frame
                    .d
                    .and_then(|d| serde_json::from_value(d).ok())
                    .ok_or(CoreError::Unauthenticated)?;
                return state.service.connect(&identify.token).await;
            }
            _ => return Err(CoreError::Unauthenticated),
        }
    }
    Err(CoreError::Unauthenticated)
}

async fn run_session(
    sender: &mut (impl SinkExt<Message> + Unpin),
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    mut session: Session,
    mut events: EventStream,
    state: &GatewayState,
) -> (Session, String, bool) {
    let caller = session.caller;
    let mut presence = state.service.events.subscribe();
    let heartbeat_timeout = state.config.heartbeat_timeout;
    let mut ping_interval = tokio::time::interval(state.config.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);

    let (reason, heartbeat_timed_out) = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.frames_in += 1;
                        observability::ws_frame_received();
                        let frame = match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                wire_log_ws_in(Some(caller), "?", &text, "client_message");
                                let reply = error_frame(None, "bad_request", format!("malformed frame: {e}"), None);
                                if send_frame_logged(sender, &reply, Some(caller), "error").await.is_err() {
                                    break ("websocket send error".to_string(), false);
                                }
                                continue;
                            }
                        };
                        wire_log_ws_in(Some(caller), &frame.op, &text, "client_message");

                        let class = classify(&frame.op);
                        if class == OpClass::Heartbeat {
                            heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                            let ack = ServerFrame::reply(EVENT_HEARTBEAT_ACK, frame.request_id, json!({}));
                            if send_frame_logged(sender, &ack, Some(caller), "heartbeat_ack").await.is_err() {
                                break ("websocket send error".to_string(), false);
                            }
                            continue;
                        }
                        if let Err(retry_after_ms) = state.limits.check(caller.user_id, class) {
                            if class == OpClass::Typing {
                                tracing::debug!(user_id = caller.user_id, op = %frame.op, "rate limited (silent drop)");
                                continue;
                            }
                            let reply = error_frame(
                                frame.request_id,
                                "rate_limited",
                                format!("too many '{}' requests", frame.op),
                                Some(("retryAfterMs", json!(retry_after_ms))),
                            );
                            if send_frame_logged(sender, &reply, Some(caller), "rate_limit").await.is_err() {
                                break ("websocket send error".to_string(), false);
                            }
                            continue;
                        }

                        let request_id = frame.request_id;
                        let reply = match dispatch(&state.service, caller, &frame.op, frame.d).await {
                            Ok(Reply::Ack(d)) => Some(ServerFrame::reply(EVENT_ACK, request_id, d)),
                            Ok(Reply::Fire(d)) => request_id.map(|id| ServerFrame::reply(EVENT_ACK, Some(id), d)),
                            Err(err) => {
                                tracing::debug!(user_id = caller.user_id, op = %frame.op, error = %err, "op failed");
                                Some(error_frame(request_id, err.code(), err.to_string(), None))
                            }
                        };
                        if let Some(reply) = reply {
                            if send_frame_logged(sender, &reply, Some(caller), "reply").await.is_err() {
                                break ("websocket send error".to_string(), false);
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break (
                            match frame {
                                Some(frame) => format!("client close frame (code={}, reason={})", frame.code, frame.reason.as_str()),
                                None => "client close frame (no code/reason)".to_string(),
                            },
                            false,
                        );
                    }
                    Some(Err(err)) => {
                        break (format!("websocket receive error: {err}"), false);
                    }
                    None => {
                        break ("websocket stream ended".to_string(), false);
                    }
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let frame = event.to_frame();
                        if send_frame_logged(sender, &frame, Some(caller), "dispatch").await.is_err() {
                            break ("websocket send error".to_string(), false);
                        }
                        session.events_out += 1;
                        observability::ws_event_dispatched();
                    }
                    None => {
                        // The registry dropped this connection: the service is draining.
                        let _ = send_close_logged(sender, CLOSE_GOING_AWAY, "server shutting down", Some(caller), "shutdown_close").await;
                        break ("connection deregistered".to_string(), false);
                    }
                }
            }
            update = presence.recv() => {
                match update {
                    Ok(event) => {
                        if send_frame_logged(sender, &event.to_frame(), Some(caller), "presence").await.is_err() {
                            break ("websocket send error".to_string(), false);
                        }
                        session.events_out += 1;
                        observability::ws_event_dispatched();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(user_id = caller.user_id, skipped, "presence stream lagged; forcing reconnect");
                        let _ = send_close_logged(
                            sender,
                            CLOSE_TRY_AGAIN_LATER,
                            "gateway fell behind; reconnect required",
                            Some(caller),
                            "lagged_close",
                        )
                        .await;
                        break (format!("presence stream lagged by {skipped} events"), false);
                    }
                    Err(RecvError::Closed) => {
                        break ("presence stream closed".to_string(), false);
                    }
                }
            }
            () = &mut heartbeat_sleep => {
                let _ = send_close_logged(
                    sender,
                    CLOSE_HEARTBEAT_TIMEOUT,
                    "heartbeat timeout",
                    Some(caller),
                    "heartbeat_close",
                )
                .await;
                break (
                    format!("heartbeat timeout after {}ms", heartbeat_timeout.as_millis()),
                    true,
                );
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break ("websocket ping send error".to_string(), false);
                }
            }
        }
    };
    (session, reason, heartbeat_timed_out)
}
