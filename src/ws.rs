//! WebSocket sessions speaking the relay protocol.
//!
//! Frames are JSON array envelopes: `EVENT`, `REQ`, `CLOSE`, and `AUTH`.
//! Every session is issued a challenge on connect; a signed
//! proof-of-possession binds the session to a pubkey for admission checks.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::event::{self, Event, Filter, CLIENT_AUTH};
use crate::instance::{Ingest, Instance, SessionCtx};

/// Auth proofs must be created within this many seconds of now.
const AUTH_WINDOW_SECS: u64 = 600;

struct Session {
    ctx: SessionCtx,
    challenge: String,
    subs: HashMap<String, Vec<Filter>>,
}

/// Drive one client connection until it closes.
pub async fn process(mut socket: WebSocket, instance: Arc<Instance>) {
    let mut session = Session {
        ctx: SessionCtx::default(),
        challenge: event::random_token(32),
        subs: HashMap::new(),
    };
    let challenge_msg = json!(["AUTH", session.challenge]);
    if socket
        .send(Message::Text(challenge_msg.to_string()))
        .await
        .is_err()
    {
        return;
    }
    let mut live = instance.subscribe();
    loop {
        tokio::select! {
            msg = socket.next() => {
                let Some(Ok(msg)) = msg else { break };
                if let Message::Text(txt) = msg {
                    if handle_frame(&mut socket, &instance, &mut session, &txt)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
            ev = live.recv() => {
                match ev {
                    Ok(ev) => {
                        if forward_live(&mut socket, &instance, &session, &ev)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "live subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Dispatch one inbound frame. Malformed frames are ignored.
async fn handle_frame(
    socket: &mut WebSocket,
    instance: &Instance,
    session: &mut Session,
    txt: &str,
) -> Result<(), axum::Error> {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        return Ok(());
    };
    let Some(arr) = val.as_array() else {
        return Ok(());
    };
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 2 => handle_event(socket, instance, session, &arr[1]).await,
        Some("REQ") if arr.len() >= 3 => handle_req(socket, instance, session, arr).await,
        Some("CLOSE") if arr.len() >= 2 => {
            if let Some(sub) = arr[1].as_str() {
                session.subs.remove(sub);
            }
            Ok(())
        }
        Some("AUTH") if arr.len() >= 2 => handle_auth(socket, session, &arr[1]).await,
        _ => Ok(()),
    }
}

async fn send_ok(
    socket: &mut WebSocket,
    id: &str,
    accepted: bool,
    reason: &str,
) -> Result<(), axum::Error> {
    let msg = json!(["OK", id, accepted, reason]);
    socket.send(Message::Text(msg.to_string())).await
}

async fn handle_event(
    socket: &mut WebSocket,
    instance: &Instance,
    session: &mut Session,
    payload: &Value,
) -> Result<(), axum::Error> {
    let Ok(ev) = serde_json::from_value::<Event>(payload.clone()) else {
        return Ok(());
    };
    if event::verify_event(&ev).is_err() {
        return send_ok(socket, &ev.id, false, "invalid: bad id or signature").await;
    }
    if let Err(reject) = instance.on_event(&session.ctx, &ev) {
        return send_ok(socket, &ev.id, false, &reject.to_string()).await;
    }
    match instance.ingest(&ev) {
        Ok(Ingest::Stored) | Ok(Ingest::Transient) => send_ok(socket, &ev.id, true, "").await,
        Ok(Ingest::Duplicate) => {
            send_ok(socket, &ev.id, false, "duplicate: already have this event").await
        }
        Err(e) => {
            warn!(id = %ev.id, error = %e, "storage failure");
            send_ok(socket, &ev.id, false, "error: failed to store event").await
        }
    }
}

async fn handle_req(
    socket: &mut WebSocket,
    instance: &Instance,
    session: &mut Session,
    arr: &[Value],
) -> Result<(), axum::Error> {
    let sub = arr[1].as_str().unwrap_or_default().to_string();
    let filters: Vec<Filter> = arr[2..].iter().map(Filter::from_value).collect();
    let probe = filters.first().cloned().unwrap_or_default();
    if let Err(reject) = instance.on_request(&session.ctx, &probe) {
        let msg = json!(["CLOSED", sub, reject.to_string()]);
        return socket.send(Message::Text(msg.to_string())).await;
    }
    for filter in &filters {
        match instance.query_stored(&session.ctx, filter) {
            Ok(events) => {
                for ev in events {
                    let msg = json!(["EVENT", sub, ev]);
                    socket.send(Message::Text(msg.to_string())).await?;
                }
            }
            Err(e) => warn!(error = %e, "subscription query failed"),
        }
    }
    let eose = json!(["EOSE", sub]);
    socket.send(Message::Text(eose.to_string())).await?;
    session.subs.insert(sub, filters);
    Ok(())
}

async fn handle_auth(
    socket: &mut WebSocket,
    session: &mut Session,
    payload: &Value,
) -> Result<(), axum::Error> {
    let Ok(ev) = serde_json::from_value::<Event>(payload.clone()) else {
        return Ok(());
    };
    if auth_proof_is_valid(&ev, &session.challenge) {
        session.ctx.authed = Some(ev.pubkey.clone());
        send_ok(socket, &ev.id, true, "").await
    } else {
        send_ok(socket, &ev.id, false, "invalid: authentication failed").await
    }
}

/// A valid proof is a freshly signed `CLIENT_AUTH` event echoing the
/// session challenge.
fn auth_proof_is_valid(ev: &Event, challenge: &str) -> bool {
    if ev.kind != CLIENT_AUTH {
        return false;
    }
    if event::verify_event(ev).is_err() {
        return false;
    }
    if ev.tag_value("challenge") != Some(challenge) {
        return false;
    }
    let now = event::now();
    ev.created_at + AUTH_WINDOW_SECS >= now && ev.created_at <= now + AUTH_WINDOW_SECS
}

/// Fan a live event out to every matching subscription on this session.
async fn forward_live(
    socket: &mut WebSocket,
    instance: &Instance,
    session: &Session,
    ev: &Event,
) -> Result<(), axum::Error> {
    if instance.prevent_broadcast(ev) {
        return Ok(());
    }
    for (sub, filters) in &session.subs {
        if !filters.iter().any(|f| f.matches(ev)) {
            continue;
        }
        let Some(visible) = instance.live_visible(&session.ctx, ev.clone()) else {
            continue;
        };
        let msg = json!(["EVENT", sub, visible]);
        socket.send(Message::Text(msg.to_string())).await?;
    }
    Ok(())
}
