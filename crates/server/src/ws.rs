// WebSocket relay: sync handshake, update processing, and presence fan-out.
//
// One task per connection. The document id is the request path with the
// leading slash stripped (`"default"` when empty); write permission is
// resolved once from the session cookie at upgrade time and pinned for the
// connection's lifetime.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::acl::{parse_session_cookie, AclOracle, WriteDecision};
use crate::protocol::{encode_sync, Frame, SyncKind};
use crate::registry::{Room, RoomRegistry};

pub const DEFAULT_DOC_ID: &str = "default";

#[derive(Clone)]
pub struct SyncState {
    pub registry: Arc<RoomRegistry>,
    pub oracle: Arc<AclOracle>,
}

pub fn router(state: SyncState) -> Router {
    Router::new()
        .route("/", get(connect_default_doc))
        .route("/{*doc_id}", get(connect_doc))
        .with_state(state)
}

/// Serve the sync router on an already-bound listener.
pub async fn serve(listener: TcpListener, state: SyncState) -> Result<()> {
    axum::serve(listener, router(state)).await.context("sync websocket server failed")
}

async fn connect_default_doc(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<SyncState>,
) -> Response {
    upgrade(ws, headers, state, DEFAULT_DOC_ID.to_string())
}

async fn connect_doc(
    ws: WebSocketUpgrade,
    Path(doc_id): Path<String>,
    headers: HeaderMap,
    State(state): State<SyncState>,
) -> Response {
    upgrade(ws, headers, state, doc_id)
}

fn upgrade(ws: WebSocketUpgrade, headers: HeaderMap, state: SyncState, doc_id: String) -> Response {
    let session_token = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_session_cookie)
        .map(ToOwned::to_owned);
    ws.on_upgrade(move |socket| handle_socket(socket, state, doc_id, session_token))
        .into_response()
}

async fn handle_socket(
    mut socket: WebSocket,
    state: SyncState,
    doc_id: String,
    session_token: Option<String>,
) {
    // Permission is evaluated exactly once; later grant or session changes
    // do not affect this connection.
    let decision = match state.oracle.can_write(session_token.as_deref(), &doc_id) {
        Ok(decision) => decision,
        Err(error) => {
            warn!(doc_id, ?error, "session lookup failed; treating connection as read-only");
            WriteDecision::denied()
        }
    };
    let can_write = decision.can_write;

    let client_id = state.registry.next_client_id();
    let room = state.registry.get_or_create(&doc_id).await;
    room.connect();
    let mut updates_rx = room.subscribe();

    info!(
        doc_id = %room.id(),
        client_id,
        username = decision.username().unwrap_or("-"),
        can_write,
        "client connected"
    );

    // The server opens sync unconditionally: step-1 with its state vector.
    let step1 = {
        let doc = room.doc().lock().await;
        encode_sync(SyncKind::Step1, &doc.encode_state_vector())
    };
    if socket.send(WsMessage::Binary(step1.into())).await.is_ok() {
        'session: loop {
            tokio::select! {
                incoming = socket.recv() => {
                    let Some(Ok(message)) = incoming else {
                        break 'session;
                    };

                    match message {
                        WsMessage::Binary(payload) => {
                            match process_frame(&room, client_id, can_write, payload.as_ref()).await {
                                Ok(responses) => {
                                    for frame in responses {
                                        if socket.send(WsMessage::Binary(frame.into())).await.is_err() {
                                            break 'session;
                                        }
                                    }
                                }
                                Err(error) => {
                                    error!(doc_id = %room.id(), client_id, ?error, "failed to process inbound frame");
                                    break 'session;
                                }
                            }
                        }
                        WsMessage::Close(_) => break 'session,
                        WsMessage::Ping(payload) => {
                            if socket.send(WsMessage::Pong(payload)).await.is_err() {
                                break 'session;
                            }
                        }
                        WsMessage::Pong(_) | WsMessage::Text(_) => {}
                    }
                }
                outbound = updates_rx.recv() => {
                    match outbound {
                        // Never echo a frame back at its sender.
                        Ok((sender_id, frame)) if sender_id != client_id => {
                            if socket.send(WsMessage::Binary(frame.into())).await.is_err() {
                                break 'session;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(doc_id = %room.id(), client_id, skipped, "connection lagged behind room broadcast");
                        }
                        Err(broadcast::error::RecvError::Closed) => break 'session,
                    }
                }
            }
        }
    }

    room.disconnect().await;
    info!(doc_id = %room.id(), client_id, "client disconnected");
}

/// Handle one inbound frame. Returns the frames to send straight back to
/// this connection; anything for the rest of the room goes out through the
/// room's broadcast channel.
async fn process_frame(
    room: &Room,
    client_id: u64,
    can_write: bool,
    data: &[u8],
) -> Result<Vec<Vec<u8>>> {
    match Frame::decode(data) {
        // No error channel in this protocol: undecodable frames vanish.
        Frame::Malformed => {
            debug!(doc_id = %room.id(), client_id, len = data.len(), "dropping malformed frame");
            Ok(Vec::new())
        }
        Frame::Sync { kind: SyncKind::Step1, payload } => {
            // Answer with the diff the peer is missing, then our own step-1
            // so the peer sends back whatever we are missing. The handshake
            // is symmetric; each side's step-1 drives the other's step-2.
            let doc = room.doc().lock().await;
            let diff = doc.encode_diff(&payload).context("peer state vector did not decode")?;
            Ok(vec![
                encode_sync(SyncKind::Step2, &diff),
                encode_sync(SyncKind::Step1, &doc.encode_state_vector()),
            ])
        }
        Frame::Sync { kind, payload } => {
            if !can_write {
                // Dropped outright: no apply, no persist, no broadcast, and
                // deliberately no notification to the sender.
                debug!(doc_id = %room.id(), client_id, "dropping update from read-only connection");
                return Ok(Vec::new());
            }

            room.apply_and_persist(&payload).await?;

            // A step-2 is part of the *sender's* handshake; recipients must
            // see it as a plain update. Updates forward byte-for-byte.
            let outgoing = if kind == SyncKind::Step2 {
                encode_sync(SyncKind::Update, &payload)
            } else {
                data.to_vec()
            };
            room.broadcast(client_id, outgoing);
            Ok(Vec::new())
        }
        Frame::Awareness(_) => {
            // Presence is ephemeral: relayed verbatim regardless of write
            // permission, never applied, never persisted.
            room.broadcast(client_id, data.to_vec());
            Ok(Vec::new())
        }
    }
}
