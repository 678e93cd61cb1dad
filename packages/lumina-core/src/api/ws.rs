//! WebSocket endpoint: upgrade, query parsing, early-inbound buffering.
//!
//! This is the only place that touches the transport. Every other component
//! sees the abstract connection handle (an outbound queue drained by the
//! writer task here).
//!
//! A display may start pushing frames before join setup finishes (kiosks
//! restart mid-traffic). Those frames are buffered, bounded, and replayed
//! into the hub in arrival order once setup completes, so they are delivered
//! before the first frame accepted afterward.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::protocol_constants::{CLOSE_INVALID_SESSION, SETUP_BUFFER_MAX_FRAMES};
use crate::relay::{JoinRequest, Outbound, Role, ServerMessage};

/// Query parameters of the upgrade URL:
/// `/ws?role=controller|display|viewer&session=<ID>&kiosk=true`.
#[derive(Deserialize)]
pub struct WsQuery {
    role: Option<String>,
    session: Option<String>,
    kiosk: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, query))
}

/// Main WebSocket connection handler.
async fn handle_ws(socket: WebSocket, state: AppState, query: WsQuery) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Writer task: drains the outbound queue onto the socket. Fan-out into
    // the queue never blocks, which keeps room delivery atomic.
    let writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let req = JoinRequest {
        role: Role::from_query(query.role.as_deref()),
        kiosk: query.kiosk.as_deref() == Some("true"),
        requested: query.session.clone().filter(|s| !s.is_empty()),
    };

    // Run join setup while buffering any frames that race ahead of it.
    let join = state.hub.join_session(req, tx.clone());
    tokio::pin!(join);
    let mut early: Vec<String> = Vec::new();
    let mut closed_during_setup = false;
    let joined = loop {
        tokio::select! {
            result = &mut join => break result,
            inbound = receiver.next(), if !closed_during_setup => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if early.len() < SETUP_BUFFER_MAX_FRAMES {
                        early.push(text.to_string());
                    } else {
                        log::debug!("[WS] Setup buffer full, dropping early frame");
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    closed_during_setup = true;
                }
                _ => {}
            }
        }
    };

    let conn = match joined {
        Ok(conn) => conn,
        Err(err) => {
            log::info!("[WS] Join rejected: {}", err);
            let _ = tx.send(Outbound::Frame(
                ServerMessage::Error {
                    message: err.to_string(),
                }
                .to_json(),
            ));
            let _ = tx.send(Outbound::Close {
                code: CLOSE_INVALID_SESSION,
                reason: "Invalid session".to_string(),
            });
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    if closed_during_setup {
        state.hub.handle_close(&conn);
        drop(tx);
        writer.abort();
        return;
    }

    // Flush buffered frames in arrival order before reading live traffic.
    for frame in early.drain(..) {
        state.hub.handle_inbound(&conn, &frame).await;
    }

    while let Some(inbound) = receiver.next().await {
        match inbound {
            Ok(Message::Text(text)) => {
                state.hub.handle_inbound(&conn, text.as_str()).await;
            }
            // The relay is text-only; binary frames are dropped. Ping/pong
            // control frames are answered by the transport.
            Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => break,
        }
    }

    state.hub.handle_close(&conn);
    drop(tx);
    writer.abort();
}
