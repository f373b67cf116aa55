use std::borrow::Cow;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{CloseReason, Outbound, Transport};
use crate::session::DeviceSession;
use crate::state::AppState;

/// How long the writer may take to flush the close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (transport, rx) = Transport::channel();
    let connection_id = transport.id();
    counter!("hearth_relay_sockets_opened_total", 1);
    debug!(connection_id = %connection_id, "socket opened");

    let mut writer = tokio::spawn(write_frames(ws_tx, rx, connection_id));
    let mut session = DeviceSession::new(state.router().clone(), transport.clone());

    let handshake_deadline = sleep(state.handshake_timeout());
    tokio::pin!(handshake_deadline);

    let reason = loop {
        tokio::select! {
            _ = &mut handshake_deadline, if !session.is_registered() => {
                session.expire_handshake(state.handshake_timeout());
                break CloseReason::HandshakeTimeout;
            }
            _ = transport.closed() => {
                // Close frame already queued by whoever closed it.
                break CloseReason::ClientDisconnected;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => session.on_text(&text).await,
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => session.on_text(text).await,
                    Err(err) => debug!(connection_id = %connection_id, error = %err, "ignoring non-utf8 frame"),
                },
                Some(Ok(Message::Pong(_))) => session.on_probe_ack(),
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        connection_id = %connection_id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    break CloseReason::ClientDisconnected;
                }
                None => break CloseReason::ClientDisconnected,
                Some(Err(err)) => {
                    warn!(connection_id = %connection_id, error = %err, "error receiving message");
                    break CloseReason::TransportFailed;
                }
            }
        }
    };

    session.close(reason);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }

    let identity = session.identity();
    info!(
        connection_id = %connection_id,
        device_id = ?identity.map(|id| &id.device_id),
        user_id = ?identity.map(|id| &id.user_id),
        "socket closed"
    );
}

async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    connection_id: Uuid,
) {
    while let Some(frame) = rx.recv().await {
        let message = match frame {
            Outbound::Envelope(envelope) => match serde_json::to_string(&envelope) {
                Ok(text) => Message::Text(text),
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "failed to encode envelope");
                    continue;
                }
            },
            Outbound::Probe => Message::Ping(Vec::new()),
            Outbound::Close(reason) => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code_for(reason),
                        reason: Cow::Borrowed(reason.label()),
                    })))
                    .await;
                break;
            }
        };
        if ws_tx.send(message).await.is_err() {
            break;
        }
    }
    debug!(connection_id = %connection_id, "writer task finished");
}

fn close_code_for(reason: CloseReason) -> u16 {
    match reason {
        CloseReason::ClientDisconnected => close_code::NORMAL,
        CloseReason::Replaced | CloseReason::ProbeTimeout | CloseReason::HandshakeTimeout => {
            close_code::POLICY
        }
        CloseReason::TransportFailed => close_code::ERROR,
        CloseReason::ServerShutdown => close_code::AWAY,
    }
}
