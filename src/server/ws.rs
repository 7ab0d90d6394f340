//! WebSocket channel: one reader task and one writer task per connection.
//!
//! The reader forwards decoded envelopes to the synchronizer; it never
//! interprets them. The writer drains the hub queue for this connection;
//! when the synchronizer closes the queue (disconnect or kick) the writer
//! sends a close frame and ends.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};

use super::hub::frame;
use super::protocol::{Envelope, ToastPayload};
use super::AppContext;
use crate::sync::Intent;

pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: AppContext) {
    let (conn_id, mut outbound) = ctx.hub.register();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            let text = match serde_json::to_string(&out) {
                Ok(text) => text,
                Err(e) => {
                    warn!("outbound frame failed to serialize: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    if ctx.intents.send(Intent::Connected { conn_id }).is_err() {
        warn!("synchronizer unavailable, dropping connection {conn_id}");
        ctx.hub.close(conn_id);
        return;
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => {
                    if ctx
                        .intents
                        .send(Intent::Frame { conn_id, envelope })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!("undecodable frame from conn {conn_id}: {e}");
                    ctx.hub.send_to(
                        conn_id,
                        frame(
                            "toast",
                            ToastPayload {
                                level: "error",
                                message: format!("unrecognized message: {e}"),
                            },
                        ),
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Ping/pong are answered by the websocket layer.
            }
            Err(e) => {
                debug!("read error on conn {conn_id}: {e}");
                break;
            }
        }
    }

    let _ = ctx.intents.send(Intent::Disconnected { conn_id });
    // The synchronizer closes the hub queue; the writer drains and exits.
    let _ = writer.await;
}
