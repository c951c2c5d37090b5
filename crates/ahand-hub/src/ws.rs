//! WebSocket carrier for device connections (axum).

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt, stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::Registry;
use crate::transport::{FrameSender, Transport};

/// Router exposing the device endpoint at `path`.
pub fn router(registry: Arc<Registry>, path: &str) -> Router {
    Router::new()
        .route(path, get(ws_handler))
        .with_state(registry)
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(registry): State<Arc<Registry>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        match registry.serve(into_transport(socket)).await {
            Err(e) if e.is_fatal() => warn!(error = %e, "device connection dropped"),
            Err(e) => debug!(error = %e, "device connection ended with error"),
            Ok(()) => {}
        }
    })
}

/// Split a socket into a [`Transport`].
///
/// Binary messages are frames; text, ping and pong are ignored. A close
/// message or read error ends the frame stream.
pub fn into_transport(socket: WebSocket) -> Transport {
    let (mut ws_sender, ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let closed = CancellationToken::new();

    // Write loop: drains the frame queue until closed from either side.
    let token = closed.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(data) => {
                        if ws_sender.send(Message::binary(data)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        token.cancel();
    });

    let frames = stream::unfold(ws_receiver, |mut ws_receiver| async move {
        loop {
            match ws_receiver.next().await? {
                Ok(Message::Binary(data)) => return Some((data.to_vec(), ws_receiver)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    debug!("ws read error: {e}");
                    return None;
                }
            }
        }
    });

    Transport {
        sender: FrameSender::new(tx, closed),
        frames: Box::pin(frames),
    }
}
