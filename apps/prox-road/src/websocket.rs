use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::router::Connection;
use crate::AppState;

/// WebSocket upgrade handler. Plain HTTP requests to the same path get a
/// short status line instead of an upgrade error.
pub async fn websocket_handler(
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    match ws {
        Some(ws) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
            .into_response(),
        None => "Signaling server is running".into_response(),
    }
}

/// Drive one websocket until it closes, errors, or the registry closes it.
async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    debug!(remote_addr = %remote_addr, "websocket connected");
    let mut connection = Connection::new(state.registry.clone(), tx);

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(incoming) = incoming else {
                    break;
                };
                match incoming {
                    Ok(Message::Text(text)) => {
                        connection.handle_text(&text);
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => {
                            connection.handle_text(&text);
                        }
                        Err(_) => debug!(remote_addr = %remote_addr, "ignoring non-UTF8 binary frame"),
                    },
                    Ok(Message::Pong(_)) => connection.record_ack(),
                    Ok(Message::Ping(_)) => {}
                    Ok(Message::Close(frame)) => {
                        debug!(
                            remote_addr = %remote_addr,
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "client closed websocket"
                        );
                        break;
                    }
                    Err(err) => {
                        warn!(remote_addr = %remote_addr, error = %err, "websocket receive failed");
                        break;
                    }
                }
            }
            _ = &mut writer => {
                debug!(remote_addr = %remote_addr, "writer finished; closing connection");
                break;
            }
        }
    }

    connection.close();
    writer.abort();
    info!(remote_addr = %remote_addr, "websocket disconnected");
}
