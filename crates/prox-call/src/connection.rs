use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use prox_proto::{encode, ClientFrame};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::controller::{CallController, CallEvent};
use crate::error::CallError;
use crate::identity::IdentityProvider;
use crate::media::MediaEngineFactory;

#[derive(Clone)]
pub struct ClientConfig {
    /// Websocket URL of the signaling server, e.g. `ws://host:3000/ws`.
    pub url: String,
    pub identity: Arc<dyn IdentityProvider>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            url: url.into(),
            identity,
        }
    }
}

/// A joined signaling session driving one [`CallController`].
///
/// The reader task feeds server frames to the controller; the writer task
/// drains the controller's outbound frames onto the socket. When the socket
/// goes away every call is closed.
pub struct SignalingConnection {
    controller: Arc<CallController>,
    shutdown: Arc<Notify>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingConnection {
    /// Connect, JOIN with the configured identity and start pumping frames.
    pub async fn connect(
        config: ClientConfig,
        factory: Arc<dyn MediaEngineFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallEvent>), CallError> {
        let (ws_stream, _) = connect_async(config.url.as_str()).await?;
        debug!(target: "prox_call", url = %config.url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (controller, events) = CallController::new(config.identity, factory, send_tx);
        controller.on_transport_opened();

        let shutdown = Arc::new(Notify::new());
        let writer_shutdown = Arc::clone(&shutdown);
        let writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = send_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = writer_shutdown.notified() => {
                        while let Ok(frame) = send_rx.try_recv() {
                            if !write_frame(&mut ws_write, &frame).await {
                                break;
                            }
                        }
                        break;
                    }
                };
                if !write_frame(&mut ws_write, &frame).await {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_controller = Arc::clone(&controller);
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => reader_controller.handle_text(&text).await,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => reader_controller.handle_text(&text).await,
                        Err(_) => debug!(target: "prox_call", "ignoring non-UTF8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(target: "prox_call", frame = ?frame, "server closed signaling websocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target: "prox_call", "signaling websocket closed: {err}");
                            }
                            _ => warn!(target: "prox_call", "signaling websocket error: {err}"),
                        }
                        break;
                    }
                }
            }
            reader_controller.on_transport_closed().await;
        });

        controller.join()?;
        info!(target: "prox_call", identity = %controller.identity(), "joined signaling server");

        Ok((
            Self {
                controller,
                shutdown,
                writer: Mutex::new(Some(writer)),
                reader: Mutex::new(Some(reader)),
            },
            events,
        ))
    }

    pub fn controller(&self) -> &Arc<CallController> {
        &self.controller
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_socket_connected()
    }

    /// Send LEAVE, flush pending frames and close the socket. Safe to call
    /// more than once.
    pub async fn disconnect(&self) {
        if self.controller.is_socket_connected() {
            let _ = self.controller.leave();
        }
        self.shutdown.notify_one();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.controller.on_transport_closed().await;
    }
}

impl Drop for SignalingConnection {
    fn drop(&mut self) {
        for task in [self.writer.lock().take(), self.reader.lock().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

/// Returns false once the socket can no longer be written.
async fn write_frame<S>(sink: &mut S, frame: &ClientFrame) -> bool
where
    S: Sink<Message> + Unpin,
{
    match encode(frame) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            warn!(target: "prox_call", error = %err, "failed to encode client frame");
            true
        }
    }
}
