// src/overlay/mod.rs - WebSocket push channel for on-screen browser sources

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Pushes named events to any connected overlay clients (OBS browser
/// sources and the like). Clients subscribe by opening a WebSocket; every
/// published event is fanned out to all of them as one JSON text frame:
/// `{"event": "...", "payload": ...}`.
pub struct OverlayServer {
    port: u16,
    events: broadcast::Sender<String>,
}

impl OverlayServer {
    pub fn new(port: u16) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { port, events }
    }

    /// Publish an event. Having no connected clients is normal, not an error.
    pub fn publish(&self, event: &str, payload: serde_json::Value) {
        let frame = serde_json::json!({ "event": event, "payload": payload }).to_string();
        if self.events.send(frame).is_err() {
            debug!("no overlay clients connected for '{event}'");
        }
    }

    /// Bind the listener and start accepting clients in the background.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("failed to bind overlay server on port {}", self.port))?;
        info!("Overlay server listening on port {}", self.port);

        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let rx = events.subscribe();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => {
                                    debug!("overlay client connected: {addr}");
                                    serve_client(ws, rx).await;
                                    debug!("overlay client disconnected: {addr}");
                                }
                                Err(e) => warn!("overlay handshake failed for {addr}: {e}"),
                            }
                        });
                    }
                    Err(e) => {
                        error!("overlay accept error: {e}");
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

async fn serve_client(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut rx: broadcast::Receiver<String>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(text) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("overlay client lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(payload))) => {
                    if write.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("overlay client error: {e}");
                    break;
                }
            },
        }
    }
}
