//! WebSocket client transport for the presence relay.
//!
//! Provides:
//! - Connection setup and channel subscription
//! - Whisper send through a writer task
//! - Relay frames translated into [`TransportEvent`]s
//!
//! There is no automatic reconnect: when the connection drops the workspace
//! gets `Disconnected`, and the host may connect again and feed the new
//! event stream in; the fresh `Here` makes the workspace re-announce itself
//! and refetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::protocol::{RelayFrame, User};
use crate::transport::{Transport, TransportEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A subscribed connection to a relay channel.
pub struct WsTransport {
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    channel: String,
}

impl WsTransport {
    /// Connect to `url` and join `channel` as `user`.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(
        url: &str,
        channel: &str,
        user: User,
    ) -> Result<(WsTransport, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let subscribe = RelayFrame::Subscribe { channel: channel.to_string(), user: user.clone() }.encode()?;
        ws_writer
            .send(Message::Binary(subscribe.into()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::info!("{} subscribed to {channel} via {url}", user.name);

        let connected = Arc::new(AtomicBool::new(true));

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: relay frames become transport events
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let event = match RelayFrame::decode(&bytes) {
                            Ok(RelayFrame::Here { users }) => Some(TransportEvent::Here(users)),
                            Ok(RelayFrame::Joining { user }) => Some(TransportEvent::Joining(user)),
                            Ok(RelayFrame::Leaving { user }) => Some(TransportEvent::Leaving(user)),
                            Ok(RelayFrame::Whisper { event, payload }) => {
                                Some(TransportEvent::Whisper { event, payload })
                            }
                            Ok(RelayFrame::Error { message }) => {
                                log::warn!("Relay rejected a frame: {message}");
                                None
                            }
                            Ok(RelayFrame::Subscribe { .. }) => None,
                            Err(e) => {
                                log::debug!("Dropping undecodable relay frame: {e}");
                                None
                            }
                        };
                        if let Some(event) = event {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            reader_connected.store(false, Ordering::SeqCst);
            let _ = event_tx.send(TransportEvent::Disconnected);
        });

        let transport = WsTransport {
            outgoing_tx: out_tx,
            connected,
            channel: channel.to_string(),
        };
        Ok((transport, event_rx))
    }

    pub fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Transport for WsTransport {
    fn whisper(&self, event: &str, payload: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let frame = RelayFrame::Whisper { event: event.to_string(), payload: payload.to_string() }.encode()?;
        self.outgoing_tx.send(frame).map_err(|_| TransportError::Disconnected)
    }
}
