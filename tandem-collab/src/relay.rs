//! WebSocket presence relay.
//!
//! Architecture:
//! ```text
//! Window A ──┐                      ┌── channel collaboration.1.en
//!            ├── RelayServer ── LocalHub
//! Window B ──┘   (bincode frames)   └── channel collaboration.7.en
//! ```
//!
//! A connection's first frame is `Subscribe { channel, user }`; after that
//! the relay forwards `Whisper` frames to the channel and pushes roster
//! changes and other members' whispers back. The relay stores nothing.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{HubTransport, LocalHub, DEFAULT_MAX_MESSAGE_BYTES};
use crate::protocol::RelayFrame;
use crate::transport::{Transport, TransportEvent};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Largest whisper (event name + payload) forwarded
    pub max_message_bytes: usize,
    /// Connections allowed per channel
    pub max_members_per_channel: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_members_per_channel: 100,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
}

pub struct RelayServer {
    config: RelayConfig,
    hub: LocalHub,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            hub: LocalHub::new(config.max_message_bytes),
            config,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until an accept fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Presence relay listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: LocalHub,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership: Option<(HubTransport, mpsc::UnboundedReceiver<TransportEvent>)> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.total_frames += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                let reply = match RelayFrame::decode(&bytes) {
                                    Ok(frame) => Self::on_frame(frame, &hub, &config, &mut membership),
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        Some(format!("undecodable frame: {e}"))
                                    }
                                };
                                if let Some(message) = reply {
                                    stats.write().await.rejected_frames += 1;
                                    let encoded = RelayFrame::Error { message }.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    event = async {
                        match membership.as_mut() {
                            Some((_, rx)) => rx.recv().await,
                            // not subscribed yet
                            None => std::future::pending().await,
                        }
                    } => {
                        let frame = match event {
                            Some(TransportEvent::Here(users)) => RelayFrame::Here { users },
                            Some(TransportEvent::Joining(user)) => RelayFrame::Joining { user },
                            Some(TransportEvent::Leaving(user)) => RelayFrame::Leaving { user },
                            Some(TransportEvent::Whisper { event, payload }) => RelayFrame::Whisper { event, payload },
                            Some(TransportEvent::Disconnected) => continue,
                            None => break,
                        };
                        let encoded = frame.encode()?;
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let Some((transport, _)) = membership.take() {
            log::info!("{} left {}", transport.user().name, transport.channel());
            transport.leave();
        }
        stats.write().await.active_connections -= 1;

        result
    }

    /// Handle one client frame. Returns an error message to send back.
    fn on_frame(
        frame: RelayFrame,
        hub: &LocalHub,
        config: &RelayConfig,
        membership: &mut Option<(HubTransport, mpsc::UnboundedReceiver<TransportEvent>)>,
    ) -> Option<String> {
        match frame {
            RelayFrame::Subscribe { channel, user } => {
                if membership.is_some() {
                    return Some("already subscribed".to_string());
                }
                if hub.member_count(&channel) >= config.max_members_per_channel {
                    log::warn!("Channel {channel} is full");
                    return Some(format!("channel {channel} is full"));
                }
                log::info!("{} ({}) joined {channel}", user.name, user.id);
                *membership = Some(hub.join(&channel, user));
                None
            }
            RelayFrame::Whisper { event, payload } => {
                let Some((transport, _)) = membership.as_ref() else {
                    return Some("not subscribed".to_string());
                };
                match transport.whisper(&event, &payload) {
                    Ok(()) => None,
                    Err(e) => {
                        log::debug!("Rejected {event}: {e}");
                        Some(e.to_string())
                    }
                }
            }
            other => {
                log::debug!("Unexpected frame from client: {other:?}");
                None
            }
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &LocalHub {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::User;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(config.max_members_per_channel, 100);
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(server.hub().stats().channels, 0);
    }

    #[tokio::test]
    async fn test_whisper_before_subscribe_rejected() {
        let hub = LocalHub::default();
        let mut membership = None;
        let reply = RelayServer::on_frame(
            RelayFrame::Whisper { event: "focus".into(), payload: "{}".into() },
            &hub,
            &RelayConfig::default(),
            &mut membership,
        );
        assert_eq!(reply.as_deref(), Some("not subscribed"));
    }

    #[tokio::test]
    async fn test_subscribe_twice_rejected() {
        let hub = LocalHub::default();
        let config = RelayConfig::default();
        let mut membership = None;
        let subscribe = RelayFrame::Subscribe { channel: "c".into(), user: User::new(1, "Alice") };

        assert!(RelayServer::on_frame(subscribe.clone(), &hub, &config, &mut membership).is_none());
        assert!(RelayServer::on_frame(subscribe, &hub, &config, &mut membership).is_some());
        assert_eq!(hub.member_count("c"), 1);
    }

    #[tokio::test]
    async fn test_full_channel_rejected() {
        let hub = LocalHub::default();
        let config = RelayConfig { max_members_per_channel: 1, ..RelayConfig::default() };
        let (_first, _rx) = hub.join("c", User::new(1, "Alice"));

        let mut membership = None;
        let reply = RelayServer::on_frame(
            RelayFrame::Subscribe { channel: "c".into(), user: User::new(2, "Bob") },
            &hub,
            &config,
            &mut membership,
        );
        assert!(reply.is_some());
        assert!(membership.is_none());
    }
}
