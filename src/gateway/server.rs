//! WebSocket front end
//!
//! Every accepted socket gets a connection id and a writer task. The socket
//! task owns the only strong handle to its [`WsConnection`]; the control
//! plane sees it through the multiplexer's weak handle.

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::mux::ClientConnection;
use super::GatewayEvent;
use crate::bus::ConnId;
use crate::core::config::ServerConfig;
use crate::core::{Error, Result};

/// Outgoing side of one client socket.
pub struct WsConnection {
    id: ConnId,
    tx: mpsc::UnboundedSender<Message>,
}

impl ClientConnection for WsConnection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn send_text(&self, text: &str) {
        if self.tx.send(Message::Text(text.to_string())).is_err() {
            debug!(conn_id = self.id, "writer gone, frame dropped");
        }
    }
}

pub struct WsServer {
    addr: String,
    events: flume::Sender<GatewayEvent>,
    next_id: AtomicU32,
}

impl WsServer {
    pub fn new(config: &ServerConfig, events: flume::Sender<GatewayEvent>) -> Self {
        Self {
            addr: format!("{}:{}", config.host, config.port),
            events,
            next_id: AtomicU32::new(1),
        }
    }

    /// Accept connections until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("🌐 WebSocket gateway listening on {}", self.addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(id, stream).await {
                    warn!(conn_id = id, peer = %peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, id: ConnId, stream: TcpStream) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let conn: Arc<dyn ClientConnection> = Arc::new(WsConnection { id, tx: tx.clone() });
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    debug!(conn_id = id, error = %e, "write failed");
                    break;
                }
            }
            if let Err(e) = write.close().await {
                debug!(conn_id = id, error = %e, "close failed");
            }
        });

        self.post(GatewayEvent::Opened(Arc::downgrade(&conn)))?;
        debug!(conn_id = id, "client connected");

        let result = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.post(GatewayEvent::Text { conn_id: id, text })?;
                }
                Some(Ok(Message::Ping(data))) => {
                    if tx.send(Message::Pong(data)).is_err() {
                        debug!(conn_id = id, "pong dropped, writer gone");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(Error::WebSocket(e.to_string())),
            }
        };

        self.post(GatewayEvent::Closed { conn_id: id })?;
        drop(tx);
        drop(conn);
        if writer.await.is_err() {
            error!(conn_id = id, "writer task panicked");
        }
        debug!(conn_id = id, "client disconnected");
        result
    }

    fn post(&self, event: GatewayEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| Error::InvalidState("control plane stopped".to_string()))
    }
}
