use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{decode_reply, encode_reply};
use crate::config::CorrelatorConfig;
use crate::correlator::ReplyInbox;
use crate::interfaces::transport::Result;
use crate::interfaces::{ReplySender, TransportError};
use crate::messages::Reply;

/// Listens for reply connections and forwards replies to a correlator.
pub struct TcpReplyServer {
    local_addr: SocketAddr,
    reply_address: String,
    accept_task: JoinHandle<()>,
}

impl TcpReplyServer {
    /// Bind `address` and start accepting. Port 0 picks a free port; see
    /// [`local_addr`](TcpReplyServer::local_addr).
    pub async fn bind(address: &str, inbox: ReplyInbox) -> Result<Self> {
        Self::start(address, None, inbox).await
    }

    /// Bind `listen_address` and advertise `reply_address` when it is set.
    pub async fn from_config(config: &CorrelatorConfig, inbox: ReplyInbox) -> Result<Self> {
        Self::start(&config.listen_address, config.reply_address.clone(), inbox).await
    }

    async fn start(address: &str, advertised: Option<String>, inbox: ReplyInbox) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let reply_address = advertised.unwrap_or_else(|| local_addr.to_string());
        info!(address = %local_addr, %reply_address, "Reply server listening");

        let accept_task = tokio::spawn(accept_loop(listener, inbox));
        Ok(Self {
            local_addr,
            reply_address,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address consumers should send replies to. This is the configured
    /// reply address, or the bound address when none was configured.
    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    /// Stop accepting connections. Open connections drain on their own.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for TcpReplyServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, inbox: ReplyInbox) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Reply connection accepted");
                tokio::spawn(read_replies(stream, peer, inbox.clone()));
            }
            Err(e) => warn!(error = %e, "Failed to accept reply connection"),
        }
    }
}

async fn read_replies(stream: TcpStream, peer: SocketAddr, inbox: ReplyInbox) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "Reply connection failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_reply(&line) {
            Ok(reply) => {
                if inbox.deliver(reply).is_err() {
                    debug!(%peer, "Correlator stopped, closing reply connection");
                    return;
                }
            }
            Err(e) => warn!(%peer, error = %e, "Discarding undecodable reply"),
        }
    }
    debug!(%peer, "Reply connection closed");
}

type Connection = Arc<Mutex<TcpStream>>;

/// Sends replies over cached TCP connections, one per address.
#[derive(Default)]
pub struct TcpReplySender {
    connections: DashMap<String, Connection>,
}

impl TcpReplySender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    async fn connect(&self, address: &str) -> Result<Connection> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::Connection {
                address: address.to_string(),
                message: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        debug!(%address, "Reply connection opened");

        let connection = Arc::new(Mutex::new(stream));
        Ok(self
            .connections
            .entry(address.to_string())
            .or_insert(connection)
            .clone())
    }

    async fn write(&self, address: &str, connection: &Connection, bytes: &[u8]) -> Result<()> {
        let written = {
            let mut stream = connection.lock().await;
            if is_open(&stream) {
                stream.write_all(bytes).await.map_err(|e| e.to_string())
            } else {
                Err("peer closed the connection".to_string())
            }
        };
        if let Err(message) = written {
            self.connections
                .remove_if(address, |_, cached| Arc::ptr_eq(cached, connection));
            return Err(TransportError::Connection {
                address: address.to_string(),
                message,
            });
        }
        Ok(())
    }
}

/// Whether the peer still holds its end of the connection.
///
/// A write to a half-closed socket succeeds locally and the bytes are lost.
/// The reply server never writes, so a readable end-of-stream means closed.
fn is_open(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

#[async_trait]
impl ReplySender for TcpReplySender {
    async fn send_reply(&self, reply: Reply, address: &str) -> Result<()> {
        let bytes = encode_reply(&reply)?;

        let cached = self.connections.get(address).map(|c| c.value().clone());
        if let Some(connection) = cached {
            match self.write(address, &connection, &bytes).await {
                Ok(()) => return Ok(()),
                // Peer went away since the last reply; reconnect once.
                Err(e) => debug!(%address, error = %e, "Cached reply connection failed"),
            }
        }

        let connection = self.connect(address).await?;
        self.write(address, &connection, &bytes).await?;
        debug!(command_id = %reply.command_id(), %address, "Reply sent");
        Ok(())
    }
}
