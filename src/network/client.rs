//! Network Client
//!
//! TCP client for request/response calls to peer nodes. Connections are
//! pooled per address and reused after a complete exchange.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{read_message, write_message};
use crate::replication::Message;
use crate::error::{Error, Result};

/// Idle connection
struct PoolEntry {
    stream: TcpStream,
    last_used: Instant,
}

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Idle connections per address
    pool: Mutex<HashMap<String, Vec<PoolEntry>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
    /// Max idle connections kept per peer
    max_idle: usize,
}

/// Map an I/O failure during an exchange to the transport error taxonomy
fn exchange_error(address: &str, error: Error) -> Error {
    match error {
        Error::Io(e)
            if matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ) =>
        {
            Error::ConnectionReset(address.to_string())
        }
        other => other,
    }
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            connect_timeout,
            request_timeout,
            max_idle: 4,
        }
    }

    /// Send a message to a peer and wait for the response.
    /// A peer that does not answer within the request timeout is `NoResponse`.
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        match timeout(self.request_timeout, self.send_inner(address, &message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::NoResponse(address.to_string())),
        }
    }

    async fn send_inner(&self, address: &str, message: &Message) -> Result<Message> {
        // A pooled connection may have been closed by the peer; fall back to a fresh one
        if let Some(mut stream) = self.checkout(address).await {
            match exchange(&mut stream, message).await {
                Ok(response) => {
                    self.checkin(address, stream).await;
                    return Ok(response);
                }
                Err(e) => tracing::debug!("Pooled connection to {} failed: {}", address, e),
            }
        }

        let mut stream = self.connect(address).await?;
        let response = exchange(&mut stream, message)
            .await
            .map_err(|e| exchange_error(address, e))?;
        self.checkin(address, stream).await;
        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn checkout(&self, address: &str) -> Option<TcpStream> {
        let mut pool = self.pool.lock().await;
        pool.get_mut(address)?.pop().map(|entry| entry.stream)
    }

    async fn checkin(&self, address: &str, stream: TcpStream) {
        let mut pool = self.pool.lock().await;
        let idle = pool.entry(address.to_string()).or_default();
        if idle.len() < self.max_idle {
            idle.push(PoolEntry {
                stream,
                last_used: Instant::now(),
            });
        }
    }

    /// Drop connections idle for longer than `max_idle`
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.lock().await;
        let now = Instant::now();

        for (addr, idle) in pool.iter_mut() {
            let before = idle.len();
            idle.retain(|e| now.duration_since(e.last_used) <= max_idle);
            if idle.len() < before {
                tracing::debug!("Removed {} stale connection(s) to {}", before - idle.len(), addr);
            }
        }
        pool.retain(|_, idle| !idle.is_empty());
    }

    /// Number of idle pooled connections
    #[cfg(test)]
    pub(crate) async fn connection_count(&self) -> usize {
        self.pool.lock().await.values().map(Vec::len).sum()
    }
}

async fn exchange(stream: &mut TcpStream, message: &Message) -> Result<Message> {
    let (mut reader, mut writer) = stream.split();
    write_message(&mut writer, message).await?;
    read_message(&mut reader).await
}
