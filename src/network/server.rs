//! Network Server
//!
//! TCP server accepting framed requests from peer nodes. Every request gets
//! exactly one response from the [`MessageHandler`].

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message};
use crate::replication::Message;
use crate::error::{Error, Result};

/// Answers requests received from peers
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, peer: &str, message: Message) -> Message;
}

/// Network server for replica communication
pub struct NetworkServer {
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Bind the listener
    pub async fn bind(bind_address: &str, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            handler,
            shutdown,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle that stops `serve`
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    /// Accept connections until stopped
    pub async fn serve(&self) -> Result<()> {
        tracing::info!("Network server listening on {}", self.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&self.handler);
                            let shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, handler, shutdown).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serve requests on one connection until the peer closes it
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = tokio::select! {
            result = read_message(&mut reader) => result,
            _ = shutdown.changed() => break,
        };

        match message {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = handler.handle(peer_addr, message).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkClient;
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, _peer: &str, message: Message) -> Message {
            match message {
                Message::StatusRequest => Message::StatusResponse {
                    node_id: "echo".into(),
                    shards: Vec::new(),
                },
                other => other,
            }
        }
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let server = Arc::new(NetworkServer::bind("127.0.0.1:0", Arc::new(Echo)).await.unwrap());
        let address = server.local_addr().unwrap().to_string();
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve().await }
        });

        let client = NetworkClient::new(Duration::from_millis(500), Duration::from_millis(500));
        for _ in 0..3 {
            match client.send(&address, Message::StatusRequest).await.unwrap() {
                Message::StatusResponse { node_id, .. } => assert_eq!(node_id, "echo"),
                other => panic!("unexpected reply {}", other.type_name()),
            }
        }
        // The connection is reused between requests
        assert_eq!(client.connection_count().await, 1);

        // Only connections idle past the limit are closed
        client.cleanup_stale(Duration::from_secs(60)).await;
        assert_eq!(client.connection_count().await, 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        client.cleanup_stale(Duration::from_millis(10)).await;
        assert_eq!(client.connection_count().await, 0);

        server.stop();
        serving.await.unwrap().unwrap();
    }
}
