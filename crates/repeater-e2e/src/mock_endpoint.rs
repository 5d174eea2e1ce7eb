//! Mock TCP endpoint for direct-dial tests.
//!
//! Can echo data back, send a fixed response, and records what each
//! connection delivered.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Behavior mode for the mock endpoint
#[derive(Clone, Debug)]
pub enum EndpointMode {
    /// Echo back all received data
    Echo,
    /// Send a fixed response for each connection, then close
    FixedResponse(Vec<u8>),
}

/// A recorded connection
#[derive(Clone, Debug)]
pub struct RecordedConnection {
    /// All data received on this connection
    pub received_data: Vec<u8>,
    /// Peer address
    pub peer_addr: SocketAddr,
}

/// A mock TCP endpoint for testing
pub struct MockEndpoint {
    addr: SocketAddr,
    /// Recorded connections
    connections: Arc<RwLock<Vec<RecordedConnection>>>,
    /// Shutdown channel
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl MockEndpoint {
    /// Start a mock endpoint on an ephemeral port in echo mode
    pub async fn start() -> Self {
        Self::start_with_mode(EndpointMode::Echo).await
    }

    /// Start a mock endpoint with a specific mode
    pub async fn start_with_mode(mode: EndpointMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock endpoint");
        let addr = listener.local_addr().unwrap();

        let connections: Arc<RwLock<Vec<RecordedConnection>>> = Arc::new(RwLock::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let connections_clone = connections.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Mock endpoint shutting down");
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let connections = connections_clone.clone();
                                let mode = mode.clone();
                                tokio::spawn(async move {
                                    handle_connection(stream, peer_addr, connections, mode).await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Mock endpoint accept error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the address this endpoint is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the address as a string
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Get all recorded connections
    pub fn get_connections(&self) -> Vec<RecordedConnection> {
        self.connections.read().clone()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Shutdown the endpoint
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    connections: Arc<RwLock<Vec<RecordedConnection>>>,
    mode: EndpointMode,
) {
    let mut received_data = Vec::new();
    let mut buf = [0u8; 4096];

    match mode {
        EndpointMode::Echo => {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        received_data.extend_from_slice(&buf[..n]);
                        if let Err(e) = stream.write_all(&buf[..n]).await {
                            tracing::error!("Echo write error: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Echo read error: {}", e);
                        break;
                    }
                }
            }
        }
        EndpointMode::FixedResponse(response) => {
            // Read some data first
            match stream.read(&mut buf).await {
                Ok(n) if n > 0 => {
                    received_data.extend_from_slice(&buf[..n]);
                }
                _ => {}
            }

            if let Err(e) = stream.write_all(&response).await {
                tracing::error!("Fixed response write error: {}", e);
            }
        }
    }

    connections.write().push(RecordedConnection {
        received_data,
        peer_addr,
    });
}
