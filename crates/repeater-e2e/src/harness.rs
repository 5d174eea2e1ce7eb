//! In-process relay harness for end-to-end tests.
//!
//! Binds both relay ports on ephemeral loopback addresses and runs the
//! dispatcher in a background task, with a shutdown channel wired the way
//! the supervisor would wire it.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;

use repeater_server::{serve_with_listeners, ListenerSet, RelayConfig};

/// A running relay instance on ephemeral ports.
pub struct TestRelay {
    /// Viewer-side listen address.
    pub client_addr: SocketAddr,
    /// Server-side listen address.
    pub server_addr: SocketAddr,
    /// The configuration the relay is running with.
    pub config: RelayConfig,
    shutdown_tx: Option<watch::Sender<bool>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestRelay {
    /// Start a relay with default configuration.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start a relay, letting the caller adjust the configuration first.
    pub async fn start_with(customize: impl FnOnce(&mut RelayConfig)) -> Self {
        let mut config = RelayConfig::default();
        customize(&mut config);

        let client_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind client port");
        let server_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind server port");

        let client_addr = client_listener.local_addr().unwrap();
        let server_addr = server_listener.local_addr().unwrap();
        let listeners = ListenerSet::from_listeners(client_listener, server_listener);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_config = config.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = serve_with_listeners(run_config, listeners, shutdown_rx).await {
                tracing::error!("relay error: {}", e);
            }
        });

        // Give the accept loops a moment to start
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        Self {
            client_addr,
            server_addr,
            config,
            shutdown_tx: Some(shutdown_tx),
            _handle: handle,
        }
    }

    /// Signal the relay to shut down.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}
