//! Process lifecycle: signals, graceful shutdown, respawn, PID file.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::RelayConfig;
use crate::dispatcher::{self, ListenerSet};

const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// PID file that is removed again when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn write(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        writeln!(file, "{}", std::process::id())?;
        tracing::info!(pid = std::process::id(), file = %path.display(), "pid file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                tracing::warn!(file = %self.path.display(), %error, "failed to remove pid file");
            }
            _ => {}
        }
    }
}

/// Wait for a termination signal (SIGINT/SIGTERM, or Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

/// Run the relay until a termination signal, respawning the dispatcher
/// after crashes when loop mode asks for it. Bind failures are fatal.
pub async fn run(config: RelayConfig) -> Result<()> {
    let _pidfile = match &config.pidfile {
        Some(path) => Some(
            PidFile::write(path)
                .with_context(|| format!("failed to write pid file {}", path.display()))?,
        ),
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    loop {
        let listeners = ListenerSet::bind(&config)?;
        match dispatcher::serve_with_listeners(config.clone(), listeners, shutdown_rx.clone()).await
        {
            Ok(()) => {
                tracing::info!("relay shut down cleanly");
                return Ok(());
            }
            Err(error) if config.loop_mode.respawns() && !*shutdown_rx.borrow() => {
                tracing::error!(%error, "dispatcher failed, respawning");
                sleep(RESPAWN_BACKOFF).await;
            }
            Err(error) => return Err(error),
        }
    }
}
