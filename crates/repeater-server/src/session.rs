//! Byte-transparent splicing of a paired session.
//!
//! Each session runs two copy tasks, one per direction. A clean EOF on one
//! direction half-closes the far side and lets the opposite direction keep
//! draining; once the first direction ends, the survivor gets a bounded
//! grace before the session is torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const READ_BUF_LEN: usize = 8 * 1024;

/// Settle time after the first direction ends, letting final bytes drain.
const EOF_SETTLE: Duration = Duration::from_millis(250);

/// How long the surviving direction may keep running before it is aborted.
const TEARDOWN_CONFIRM: Duration = Duration::from_millis(900);

/// Monotonic session numbers, for log correlation only.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    counter: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicU64::new(1),
        })
    }

    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Copy bytes between a paired client and server until both directions end,
/// then close both sockets.
pub async fn splice(session: u64, client: TcpStream, server: TcpStream) {
    let (client_read, client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();

    let to_server = Arc::new(AtomicU64::new(0));
    let to_client = Arc::new(AtomicU64::new(0));

    let mut c2s = tokio::spawn(pump(session, client_read, server_write, to_server.clone()));
    let mut s2c = tokio::spawn(pump(session, server_read, client_write, to_client.clone()));

    // Wait for the first direction to finish, then give the other a short
    // grace to drain before forcing teardown.
    let c2s_finished_first = tokio::select! {
        _ = &mut c2s => true,
        _ = &mut s2c => false,
    };
    let survivor = if c2s_finished_first { &mut s2c } else { &mut c2s };

    sleep(EOF_SETTLE).await;
    if timeout(TEARDOWN_CONFIRM, &mut *survivor).await.is_err() {
        survivor.abort();
        let _ = (&mut *survivor).await;
    }

    tracing::info!(
        session,
        client_to_server = to_server.load(Ordering::Relaxed),
        server_to_client = to_client.load(Ordering::Relaxed),
        "session closed"
    );
}

/// One direction: read chunks and write them through until EOF or error.
async fn pump(
    session: u64,
    mut from: OwnedReadHalf,
    mut to: OwnedWriteHalf,
    copied: Arc<AtomicU64>,
) {
    let mut buf = [0u8; READ_BUF_LEN];
    loop {
        match from.read(&mut buf).await {
            Ok(0) => {
                // Propagate the half-close so the far side sees EOF after
                // any bytes still in flight.
                let _ = to.shutdown().await;
                return;
            }
            Ok(n) => {
                if let Err(e) = to.write_all(&buf[..n]).await {
                    tracing::debug!(session, error = %e, "write side ended");
                    return;
                }
                copied.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(session, error = %e, "read side ended");
                return;
            }
        }
    }
}
