//! Listener ownership, accept loops, and rendezvous routing.
//!
//! Accepted sockets run their greeting exchange in per-connection tasks;
//! rendezvous results are marshaled back over a channel so the dispatcher
//! task is the only writer of the registry. Direct-dial connections never
//! touch the registry and are handled entirely in their own task.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, MissedTickBehavior};

use repeater_protocol::{Intent, Role};

use crate::config::RelayConfig;
use crate::handshake::{self, HandshakeSettings};
use crate::registry::{Registry, SubmitOutcome};
use crate::session::{self, SessionIdGenerator};

const ACCEPT_BACKLOG: u32 = 1024;

/// Pause after a failed accept so a persistent error cannot spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Deadline covering resolution and every connect attempt of a direct dial.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A rendezvous half-connection on its way to the registry.
#[derive(Debug)]
struct RendezvousRequest {
    role: Role,
    id: String,
    stream: TcpStream,
    peer_addr: SocketAddr,
}

/// The bound acceptors for both relay ports.
pub struct ListenerSet {
    pub client: Vec<TcpListener>,
    pub server: Vec<TcpListener>,
}

impl ListenerSet {
    /// Bind the client and server ports on every available address family.
    pub fn bind(config: &RelayConfig) -> Result<Self> {
        Ok(Self {
            client: bind_port(config.client_port, Role::Client)?,
            server: bind_port(config.server_port, Role::Server)?,
        })
    }

    /// Wrap pre-bound listeners (tests bind ephemeral ports themselves).
    pub fn from_listeners(client: TcpListener, server: TcpListener) -> Self {
        Self {
            client: vec![client],
            server: vec![server],
        }
    }
}

fn bind_port(port: u16, role: Role) -> Result<Vec<TcpListener>> {
    let mut listeners = Vec::new();
    for addr in [
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
    ] {
        match bind_family(addr) {
            Ok(listener) => {
                tracing::info!(%role, %addr, "listening");
                listeners.push(listener);
            }
            Err(e) => {
                tracing::warn!(%role, %addr, error = %e, "could not bind address family");
            }
        }
    }
    if listeners.is_empty() {
        bail!("could not bind {role} port {port} on any address family");
    }
    Ok(listeners)
}

fn bind_family(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    // Keep the v6 socket v6-only so it can coexist with the v4 one.
    #[cfg(unix)]
    if addr.is_ipv6() {
        socket2::SockRef::from(&socket).set_only_v6(true)?;
    }
    socket.bind(addr)?;
    socket.listen(ACCEPT_BACKLOG)
}

/// Bind the configured ports and run the relay until shutdown.
pub async fn serve(config: RelayConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let listeners = ListenerSet::bind(&config)?;
    serve_with_listeners(config, listeners, shutdown).await
}

/// Run the relay on pre-bound listeners until shutdown is signaled.
pub async fn serve_with_listeners(
    config: RelayConfig,
    listeners: ListenerSet,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::channel::<RendezvousRequest>(32);
    let sessions = SessionIdGenerator::new();

    let mut acceptors = Vec::new();
    for (listeners, role) in [
        (listeners.client, Role::Client),
        (listeners.server, Role::Server),
    ] {
        let settings = HandshakeSettings {
            block_len: config.block_len,
            send_banner: role == Role::Client && config.send_banner,
            deadline: config.init_timeout,
        };
        for listener in listeners {
            acceptors.push(tokio::spawn(accept_loop(
                listener,
                role,
                settings,
                events_tx.clone(),
                sessions.clone(),
            )));
        }
    }
    drop(events_tx);

    let mut registry = Registry::new(config.refuse);
    let mut sweep = tokio::time::interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        if *shutdown.borrow() {
            break Ok(());
        }
        tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            request = events_rx.recv() => match request {
                Some(request) => handle_request(&mut registry, request, &sessions),
                None => break Err(anyhow::anyhow!("all accept loops stopped")),
            },
            _ = sweep.tick(), if config.clean => {
                registry.sweep();
            }
        }
    };

    for acceptor in &acceptors {
        acceptor.abort();
    }
    let drained = registry.drain();
    if drained > 0 {
        tracing::info!(count = drained, "closed parked connections on shutdown");
    }
    result
}

/// Route one completed rendezvous handshake through the registry.
fn handle_request(
    registry: &mut Registry,
    request: RendezvousRequest,
    sessions: &Arc<SessionIdGenerator>,
) {
    match registry.submit(request.role, &request.id, request.stream, request.peer_addr) {
        SubmitOutcome::Paired { client, server } => {
            let session = sessions.next();
            tracing::info!(session, id = %request.id, "starting spliced session");
            tokio::spawn(session::splice(session, client, server));
        }
        // Parked, refused, and replaced are logged by the registry.
        SubmitOutcome::Parked | SubmitOutcome::Refused | SubmitOutcome::Replaced => {}
    }
}

async fn accept_loop(
    listener: TcpListener,
    role: Role,
    settings: HandshakeSettings,
    events_tx: mpsc::Sender<RendezvousRequest>,
    sessions: Arc<SessionIdGenerator>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tracing::debug!(%role, peer = %peer_addr, "accepted connection");
                let events_tx = events_tx.clone();
                let sessions = sessions.clone();
                tokio::spawn(handle_connection(
                    stream, role, peer_addr, settings, events_tx, sessions,
                ));
            }
            Err(e) => {
                tracing::warn!(%role, error = %e, "accept failed");
                sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    role: Role,
    peer_addr: SocketAddr,
    settings: HandshakeSettings,
    events_tx: mpsc::Sender<RendezvousRequest>,
    sessions: Arc<SessionIdGenerator>,
) {
    let event = match handshake::read_greeting(stream, role, peer_addr, settings).await {
        Ok(event) => event,
        Err(e) => {
            tracing::info!(%role, peer = %peer_addr, error = %e, "closing connection");
            return;
        }
    };

    match event.intent {
        Intent::Rendezvous { id } => {
            // If the dispatcher is gone the request is dropped, which
            // closes the socket.
            let _ = events_tx
                .send(RendezvousRequest {
                    role,
                    id,
                    stream: event.stream,
                    peer_addr,
                })
                .await;
        }
        Intent::Direct { host, port } => {
            direct_dial(event.stream, peer_addr, &host, port, &sessions).await;
        }
    }
}

/// Dial a viewer-supplied target and splice the two connections.
async fn direct_dial(
    client: TcpStream,
    peer_addr: SocketAddr,
    host: &str,
    port: u16,
    sessions: &Arc<SessionIdGenerator>,
) {
    let target = match timeout(DIAL_TIMEOUT, connect_preferring_v4(host, port)).await {
        Err(_) => {
            tracing::info!(peer = %peer_addr, host, port, "direct dial timed out");
            return;
        }
        Ok(Err(e)) => {
            tracing::info!(peer = %peer_addr, host, port, error = %e, "direct dial failed");
            return;
        }
        Ok(Ok(target)) => target,
    };

    let session = sessions.next();
    tracing::info!(session, peer = %peer_addr, host, port, "direct connection established");
    session::splice(session, client, target).await;
}

/// Connect to a resolved target, trying IPv4 addresses before IPv6.
async fn connect_preferring_v4(host: &str, port: u16) -> std::io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();

    let (v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
        addrs.into_iter().partition(SocketAddr::is_ipv4);

    let mut last_error = None;
    for addr in v4.into_iter().chain(v6) {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "target resolved to no addresses")
    }))
}
