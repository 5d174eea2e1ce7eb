//! The rendezvous table: id → parked half-connection.
//!
//! Owned exclusively by the dispatcher task, so every decision about an id
//! is serialized; there are no locks to take and no partial states to
//! observe. Parked sockets are closed by dropping them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::TcpStream;

use repeater_protocol::Role;

use crate::probe;

/// A half-connection waiting for its counterpart.
#[derive(Debug)]
struct Parked {
    stream: TcpStream,
    role: Role,
    peer_addr: SocketAddr,
    parked_at: Instant,
}

/// What `submit` did with a half-connection.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Parked under its id, waiting for the matching role.
    Parked,
    /// Refuse mode is on and a live same-role entry already holds the id;
    /// the new socket was closed.
    Refused,
    /// A live same-role entry held the id; it was closed and the new
    /// arrival took its place.
    Replaced,
    /// The counterpart was waiting. Both sockets have left the table and
    /// belong to the caller.
    Paired {
        client: TcpStream,
        server: TcpStream,
    },
}

pub struct Registry {
    parked: HashMap<String, Parked>,
    refuse: bool,
}

impl Registry {
    pub fn new(refuse: bool) -> Self {
        Self {
            parked: HashMap::new(),
            refuse,
        }
    }

    /// Place or pair a half-connection under `id`.
    pub fn submit(
        &mut self,
        role: Role,
        id: &str,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> SubmitOutcome {
        match self.parked.remove(id) {
            Some(existing) if existing.role == role => {
                if !probe::is_alive(&existing.stream) {
                    tracing::info!(
                        %id, %role,
                        peer = %existing.peer_addr,
                        parked_secs = existing.parked_at.elapsed().as_secs(),
                        "evicting dead parked connection"
                    );
                    self.park(role, id, stream, peer_addr);
                    return SubmitOutcome::Parked;
                }
                if self.refuse {
                    tracing::info!(%id, %role, peer = %peer_addr, "refusing extra connection for occupied id");
                    self.parked.insert(id.to_string(), existing);
                    return SubmitOutcome::Refused;
                }
                tracing::info!(
                    %id, %role,
                    old_peer = %existing.peer_addr,
                    new_peer = %peer_addr,
                    "replacing parked connection"
                );
                self.park(role, id, stream, peer_addr);
                SubmitOutcome::Replaced
            }
            Some(counterpart) => {
                tracing::info!(
                    %id,
                    parked_peer = %counterpart.peer_addr,
                    new_peer = %peer_addr,
                    waited_secs = counterpart.parked_at.elapsed().as_secs(),
                    "rendezvous complete"
                );
                let (client, server) = match role {
                    Role::Client => (stream, counterpart.stream),
                    Role::Server => (counterpart.stream, stream),
                };
                SubmitOutcome::Paired { client, server }
            }
            None => {
                self.park(role, id, stream, peer_addr);
                SubmitOutcome::Parked
            }
        }
    }

    fn park(&mut self, role: Role, id: &str, stream: TcpStream, peer_addr: SocketAddr) {
        tracing::info!(%id, %role, peer = %peer_addr, "parked, waiting for counterpart");
        self.parked.insert(
            id.to_string(),
            Parked {
                stream,
                role,
                peer_addr,
                parked_at: Instant::now(),
            },
        );
    }

    /// Evict parked entries whose peer has gone away. Returns how many.
    pub fn sweep(&mut self) -> usize {
        let dead: Vec<String> = self
            .parked
            .iter()
            .filter(|(_, entry)| !probe::is_alive(&entry.stream))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &dead {
            if let Some(entry) = self.parked.remove(id) {
                tracing::info!(
                    %id,
                    role = %entry.role,
                    peer = %entry.peer_addr,
                    parked_secs = entry.parked_at.elapsed().as_secs(),
                    "swept dead parked connection"
                );
            }
        }
        dead.len()
    }

    /// Close every parked socket. Returns how many were dropped.
    pub fn drain(&mut self) -> usize {
        let count = self.parked.len();
        for (id, entry) in self.parked.drain() {
            tracing::info!(%id, role = %entry.role, peer = %entry.peer_addr, "closing parked connection");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}
