//! Best-effort liveness probe for parked connections.
//!
//! On Linux the kernel's TCP state table is consulted; everywhere else, and
//! on any lookup failure, the peer is assumed alive. A false "alive" only
//! delays eviction; a false "dead" would tear down a working rendezvous.

use tokio::net::TcpStream;

/// `true` iff the socket's peer is believed to still be connected.
pub fn is_alive(stream: &TcpStream) -> bool {
    match established(stream) {
        Some(alive) => alive,
        None => {
            tracing::debug!("liveness lookup unavailable, assuming alive");
            true
        }
    }
}

#[cfg(target_os = "linux")]
fn established(stream: &TcpStream) -> Option<bool> {
    use std::os::fd::AsRawFd;

    // /proc/net/tcp[6] state column: 01 = ESTABLISHED.
    const TCP_ESTABLISHED: &str = "01";

    let fd = stream.as_raw_fd();
    let link = std::fs::read_link(format!("/proc/self/fd/{fd}")).ok()?;
    let link = link.to_str()?;
    let inode = link.strip_prefix("socket:[")?.strip_suffix(']')?;

    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let contents = match std::fs::read_to_string(table) {
            Ok(contents) => contents,
            Err(_) => continue,
        };
        for line in contents.lines().skip(1) {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 10 {
                continue;
            }
            if columns[9] == inode {
                return Some(columns[3] == TCP_ESTABLISHED);
            }
        }
    }

    None
}

#[cfg(not(target_os = "linux"))]
fn established(_stream: &TcpStream) -> Option<bool> {
    None
}
