use std::fmt;

use thiserror::Error;

/// Banner written to viewers before their greeting block is read.
pub const RFB_BANNER: &[u8; 12] = b"RFB 000.000\n";

/// Default size of the greeting block, in bytes.
pub const DEFAULT_BLOCK_LEN: usize = 250;

/// Default listen port for the viewer side.
pub const DEFAULT_CLIENT_PORT: u16 = 5900;

/// Default listen port for the server side.
pub const DEFAULT_SERVER_PORT: u16 = 5500;

/// Ports below this are treated as display numbers and offset onto 5900.
const DISPLAY_PORT_CUTOFF: i32 = 200;

/// Which listener a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A VNC viewer, connecting on the client port.
    Client,
    /// A VNC server, connecting on the server port.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// What a peer asked for in its greeting block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Park under an id and wait for the matching peer.
    Rendezvous { id: String },
    /// Viewer named an outbound target; the relay dials it directly.
    Direct { host: String, port: u16 },
}

/// Errors produced while classifying a greeting block.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GreetingError {
    /// `ID:` prefix with no word characters after it.
    #[error("empty id after ID: prefix")]
    EmptyId,
    /// Server-side connection without an `ID:` tag.
    #[error("server greeting missing ID: tag")]
    MissingId,
    /// Direct target was empty once padding was stripped.
    #[error("empty direct-dial target")]
    EmptyTarget,
    /// Direct target was not valid UTF-8.
    #[error("direct-dial target is not valid text")]
    TargetNotText,
    /// Port did not parse, or fell outside the valid range after normalization.
    #[error("bad port in direct-dial target: {0:?}")]
    BadPort(String),
}

/// Classify a greeting block for a connection with the given role.
///
/// The block begins with `ID:<word>` for a rendezvous, or (viewers only) a
/// `host[:port]` target; either form may be padded to the block size with
/// NULs or whitespace, which is ignored.
pub fn classify(role: Role, block: &[u8]) -> Result<Intent, GreetingError> {
    if let Some(rest) = block.strip_prefix(b"ID:") {
        let id = word_run(rest);
        if id.is_empty() {
            return Err(GreetingError::EmptyId);
        }
        return Ok(Intent::Rendezvous { id });
    }

    match role {
        Role::Server => Err(GreetingError::MissingId),
        Role::Client => parse_target(block),
    }
}

/// Maximal leading run of `[A-Za-z0-9_]` bytes, as a string.
fn word_run(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .map(|b| *b as char)
        .collect()
}

fn parse_target(block: &[u8]) -> Result<Intent, GreetingError> {
    let end = block
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0);
    let trimmed = &block[..end];
    if trimmed.is_empty() {
        return Err(GreetingError::EmptyTarget);
    }

    let text = std::str::from_utf8(trimmed).map_err(|_| GreetingError::TargetNotText)?;

    let (host, port) = match text.split_once(':') {
        None => (text, DEFAULT_CLIENT_PORT),
        Some((host, port_text)) => {
            let raw: i32 = port_text
                .parse()
                .map_err(|_| GreetingError::BadPort(port_text.to_string()))?;
            (host, normalize_port(raw).ok_or_else(|| GreetingError::BadPort(port_text.to_string()))?)
        }
    };

    if host.is_empty() {
        return Err(GreetingError::EmptyTarget);
    }

    Ok(Intent::Direct {
        host: host.to_string(),
        port,
    })
}

/// Port normalization for direct targets: negative values are absolute port
/// numbers, small values are VNC display numbers offset onto 5900.
fn normalize_port(raw: i32) -> Option<u16> {
    let port = if raw < 0 {
        -raw
    } else if raw < DISPLAY_PORT_CUTOFF {
        raw + i32::from(DEFAULT_CLIENT_PORT)
    } else {
        raw
    };
    u16::try_from(port).ok()
}
