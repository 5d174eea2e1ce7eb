//! VNC rendezvous relay (UltraVNC repeater, mode II).
//!
//! Built as a library plus a thin binary so the relay can be embedded for
//! end-to-end testing.

mod config;
mod dispatcher;
mod handshake;
mod probe;
mod registry;
mod session;
mod supervisor;

// Re-export public types
pub use config::{Cli, ConfigError, LoopMode, RelayConfig, MIN_BLOCK_LEN};
pub use dispatcher::{serve, serve_with_listeners, ListenerSet};
pub use handshake::{HandshakeError, HandshakeEvent, HandshakeSettings};
pub use registry::{Registry, SubmitOutcome};
pub use session::{splice, SessionIdGenerator};
pub use supervisor::{run, shutdown_signal, PidFile};
