//! Relay configuration with environment variable fallback.
//!
//! Every knob resolves in this order (first found wins):
//! 1. Command-line flag
//! 2. Environment variable (`ULTRAVNC_REPEATER_*`)
//! 3. Default value

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use repeater_protocol::{DEFAULT_BLOCK_LEN, DEFAULT_CLIENT_PORT, DEFAULT_SERVER_PORT};

/// Environment variable prefix.
const ENV_PREFIX: &str = "ULTRAVNC_REPEATER";

/// Smallest usable greeting block: must at least hold `ID:x`.
pub const MIN_BLOCK_LEN: usize = 4;

/// Default handshake read deadline, in seconds.
const DEFAULT_INIT_TIMEOUT_SECS: u64 = 5;

/// Default ceiling on the sweep interval, in seconds.
const DEFAULT_SELECT_TIMEOUT_SECS: u64 = 15;

#[derive(Parser, Debug)]
#[command(name = "repeater-server", version)]
#[command(about = "TCP rendezvous relay for VNC viewers and servers (UltraVNC repeater, mode II)")]
pub struct Cli {
    /// Viewer-side listen port
    #[arg(short = 'c', value_name = "PORT")]
    client_port: Option<u16>,

    /// Server-side listen port
    #[arg(short = 's', value_name = "PORT")]
    server_port: Option<u16>,

    /// Greeting block size in bytes
    #[arg(short = 'b', value_name = "BYTES")]
    block_len: Option<usize>,

    /// Refuse (1) instead of replace (0) a same-role arrival on an occupied id
    #[arg(short = 'r', value_name = "0|1", num_args = 0..=1, default_missing_value = "1")]
    refuse: Option<u8>,

    /// Periodically evict parked connections whose peer has gone away
    #[arg(short = 'C', value_name = "0|1", num_args = 0..=1, default_missing_value = "1")]
    clean: Option<u8>,

    /// Suppress the RFB banner normally sent to viewers
    #[arg(short = 'R', value_name = "0|1", num_args = 0..=1, default_missing_value = "1")]
    no_rfb: Option<u8>,

    /// Respawn the relay after a crash (1), optionally detaching first (BG)
    #[arg(short = 'L', value_name = "1|BG")]
    loop_mode: Option<String>,

    /// Append log output to FILE instead of stderr
    #[arg(short = 'l', value_name = "FILE")]
    logfile: Option<PathBuf>,

    /// Write the relay's PID to FILE, removed on exit
    #[arg(short = 'p', value_name = "FILE")]
    pidfile: Option<PathBuf>,
}

/// Process lifecycle requested via `-L`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Run once; exit when the dispatcher exits.
    #[default]
    Off,
    /// Respawn the dispatcher after a non-normal exit, with backoff.
    Respawn,
    /// Detach from the terminal, then behave as `Respawn`.
    Background,
}

impl LoopMode {
    pub fn respawns(self) -> bool {
        !matches!(self, LoopMode::Off)
    }
}

/// Fully resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub client_port: u16,
    pub server_port: u16,
    pub block_len: usize,
    /// Refuse-vs-replace policy for same-role conflicts.
    pub refuse: bool,
    /// Whether the periodic liveness sweep runs.
    pub clean: bool,
    /// Whether viewers are greeted with the RFB banner.
    pub send_banner: bool,
    pub loop_mode: LoopMode,
    pub logfile: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    /// Deadline for reading a greeting block.
    pub init_timeout: Duration,
    /// Period of the liveness sweep.
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            client_port: DEFAULT_CLIENT_PORT,
            server_port: DEFAULT_SERVER_PORT,
            block_len: DEFAULT_BLOCK_LEN,
            refuse: false,
            clean: true,
            send_banner: true,
            loop_mode: LoopMode::Off,
            logfile: None,
            pidfile: None,
            init_timeout: Duration::from_secs(DEFAULT_INIT_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SELECT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("greeting block size must be at least {MIN_BLOCK_LEN} bytes (got {0})")]
    BlockTooSmall(usize),
    #[error("invalid -L mode {0:?} (expected 1 or BG)")]
    LoopMode(String),
}

/// Environment variable with the relay prefix.
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

fn get_env_u16(name: &str) -> Option<u16> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_usize(name: &str) -> Option<usize> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_secs(name: &str) -> Option<Duration> {
    get_env(name)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| v.trim() != "0" && !v.trim().is_empty())
}

fn parse_loop_mode(value: &str) -> Result<LoopMode, ConfigError> {
    match value.trim() {
        "1" => Ok(LoopMode::Respawn),
        "BG" | "bg" => Ok(LoopMode::Background),
        other => Err(ConfigError::LoopMode(other.to_string())),
    }
}

impl Cli {
    /// Resolve flags against the environment into a [`RelayConfig`].
    pub fn resolve(self) -> Result<RelayConfig, ConfigError> {
        let defaults = RelayConfig::default();

        let block_len = self
            .block_len
            .or_else(|| get_env_usize("BUFSIZE"))
            .unwrap_or(defaults.block_len);
        if block_len < MIN_BLOCK_LEN {
            return Err(ConfigError::BlockTooSmall(block_len));
        }

        let loop_mode = match self.loop_mode.or_else(|| get_env("LOOP")) {
            Some(value) => parse_loop_mode(&value)?,
            None => LoopMode::Off,
        };

        Ok(RelayConfig {
            client_port: self
                .client_port
                .or_else(|| get_env_u16("CLIENT_PORT"))
                .unwrap_or(defaults.client_port),
            server_port: self
                .server_port
                .or_else(|| get_env_u16("SERVER_PORT"))
                .unwrap_or(defaults.server_port),
            block_len,
            refuse: self
                .refuse
                .map(|v| v != 0)
                .or_else(|| get_env_bool("REFUSE"))
                .unwrap_or(defaults.refuse),
            clean: self
                .clean
                .map(|v| v != 0)
                .or_else(|| get_env_bool("CLEAN"))
                .unwrap_or(defaults.clean),
            send_banner: !self
                .no_rfb
                .map(|v| v != 0)
                .or_else(|| get_env_bool("NO_RFB"))
                .unwrap_or(false),
            loop_mode,
            logfile: self.logfile.or_else(|| get_env("LOGFILE").map(PathBuf::from)),
            pidfile: self.pidfile.or_else(|| get_env("PIDFILE").map(PathBuf::from)),
            init_timeout: get_env_secs("INIT_TIMEOUT").unwrap_or(defaults.init_timeout),
            sweep_interval: get_env_secs("SELECT_TIMEOUT").unwrap_or(defaults.sweep_interval),
        })
    }
}
