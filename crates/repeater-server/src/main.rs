use std::fs::OpenOptions;
use std::process::exit;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use repeater_server::{Cli, LoopMode, RelayConfig};

fn main() {
    let config = match Cli::parse().resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("repeater-server: {e}");
            exit(2);
        }
    };

    // Detach before the runtime exists; forking afterwards would leave the
    // worker threads behind in the parent.
    if config.loop_mode == LoopMode::Background {
        if let Err(e) = detach() {
            eprintln!("repeater-server: failed to detach: {e}");
            exit(1);
        }
    }

    if let Err(e) = init_logging(&config) {
        eprintln!("repeater-server: {e}");
        exit(1);
    }

    tracing::info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        "starting repeater"
    );
    tracing::info!(
        client_port = config.client_port,
        server_port = config.server_port,
        block_len = config.block_len,
        refuse = config.refuse,
        clean = config.clean,
        banner = config.send_banner,
        "configuration"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("repeater-server: failed to start runtime: {e}");
            exit(1);
        }
    };

    if let Err(error) = runtime.block_on(repeater_server::run(config)) {
        tracing::error!(%error, "relay failed");
        exit(1);
    }
}

fn init_logging(config: &RelayConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("repeater_server=info".parse().context("bad log directive")?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_writer(Mutex::new(file)).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}

#[cfg(unix)]
fn detach() -> Result<()> {
    use daemonize_me::Daemon;

    Daemon::new()
        .work_dir(".")
        .start()
        .map_err(|e| anyhow::anyhow!("{e}"))
}

#[cfg(not(unix))]
fn detach() -> Result<()> {
    anyhow::bail!("background mode (-L BG) is only supported on unix")
}
