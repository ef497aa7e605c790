use anyhow::{ensure, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tftp_mux::{Server, ServerConfig};

/// Serve files over TFTP (RFC 1350) from a single UDP port.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Local address to bind.
    #[arg(short, long, default_value = "0.0.0.0:69")]
    bind: SocketAddr,

    /// Directory files are served from and uploaded to.
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Milliseconds to wait for a reply before resending.
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Resends before an unresponsive client's transfer is dropped.
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// Longest single wait on the socket, in milliseconds.
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,

    /// Refuse all write requests.
    #[arg(long)]
    read_only: bool,

    /// Refuse write requests for files that already exist.
    #[arg(long)]
    no_overwrite: bool,

    /// Maximum number of concurrent transfers.
    #[arg(long, default_value_t = 1024)]
    max_sessions: usize,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            root: self.root,
            timeout: Duration::from_millis(self.timeout_ms),
            max_retries: self.retries,
            poll_interval: Duration::from_millis(self.poll_ms),
            allow_writes: !self.read_only,
            allow_overwrite: !self.no_overwrite,
            max_sessions: self.max_sessions,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    ensure!(config.root.is_dir(), "root {:?} is not a directory", config.root);
    ensure!(!config.poll_interval.is_zero(), "poll interval must be positive");

    let server = Server::bind(&config).with_context(|| format!("failed to bind {}", config.bind))?;
    log::info!(
        "Listening on {} serving {:?} (timeout {:?}, {} retries{})",
        server.local_addr()?,
        config.root,
        config.timeout,
        config.max_retries,
        if config.allow_writes { "" } else { ", read-only" },
    );

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Unable to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
