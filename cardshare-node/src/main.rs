// Cardshare node: serve one file to peers, or fetch one from a peer, over TCP.

mod config;
mod transport;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "cardshare", version = VERSION, about = "Peer-to-peer single file transfer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a file until interrupted
    Serve {
        file: PathBuf,
        /// Require peers to answer a challenge with this password
        #[arg(long)]
        password: Option<String>,
        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// MIME type to advertise (default: guessed from extension)
        #[arg(long)]
        mime: Option<String>,
    },
    /// Download the file served at ADDR (host:port)
    Fetch {
        addr: String,
        #[arg(long)]
        password: Option<String>,
        /// Output path (default: the name the peer advertises)
        #[arg(long, short)]
        out: Option<PathBuf>,
        /// Reconnect attempts after a failed transfer
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Serve {
                file,
                password,
                port,
                mime,
            } => {
                if let Some(p) = port {
                    cfg.port = p;
                }
                tokio::select! {
                    res = transport::run_serve(file, mime, password, cfg) => res,
                    res = shutdown_signal() => {
                        tracing::info!("shutting down");
                        res
                    }
                }
            }
            Command::Fetch {
                addr,
                password,
                out,
                retries,
            } => {
                let path = transport::run_fetch(addr, password, out, retries, cfg).await?;
                println!("{}", path.display());
                Ok(())
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
