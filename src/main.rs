use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use lanspeed::client::{RoundParams, SpeedTestClient};
use lanspeed::config::Config;
use lanspeed::server::SpeedTestServer;
use lanspeed::stats::ConsoleReporter;

#[derive(Parser)]
#[command(
    name = "lanspeed",
    about = "LAN speed-test server and client with UDP broadcast discovery",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (otherwise LANSPEED_CONFIG or
    /// /etc/lanspeed/lanspeed.toml, falling back to built-in defaults)
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast offers and serve TCP/UDP transfers until interrupted
    Serve,

    /// Run transfer rounds against the first discovered server
    Run {
        /// Bytes to transfer per connection
        #[arg(long)]
        file_size: u64,

        /// Number of parallel TCP connections per round
        #[arg(long, default_value = "1")]
        tcp: u32,

        /// Number of parallel UDP transfers per round
        #[arg(long, default_value = "1")]
        udp: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Serve => {
            tracing::info!("starting speed-test server");
            let server = SpeedTestServer::bind(config).await?;
            server.run(cancel).await?;
        }
        Commands::Run {
            file_size,
            tcp,
            udp,
        } => {
            let params = RoundParams::new(file_size, tcp, udp)?;
            tracing::info!(file_size, tcp, udp, "starting speed-test client");
            let mut client = SpeedTestClient::new(config, params);
            client.run(&ConsoleReporter, cancel).await?;
        }
    }

    Ok(())
}
