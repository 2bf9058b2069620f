//! RTCPilot server
//!
//! Usage:
//!   rtcpilot <config>                              Run the server
//!   rtcpilot gen-cert --cert <path> --key <path>   Write a self-signed certificate

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use rtcpilot_core::{CertStore, Config};
use rtcpilot_daemon::{logging, RtcPilotServer};

#[derive(Parser)]
#[command(name = "rtcpilot")]
#[command(about = "WebRTC relay orchestrated by a pilot center", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// YAML configuration file
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a self-signed certificate and key
    GenCert {
        /// Certificate output path
        #[arg(long, default_value = "certs/server.crt")]
        cert: PathBuf,

        /// Private key output path
        #[arg(long, default_value = "certs/server.key")]
        key: PathBuf,

        /// Subject alternative names
        #[arg(long = "name", default_value = "localhost")]
        names: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match (cli.command, cli.config) {
        (Some(Commands::GenCert { cert, key, names }), _) => {
            let generated = CertStore::generate_self_signed(names)?;
            generated.write_to(&cert, &key)?;
            let store = generated.into_store()?;
            println!("Wrote {:?} and {:?}", cert, key);
            println!("Fingerprint sha-256 {}", store.fingerprint_sdp());
            Ok(())
        }
        (None, Some(path)) => run(path).await,
        (None, None) => Err("missing configuration file argument".into()),
    }
}

async fn run(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from(&path)?;
    let _log_guard = logging::init(&config.log)?;
    info!("Starting RTCPilot with {:?}", path);

    let server = match RtcPilotServer::start(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Startup failed: {}", e);
            return Err(e.into());
        }
    };
    info!("Signaling on {}", server.signal_addr());

    signal::ctrl_c().await?;
    info!("Shutting down...");
    server.shutdown();
    Ok(())
}
