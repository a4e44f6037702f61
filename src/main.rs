use std::path::PathBuf;

use clap::{Parser, Subcommand};

use grpc_downgrade::config::{load_config, BridgeConfig};
use grpc_downgrade::lifecycle::{run_client_proxy, shutdown_signal, Shutdown};
use grpc_downgrade::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "grpc-downgrade", version, about = "gRPC ⇄ HTTP/1.1 downgrade bridge")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the client downgrade proxy on a local port.
    ClientProxy,
    /// Load and validate the configuration, then print a summary.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BridgeConfig::default(),
    };

    match cli.command {
        Command::CheckConfig => {
            print_summary(&config);
            Ok(())
        }
        Command::ClientProxy => {
            logging::init_logging(&config.observability);
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "grpc-downgrade starting");

            if config.observability.metrics_enabled {
                match config.observability.metrics_address.parse() {
                    Ok(addr) => metrics::init_metrics(addr),
                    Err(_) => tracing::error!(
                        metrics_address = %config.observability.metrics_address,
                        "Failed to parse metrics address"
                    ),
                }
            }

            let shutdown = Shutdown::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    shutdown_signal().await;
                    shutdown.trigger();
                }
            });

            run_client_proxy(&config, shutdown).await?;
            tracing::info!("Shutdown complete");
            Ok(())
        }
    }
}

fn print_summary(config: &BridgeConfig) {
    println!("configuration OK");
    println!("  client.endpoint           {}", config.client.endpoint);
    println!("  client.local_bind_address {}", config.client.local_bind_address);
    println!("  client.tls                {}", config.client.tls.enabled);
    println!("  server.bind_address       {}", config.server.bind_address);
    println!("  server.tls                {}", config.server.tls.is_some());
    println!("  alpn.pure_grpc_token      {}", config.alpn.pure_grpc_token);
    println!("  codec.max_frame_bytes     {}", config.codec.max_frame_bytes);
}
