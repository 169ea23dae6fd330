//! mcpaas - MCP-as-a-Service gateway
//!
//! An HTTP gateway that fronts arbitrary MCP servers: give it an npm or PyPI
//! package name and it spawns the package as a local child process and
//! bridges its stdio MCP session to remote clients over SSE + POST.

use clap::{Parser, Subcommand};
use mcpaas::{Config, GatewayServer, Result};
use tracing::info;

#[derive(Parser)]
#[command(name = "mcpaas")]
#[command(about = "MCP-as-a-Service gateway", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MCPAAS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Listen host
        #[arg(long, env = "MCPAAS_HOST")]
        host: Option<String>,

        /// Listen port
        #[arg(long, env = "MCPAAS_PORT")]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level);

    info!("mcpaas v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Start { host, port } => {
            let mut config = Config::from_env();
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }

            let server = GatewayServer::new(config);
            let shutdown = server.shutdown_handle();

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("received ctrl-c, shutting down");
                    let _ = shutdown.send(());
                }
            });

            server.run().await?;
        },
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}
