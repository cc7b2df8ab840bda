use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use cachegate::{listen, FileHandler, ProxyConfig};

#[derive(Parser)]
#[command(name = "file-server")]
#[command(about = "Serves GET and stores POST bodies as files", long_about = None)]
struct Cli {
    /// Port to listen on (all interfaces)
    port: u16,

    /// Directory files are read from and written to
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Maximum number of connections handled concurrently
    #[arg(long, default_value_t = cachegate::DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cachegate=info".parse()?),
        )
        .init();

    let config = ProxyConfig::default().with_max_connections(cli.max_connections);
    let handler = FileHandler::new(cli.root, &config);
    info!("Serving files from {}", handler.root().display());

    let addr = format!(":{}", cli.port);
    tokio::select! {
        result = listen(&addr, config.max_connections, handler) => {
            if let Err(e) = result {
                error!("{}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
