use clap::Parser;
use tracing::{error, info};

use cachegate::{listen, CacheStore, ProxyConfig, ProxyHandler, MAX_RESPONSE_SIZE};

#[derive(Parser)]
#[command(name = "cachegate")]
#[command(about = "Caching HTTP forward proxy", long_about = None)]
struct Cli {
    /// Port to listen on (all interfaces)
    port: u16,

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

    info!("cachegate v{} - caching HTTP forward proxy", env!("CARGO_PKG_VERSION"));
    info!(
        "Max buffered response: {} MB",
        MAX_RESPONSE_SIZE / 1024 / 1024
    );

    let handler = ProxyHandler::new(&config, CacheStore::new());

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
