use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::SignalingServer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "SIGNAL_PORT", default_value = "8080")]
    port: u16,

    /// Origins allowed to open signaling connections (comma separated, `*` for any)
    #[arg(
        short = 'o',
        long,
        env = "SIGNAL_ALLOWED_ORIGINS",
        value_delimiter = ',',
        required = true
    )]
    allowed_origins: Vec<String>,

    /// Maximum number of connected peers
    #[arg(short, long, default_value = "32")]
    max_peers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let config = match ServerConfig::new(
        &args.host,
        args.port,
        &args.allowed_origins,
        args.max_peers,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    let server = match SignalingServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
