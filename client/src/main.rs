use clap::Parser;
use client::event_bus::Event;
use client::session::{Session, SessionConfig};
use client::transport::WebRtcTransport;
use log::{debug, error, info};
use rand::Rng;
use shared::{LinkMessage, Role, DEFAULT_TICK_RATE};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling server URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Session role: player or viewer
    #[arg(short, long, default_value = "viewer")]
    role: Role,

    /// Simulation steps per second while hosting (1-60)
    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,

    /// STUN/TURN servers for peer links (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    ice_server: Vec<String>,

    /// Ship name shown to others (players only)
    #[arg(short, long)]
    name: Option<String>,

    /// Ship color as #rrggbb (players only)
    #[arg(short, long)]
    color: Option<String>,
}

/// Fills in a random name and color for players that chose none
fn player_profile(args: &Args) -> (Option<String>, Option<String>) {
    if args.role != Role::Player {
        return (None, None);
    }

    let mut rng = rand::thread_rng();
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| format!("Player {:04}", rng.gen_range(0..10_000)));
    let color = args
        .color
        .clone()
        .unwrap_or_else(|| format!("#{:06x}", rng.gen_range(0..0x100_0000u32)));
    (Some(name), Some(color))
}

/// Logs session lifecycle events
fn register_log_handlers(session: &Session<WebRtcTransport>) {
    let bus = session.bus();

    bus.on(Event::HOST_STARTED, |_, _| {
        info!("This client is now the host");
        Ok(())
    });
    bus.on(Event::HOST_STOPPED, |_, _| {
        info!("This client is no longer the host");
        Ok(())
    });
    bus.on(Event::WAITING, |_, _| {
        info!("Waiting for a host");
        Ok(())
    });
    bus.on(Event::HOST_CHANGED, |event, _| {
        if let Event::HostChanged(Some(host)) = event {
            info!("Following host {}", host);
        }
        Ok(())
    });
    bus.on(Event::LINK_OPENED, |_, from| {
        if let Some(peer) = from {
            info!("Peer link to {} open", peer);
        }
        Ok(())
    });
    bus.on(LinkMessage::PLAYER_CONFIG, |event, from| {
        if let (Event::Link(LinkMessage::PlayerConfig(config)), Some(peer)) = (event, from) {
            info!("{} is flying as {:?}", peer, config.name);
        }
        Ok(())
    });
    bus.on(LinkMessage::STATE_TICK, |event, from| {
        if let (Event::Link(LinkMessage::StateTick(tick)), Some(host)) = (event, from) {
            debug!("Tick from {} with {} entities", host, tick.entities.len());
        }
        Ok(())
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let (name, color) = player_profile(&args);
    let config = match SessionConfig::new(&args.server, args.role, args.tick_rate, &args.ice_server)
        .and_then(|config| config.with_profile(name, color))
    {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    info!("Starting {} client...", config.role);
    info!("Connecting to: {}", config.server_url);

    let (session, inputs) = Session::connect(&config).await?;
    register_log_handlers(&session);

    session.run(inputs, config.tick_interval()).await;

    Ok(())
}
