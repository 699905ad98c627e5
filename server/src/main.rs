use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use tidings_server::config::{generate_config_template, Cli, Config};
use tidings_server::hub::Hub;
use tidings_server::lookup::InMemoryMembership;
use tidings_server::relay::{MemoryBus, MessageBus, RedisBus};
use tidings_server::ws::{InboundMessage, RateLimitedInbound};
use tidings_server::{routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load(&cli)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tidings_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Tidings server v{} starting", env!("CARGO_PKG_VERSION"));

    if config.jwt_secret.is_empty() {
        return Err("jwt_secret must be set (config file, TIDINGS_JWT_SECRET or --jwt-secret)".into());
    }

    let bus: Arc<dyn MessageBus> = match &config.redis_url {
        Some(url) => Arc::new(RedisBus::connect(url).await?),
        None => {
            tracing::info!("No redis_url configured, running standalone with an in-process bus");
            Arc::new(MemoryBus::new())
        }
    };

    // Placeholder collaborators. Nothing fills this store and no
    // NotificationEventHandler runs, so connections start with no topics and
    // only user-addressed traffic reaches them. A deployment plugs its
    // authoritative MembershipLookup (and a ReadModel plus a DomainEvent
    // source for NotificationEventHandler::run) in here.
    let membership = Arc::new(InMemoryMembership::new());

    // Client frames that pass the per-user limiter end up here
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
    tokio::spawn(async move {
        while let Some(msg) = inbound_rx.recv().await {
            tracing::debug!(
                user_id = %msg.user_id,
                connection_id = %msg.connection_id,
                kind = %msg.kind,
                "Client frame received"
            );
        }
    });
    let inbound = Arc::new(RateLimitedInbound::new(
        Arc::new(config.message_limiter()),
        Arc::new(inbound_tx),
    ));

    let hub = Arc::new(Hub::start(config.hub_settings(), bus, membership, inbound).await?);

    let app_state = state::AppState {
        hub: hub.clone(),
        jwt_secret: config.jwt_secret.clone().into_bytes(),
        ip_limiter: Arc::new(config.ip_limiter()),
        user_limiter: Arc::new(config.user_limiter()),
        max_frame_bytes: config.connection.max_frame_bytes,
    };
    let app = routes::build_router(app_state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(instance_id = %hub.instance_id(), "Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for ctrl-c");
        }
    })
    .await?;

    hub.shutdown().await;
    Ok(())
}
