//! screenhub - central hub for networked kiosk displays
//!
//! ## Modes
//!
//! **Server** (`screenhub server`): Runs the hub. Displays and operator
//! consoles connect over WebSocket at `/ws`; the hub tracks their liveness,
//! pushes display updates and keeps named presets.
//!
//! **Client** (`screenhub client`): Runs a headless display client that
//! registers with a hub, sends heartbeats and tracks the display state the
//! hub pushes to it.

use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use screenhub::{
    api,
    auth::{AuthGate, TokenStore},
    client::{self, ClientIdentity, ClientOptions, DisplayClient},
    config::{self, HubConfig},
    liveness::LivenessMonitor,
    presets::PresetStore,
    registry::ClientRegistry,
};

/// screenhub - central hub for networked kiosk displays
#[derive(ClapParser, Debug)]
#[command(name = "screenhub", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the hub server
    Server {
        /// TOML config file (missing file means defaults)
        #[arg(long, env = "SCREENHUB_CONFIG", default_value = "screenhub.toml")]
        config: PathBuf,

        /// Address to bind the WebSocket server (overrides config and PORT)
        #[arg(long, env = "SCREENHUB_BIND")]
        bind: Option<SocketAddr>,

        /// Port to listen on, keeping the configured interface
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },
    /// Run a headless display client
    Client {
        /// Hub WebSocket URL
        #[arg(long, env = "SCREENHUB_SERVER", default_value = "ws://127.0.0.1:8765/ws")]
        server: String,

        /// Directory holding the client id and token
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Display name reported to the hub (defaults to the hostname)
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum HubError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), HubError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Server { config, bind, port } => run_server(config, bind, port).await,
        Commands::Client {
            server,
            state_dir,
            name,
        } => run_client(server, state_dir, name).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "screenhub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(
    config_path: PathBuf,
    bind: Option<SocketAddr>,
    port: Option<u16>,
) -> Result<(), HubError> {
    let config = HubConfig::resolve(Some(&config_path), port, bind)?;
    tracing::info!(system = %config.system, "screenhub server starting");

    let registry = ClientRegistry::new(config.system.clone());
    let auth = AuthGate::load(TokenStore::new(&config.auth_file));
    let presets = PresetStore::new(&config.presets_file);
    match presets.load() {
        Ok(count) => tracing::info!(count, path = %config.presets_file.display(), "presets loaded"),
        Err(e) => tracing::error!(error = %e, "failed to load presets, starting with none"),
    }

    let state = api::AppState::new(registry.clone(), auth, presets);
    let shutdown = state.shutdown.clone();

    let monitor = LivenessMonitor::new(
        registry,
        config.liveness.thresholds(),
        config.liveness.sweep_interval(),
    )
    .spawn(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|source| HubError::Bind {
            addr: config.bind,
            source,
        })?;
    tracing::info!(addr = %config.bind, "WebSocket server listening");

    let app = api::router(state);
    let server_shutdown = shutdown.clone();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");

    // Closes every connection and stops the liveness monitor.
    shutdown.cancel();

    http_handle.await??;
    monitor.await?;

    tracing::info!("screenhub server exiting");
    Ok(())
}

// ── Client mode ────────────────────────────────────────────────────

async fn run_client(
    server: String,
    state_dir: Option<PathBuf>,
    name: Option<String>,
) -> Result<(), HubError> {
    let state_dir = state_dir.unwrap_or_else(client::default_state_dir);
    let identity = ClientIdentity::load_or_create(&state_dir)?;
    let name = config::resolve_hostname(name.as_deref());
    tracing::info!(
        client_id = %identity.client_id(),
        name = %name,
        state_dir = %state_dir.display(),
        "display client starting"
    );

    let display = DisplayClient::new(ClientOptions::new(server, name), identity);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(display.run(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");
    cancel.cancel();
    task.await?;

    tracing::info!("display client exiting");
    Ok(())
}
