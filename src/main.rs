use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use http::{
    HeaderName, Method,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use anyhow::anyhow;

use voxbench_gateway::{AppState, ServerConfig, SessionManager, SessionStatus, ws_handler};

/// Voxbench Gateway - Real-time voice session engine
#[derive(Parser, Debug)]
#[command(name = "voxbench-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the listen host
    #[arg(long = "host")]
    host: Option<String>,

    /// Override the listen port
    #[arg(long = "port")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxbench_gateway=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration from file or environment
    let mut config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        ServerConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let address = config.address();
    let cors_origins = config.cors_allowed_origins.clone();

    let sessions = Arc::new(SessionManager::new(&config));
    let app_state = Arc::new(AppState {
        sessions: sessions.clone(),
    });

    // Configure CORS
    let cors_layer = if let Some(ref origins) = cors_origins {
        if origins == "*" {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    AUTHORIZATION,
                    CONTENT_TYPE,
                    HeaderName::from_static("x-provider-api-key"),
                ])
                .allow_credentials(false)
        } else {
            // Parse comma-separated origins
            let origins: Vec<_> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    AUTHORIZATION,
                    CONTENT_TYPE,
                    HeaderName::from_static("x-provider-api-key"),
                ])
                .allow_credentials(true)
        }
    } else {
        // No allow_origin means browsers block cross-origin requests.
        info!(
            "CORS not configured, defaulting to same-origin only. \
             Set CORS_ALLOWED_ORIGINS to enable cross-origin access."
        );
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                AUTHORIZATION,
                CONTENT_TYPE,
                HeaderName::from_static("x-provider-api-key"),
            ])
            .allow_credentials(false)
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(app_state)
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http());

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    info!("Server listening on ws://{}/ws", socket_addr);

    let listener = TcpListener::bind(&socket_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sessions))
        .await?;

    Ok(())
}

async fn shutdown_signal(sessions: Arc<SessionManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received, terminating active sessions");
    sessions.terminate_all(SessionStatus::Disconnected);
}
