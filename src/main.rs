use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use llm_gateway::{
    build_router, AppState, GatewayConfig, ModelRouter, ProviderRegistry, StorageService,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "llm-gateway",
    about = "Local LLM gateway — routes Anthropic/OpenAI traffic to any provider and records every exchange",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db) = cli.db {
        config.storage.path = db;
    }

    // Providers resolve credentials eagerly and the store opens now: either
    // failing aborts startup instead of running degraded.
    let registry = ProviderRegistry::from_config(&config)?;
    let storage = StorageService::open(&config.storage.path, config.idle_gap()).await?;
    let router = ModelRouter::from_config(&config, registry);

    info!("llm-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("  Providers: {}", config.provider_names().join(", "));
    info!("  Default:   {}", config.default_provider);
    info!("  Routes:    {} mapped", config.routes.len());
    info!("  Database:  {}", config.storage.path.display());
    info!("  Port:      {}", config.port);

    let state = Arc::new(AppState {
        router: Arc::new(router),
        storage,
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("");
    info!("  To use with Claude Code:");
    info!("    ANTHROPIC_BASE_URL=http://localhost:{} claude", config.port);
    info!("");
    info!("  Monitoring API at http://localhost:{}/api/requests", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server exited");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install shutdown handler: {e}");
        return;
    }
    info!("Shutting down");
}
