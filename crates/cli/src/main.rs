use clap::{Parser, Subcommand};
use perpbot_core::{ConfigLoader, EventBus, StrategyRegistry};
use perpbot_exchange::ExchangeClient;
use perpbot_orchestrator::{
    BotSupervisor, ConfigStore, Database, OrderService, PositionTracker, RunnerDeps,
    TrailingStopEngine,
};
use perpbot_web_api::{ApiServer, AppState};
use std::sync::Arc;
use std::time::Duration;

/// Window the graceful path gets before the process force-exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "perpbot")]
#[command(about = "Multi-bot perpetual-futures trading supervisor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor with the dashboard API
    Run {
        /// Override the listen address (host:port)
        #[arg(short, long)]
        addr: Option<String>,
        /// Override the database URL
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { addr, database_url } => run(addr, database_url).await,
    }
}

async fn run(addr: Option<String>, database_url: Option<String>) -> anyhow::Result<()> {
    let mut config = ConfigLoader::load()?;
    if let Some(url) = database_url {
        config.database.url = url;
    }
    let addr = addr.unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    tracing::info!(
        "Starting perpbot (exchange: {}, database: {})",
        config.exchange.base_url,
        config.database.url
    );

    let db = Database::open(&config.database.url, config.database.max_connections).await?;
    let client = Arc::new(ExchangeClient::new(config.exchange.base_url.clone()));
    let bus = EventBus::default();

    let configs = ConfigStore::new(&db);
    let orders = OrderService::new(&db, configs.clone(), client.clone(), bus.clone());
    let positions = PositionTracker::new(&db, configs.clone(), orders.clone(), client.clone());
    let trailing = TrailingStopEngine::new(&db, configs.clone(), client.clone(), bus.clone());
    let registry = Arc::new(StrategyRegistry::with_builtin(client.clone()));

    let deps = RunnerDeps {
        configs: configs.clone(),
        orders,
        positions,
        trailing,
        client: client.clone(),
        bus: bus.clone(),
        registry,
    };
    let supervisor = BotSupervisor::new(configs, deps);

    let recovered = supervisor.recover_all().await?;
    if !recovered.is_empty() {
        tracing::info!("Recovered {} bots from previous run", recovered.len());
    }

    let state = AppState {
        supervisor: supervisor.clone(),
        client,
        bus,
    };
    let server = ApiServer::new(state, config.cors.allowed_origin.clone());

    let shutdown_supervisor = supervisor.clone();
    let shutdown = async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received, stopping bots");

        let graceful = shutdown_supervisor.shutdown_all();
        if tokio::time::timeout(SHUTDOWN_GRACE, graceful).await.is_err() {
            tracing::warn!(
                "Graceful shutdown exceeded {:?}; forcing exit",
                SHUTDOWN_GRACE
            );
            std::process::exit(1);
        }
    };

    server.serve(&addr, shutdown).await?;
    tracing::info!("Listener closed, exiting");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
