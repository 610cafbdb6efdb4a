use clap::{Parser, ValueEnum};
use dealflow_core::store::StoreConfig;
use dealflow_service::worker::{DeliverableWorker, WorkerConfig};
use dealflow_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "dealflowd", version, about = "Dealflow REST service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8090
    #[arg(long, default_value = "127.0.0.1:8090")]
    listen: SocketAddr,
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StoreMode::Auto, env = "DEALFLOW_STORE")]
    store: StoreMode,
    /// PostgreSQL url for deal, wallet, and deliverable persistence.
    #[arg(long, env = "DEALFLOW_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "DEALFLOW_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Background worker poll interval in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    poll_interval_ms: u64,
    /// Max deliverables claimed per worker poll.
    #[arg(long, default_value_t = 10)]
    worker_batch: usize,
    /// Disable the background worker and rely on inline execution only.
    #[arg(long, default_value_t = false)]
    no_worker: bool,
}

fn resolve_store(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let store = match cli.store {
        StoreMode::Memory => StoreConfig::Memory,
        StoreMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("store=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StoreMode::Auto => {
            if let Some(database_url) = resolved_url {
                StoreConfig::postgres(database_url, cli.pg_max_connections)
            } else {
                StoreConfig::Memory
            }
        }
    };

    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dealflow_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let store = resolve_store(&cli)?;
    info!(backend = store.label(), "storage resolved");

    let config = ServiceConfig {
        store,
        ..ServiceConfig::default()
    };
    let state = ServiceState::bootstrap(config).await?;

    if !cli.no_worker {
        let worker_config = WorkerConfig {
            poll_interval: Duration::from_millis(cli.poll_interval_ms.max(10)),
            batch_size: cli.worker_batch.max(1),
        };
        DeliverableWorker::new(state.pipeline.clone(), worker_config).spawn();
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("dealflow-service listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
