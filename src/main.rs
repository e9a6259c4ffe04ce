use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustmigrator::events::Producer;
use rustmigrator::{
    BrokerProducer, ConnPool, Entity, FixConsumer, MemoryBroker, MemoryConnPool, MemoryStore,
    MigratorConfig, PolicyCell, RoutingPolicy, RoutingPool, RowChangeListener, Scheduler,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rustmigrator")]
#[command(about = "Dual-write migration control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control surface over in-memory demo stores
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
        /// JSON configuration file; missing keys keep their defaults
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration as JSON
    PrintConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Demo table served by `serve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Account {
    id: i64,
    owner: String,
    balance: i64,
    utime: i64,
}

impl Entity for Account {
    fn id(&self) -> i64 {
        self.id
    }

    fn update_time(&self) -> i64 {
        self.utime
    }

    fn compare_to(&self, other: &Self) -> bool {
        self == other
    }
}

fn load_config(path: Option<PathBuf>) -> Result<MigratorConfig> {
    match path {
        Some(path) => MigratorConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load config '{}'", path.display())),
        None => Ok(MigratorConfig::default()),
    }
}

fn seed_accounts(count: i64) -> Vec<Account> {
    (1..=count)
        .map(|id| Account {
            id,
            owner: format!("owner-{id}"),
            balance: id * 100,
            utime: id,
        })
        .collect()
}

async fn serve(addr: SocketAddr, config: MigratorConfig) -> Result<()> {
    // dst starts as a partial, slightly stale copy of src.
    let src = MemoryStore::with_rows("src", seed_accounts(500)).await;
    let mut stale = seed_accounts(450);
    if let Some(row) = stale.get_mut(9) {
        row.balance += 1;
    }
    let dst = MemoryStore::with_rows("dst", stale).await;

    let broker = Arc::new(MemoryBroker::new());
    let producer: Arc<dyn Producer> = Arc::new(BrokerProducer::new(
        broker.clone(),
        config.inconsistency_topic.clone(),
    ));

    let policy = PolicyCell::shared(RoutingPolicy::SrcOnly);
    let pool = RoutingPool::new(
        Arc::new(MemoryConnPool::new("src")),
        Arc::new(MemoryConnPool::new("dst")),
        Arc::clone(&policy),
    );
    info!(pool = %pool.name(), "routing pool ready");

    let shutdown = CancellationToken::new();
    let fixer = Arc::new(FixConsumer::<Account>::new(
        broker.clone(),
        Arc::new(src.clone()),
        Arc::new(dst.clone()),
        &config,
    )?)
    .start(shutdown.child_token())
    .await?;

    let listener = Arc::new(RowChangeListener::<Account>::new(
        Arc::new(src.clone()),
        Arc::new(dst.clone()),
        Arc::clone(&policy),
        Arc::clone(&producer),
        broker.clone(),
        &config,
    )?)
    .start(shutdown.child_token())
    .await?;

    let scheduler = Arc::new(Scheduler::<Account>::new(
        Arc::new(src),
        Arc::new(dst),
        policy,
        producer,
        config,
    )?);
    let app = rustmigrator::web::router(scheduler);

    let tcp = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "control surface listening");

    axum::serve(tcp, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!(stats = %pool.stats(), "shutting down");
    shutdown.cancel();
    fixer.stop().await?;
    listener.stop().await?;
    broker.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { addr, config } => serve(addr, load_config(config)?).await,
        Command::PrintConfig { config } => {
            let config = load_config(config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
