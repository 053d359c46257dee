use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio::signal;
use tokio::sync::watch;

use common::{Config, RuleSourceKind};
use enforcer::ipc::{start_ipc_server, IpcState};
use enforcer::{Enforcer, NotificationFanout, ProviderRegistry, RuleDirectory, RuleEvaluator, RuleStore, Storage};

#[derive(Parser)]
#[command(name = "finops-enforcer")]
#[command(about = "Cloud cost policy enforcement daemon", long_about = None)]
struct Args {
    /// Config file (defaults to $FINOPS_CONFIG or ./config/default.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Run a single enforcement tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting finops enforcer");

    let config_path = args.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    info!("Config loaded from {}", config_path);

    let storage = Storage::new(&config.storage.db_path).await?;
    info!("Storage initialized at {}", config.storage.db_path);

    let rule_store: Arc<dyn RuleStore> = match config.rules.source {
        RuleSourceKind::Database => Arc::new(storage.clone()),
        RuleSourceKind::Directory => Arc::new(RuleDirectory::new(&config.rules.dir)),
    };
    let evaluator = Arc::new(RuleEvaluator::new(rule_store, config.rules.failure_mode));

    let registry = ProviderRegistry::from_config(&config)?;
    info!("Providers registered: {:?}", registry.kinds());

    let notifier = NotificationFanout::new(storage.clone(), Duration::from_secs(config.notify.timeout_secs))?;
    let enforcer = Arc::new(Enforcer::new(
        storage.clone(),
        evaluator.clone(),
        registry,
        notifier,
        config.enforcer.clone(),
    ));

    if args.once {
        let summary = enforcer.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher = tokio::spawn(
        evaluator
            .clone()
            .watch(Duration::from_secs(config.rules.reload_interval_secs), shutdown_rx.clone()),
    );

    let ipc = start_ipc_server(
        IpcState {
            enforcer: enforcer.clone(),
            storage: storage.clone(),
            started: Instant::now(),
        },
        &config.ipc.socket_path,
    )
    .await?;

    let worker = tokio::spawn(enforcer.clone().run(shutdown_rx));
    info!("Finops enforcer is running");

    signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    if let Err(e) = worker.await {
        error!("Enforcement loop panicked: {}", e);
    }
    let _ = watcher.await;
    ipc.abort();
    let _ = std::fs::remove_file(&config.ipc.socket_path);
    Ok(())
}
