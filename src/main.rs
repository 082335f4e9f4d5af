use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bankfeed::config::{CliArgs, Command, Config};
use bankfeed::simplefin::{SimpleFin, SimpleFinConfig};
use bankfeed::sync::{SyncOptions, SyncService};
use bankfeed::vault::FileVault;
use bankfeed::{cli, server};
use bankfeed_core::{Error, LedgerStore, Result};
use bankfeed_sqlite::SqliteLedger;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let config = Config::load(&args);
    init_tracing(&config);

    if let Err(err) = run(args, config).await {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(args: CliArgs, config: Config) -> Result<()> {
    let secret = config.operator_secret()?;

    if config.provider.kind != "simplefin" {
        return Err(Error::Config(format!(
            "unknown provider kind {:?}; available: simplefin",
            config.provider.kind
        )));
    }
    let provider = Arc::new(SimpleFin::new(SimpleFinConfig {
        max_window_days: config.provider.max_window_days,
        request_timeout: Duration::from_secs(config.provider.request_timeout_secs),
        max_retries: config.provider.max_retries,
        retry_base: Duration::from_millis(config.provider.retry_base_ms),
    }));

    let vault = Arc::new(FileVault::new(&config.vault.path, &secret));
    let store: Arc<dyn LedgerStore> = Arc::new(SqliteLedger::new(&config.storage.path)?);

    let service = Arc::new(SyncService::new(
        provider,
        store,
        vault,
        SyncOptions {
            min_refresh: Duration::from_secs(config.sync.min_refresh_secs),
            cycle_timeout: Duration::from_secs(config.sync.cycle_timeout_secs),
            default_lookback_days: config.sync.default_lookback_days,
        },
    ));

    match &args.command {
        Command::Setup { provider, token } => cli::setup(&service, provider, token).await,
        Command::Accounts { json } => cli::accounts(&service, *json).await,
        Command::Transactions { days, json } => cli::transactions(&service, *days, *json).await,
        Command::Serve => server::run(&config, service).await,
    }
}
