use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use live_core::{
    DataFrequency,
    algorithms::{ALGORITHMS, algorithm_by_name},
    backend::build_backend,
    calendar::NyseCalendar,
    config::Settings,
    context::TradingContext,
    data::DataPortal,
    state::StateStore,
    trader::LiveTrader,
};

#[derive(Parser)]
#[command(name = "live_run", version, about = "Run a trading algorithm against a live or simulated broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an algorithm and keep it running until it fails.
    Run(RunArgs),
    /// Print the version.
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StorageEngine {
    File,
    Memory,
}

#[derive(Args)]
struct RunArgs {
    /// Name of a built-in algorithm.
    #[arg(short, long)]
    algo: String,
    #[arg(short, long, default_value = "paper")]
    backend: String,
    /// TOML file with the backend's assets, bars and starting cash.
    #[arg(long)]
    backend_config: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "minute")]
    data_frequency: DataFrequency,
    /// Defaults to `<algo>-state.json`.
    #[arg(short, long)]
    statefile: Option<PathBuf>,
    /// Keep running after a failing bar.
    #[arg(long, overrides_with = "no_retry")]
    retry: bool,
    #[arg(long)]
    no_retry: bool,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long, value_enum, default_value = "file")]
    storage_engine: StorageEngine,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let args = match cli.command {
        Command::Version => {
            println!("live_run {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Run(args) => args,
    };

    let mut settings = Settings::load()?;
    let _guard = utils::init_tracing(&settings.log_dir, &args.log_level);
    if args.retry {
        settings.continue_on_error = true;
    } else if args.no_retry {
        settings.continue_on_error = false;
    }

    let algo = algorithm_by_name(&args.algo)
        .with_context(|| format!("available algorithms: {}", ALGORITHMS.join(", ")))?;
    let backend = build_backend(&args.backend, args.backend_config.as_deref())?;
    let portal = DataPortal::new(backend, Arc::new(NyseCalendar::new()), settings.portal_options())?;
    let ctx = TradingContext::new(
        &args.algo,
        Arc::new(portal),
        args.data_frequency,
        settings.flip_compatible,
    );
    let store = match args.storage_engine {
        StorageEngine::File => StateStore::File(
            args.statefile
                .unwrap_or_else(|| PathBuf::from(format!("{}-state.json", args.algo))),
        ),
        StorageEngine::Memory => StateStore::memory(),
    };

    LiveTrader::new(algo, ctx, store, settings).run().await?;
    Ok(())
}
