use braintrace_core::{install_signal_handler, Orchestrator, StoreLock};
use braintrace_server::{load_config, run_session, ServerError};
use braintrace_store::StoreLayout;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "braintrace-server",
    version,
    about = "BrainTrace backend: starts the graph engine and inference server, then serves"
)]
struct Cli {
    /// Bootstrap config file. Built-in presets are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Directory holding the metadata store, uploads, and pid markers.
    #[arg(long, env = "BRAINTRACE_DATA_DIR", default_value = "./braintrace-data")]
    data_dir: PathBuf,

    /// Log at debug level unless BRAINTRACE_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BRAINTRACE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), ServerError> {
    let config = load_config(cli.config.as_deref())?;
    let layout = StoreLayout::new(&cli.data_dir);
    let _lock = StoreLock::try_acquire(&layout.lock_file())?;
    info!("data directory: {}", cli.data_dir.display());

    let shutdown = Arc::new(Notify::new());
    let notify = Arc::clone(&shutdown);
    install_signal_handler(move || notify.notify_one())?;

    let mut orchestrator = Orchestrator::new(&config, layout);
    let addr = format!("{}:{}", cli.host, cli.port);
    let outcome = run_session(&mut orchestrator, &addr, &shutdown).await;
    if !outcome.shutdown.is_clean() {
        warn!(
            "{} dependencies did not stop cleanly",
            outcome.shutdown.anomalies.len()
        );
    }
    outcome.result
}
