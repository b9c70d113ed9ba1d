//! Quote Executor - runs a saved quote against a local key
//!
//! Usage: `quote-executor <quote.json>`. Configuration comes from
//! `QUOTE_EXECUTOR_CONFIG` (default `config/default.toml`); the signing key from
//! the variable named in `[wallet]`.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use quote_executor::chain::ChainRegistry;
use quote_executor::config::Settings;
use quote_executor::execution::{cancel_pair, Execution, Progress, RpcTraceLookup, StepExecutor};
use quote_executor::{metrics, EthersWallet, Execute, HttpSolverApi};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Quote Executor v{}", env!("CARGO_PKG_VERSION"));

    let quote_path = std::env::args()
        .nth(1)
        .context("usage: quote-executor <quote.json>")?;

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let quote_json = std::fs::read_to_string(&quote_path)
        .with_context(|| format!("Failed to read quote file: {}", quote_path))?;
    let quote = Execute::from_json(&quote_json)?;
    let mut execution = Execution::new(quote)?;
    info!("Loaded quote {} as execution {}", quote_path, execution.id());

    let chains = Arc::new(ChainRegistry::new(&settings)?);
    let wallet = EthersWallet::from_private_key(&settings.wallet.private_key()?, chains.clone())?
        .with_confirmation(
            settings.executor.confirmation_poll_interval(),
            settings.executor.confirmation_timeout(),
        );

    let api = HttpSolverApi::new(
        &settings.api.base_url,
        settings.api.api_key(),
        std::time::Duration::from_secs(settings.api.request_timeout_secs),
    )?;
    let mut executor = StepExecutor::new(Arc::new(api));
    if settings.trace.enabled {
        let trace = RpcTraceLookup::new(
            chains.trace_endpoints(),
            std::time::Duration::from_secs(settings.trace.timeout_secs),
        )?;
        executor = executor.with_trace(Arc::new(trace));
    }

    let (cancel, signal) = cancel_pair();
    let mut options = settings
        .executor
        .to_options()
        .with_cancel(signal)
        .with_progress(log_progress);
    if let Some(batch) = settings.batch_executor()? {
        options.batch_executor = Some(Arc::new(batch.with_reader(chains.clone())));
    }

    let shutdown = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, cancelling execution");
        cancel.cancel();
    });

    let result = executor.execute(&mut execution, &wallet, &options).await;
    shutdown.abort();

    let progress = match result {
        Ok(progress) => {
            info!("Quote executed, {} transactions", progress.tx_hashes.len());
            progress
        }
        Err(e) => {
            error!("Execution stopped: {}", e);
            execution.snapshot()
        }
    };

    println!("{}", serde_json::to_string_pretty(&progress)?);

    if settings.metrics.enabled {
        print!("{}", metrics::gather_text());
    }

    if !execution.is_complete() {
        anyhow::bail!("execution {} incomplete", execution.id());
    }

    info!("Quote Executor stopped");
    Ok(())
}

fn log_progress(progress: &Progress) {
    match (&progress.error, progress.current_step, progress.current_step_item) {
        (Some(error), step, item) => warn!(
            "Step {:?} item {:?}: {} ({})",
            step, item, error.message, error.kind
        ),
        (None, Some(step), Some(item)) => info!(
            "Step {} item {}: {:?}",
            step,
            item,
            progress.item_status(step, item)
        ),
        _ => {}
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,quote_executor=debug,hyper=warn,reqwest=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
