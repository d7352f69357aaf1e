//! Thin CLI over the promotion controller.
//!
//! Exit codes: 0 Promoted, 2 Rejected, 3 RolledBack, 4 CommitFailed,
//! 5 AlreadyInProgress, 1 anything else.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use modelgate_core::{
    init_tracing, load_settings, mark_ready, start_health_server, CanaryConfig, CancelHandle,
    GatePolicy, HttpServingRuntime, LogNotifier, Notifier, PromotionController, PromotionError,
    VersionStore, WebhookNotifier,
};

#[derive(Parser, Debug)]
#[command(name = "promote", about = "Gate, canary and promote a trained model version")]
struct Args {
    /// Evaluation accuracy of the freshly trained candidate, in [0,1].
    #[arg(long)]
    accuracy: f64,

    /// Location of the trained artifact, as the serving runtime sees it.
    #[arg(long)]
    artifact: String,

    #[arg(long, default_value_t = 0.97)]
    min_accuracy: f64,

    #[arg(long, default_value_t = 0.02)]
    max_regression: f64,

    #[arg(long, default_value_t = 0.1)]
    canary_fraction: f64,

    #[arg(long, default_value_t = 600)]
    trial_seconds: u64,

    #[arg(long, default_value_t = 5000)]
    sample_interval_ms: u64,

    #[arg(long, default_value_t = 0.05)]
    max_error_rate_delta: f64,

    #[arg(long, default_value_t = 0.10)]
    max_latency_regression: f64,

    /// Override the configured ledger file.
    #[arg(long)]
    ledger: Option<String>,

    /// Override the configured serving runtime base URL.
    #[arg(long)]
    serving_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing("promoter")?;
    let settings = load_settings()?;
    start_health_server(settings.health_port).await?;

    let ledger = args.ledger.as_deref().unwrap_or(&settings.ledger_path);
    let serving_url = args.serving_url.as_deref().unwrap_or(&settings.serving_url);

    let store = Arc::new(VersionStore::open(ledger)?);
    let runtime = Arc::new(HttpServingRuntime::new(
        serving_url,
        &settings.model_name,
        Duration::from_secs(15),
    )?);
    let notifier: Arc<dyn Notifier> = match &settings.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => Arc::new(LogNotifier),
    };

    let controller = PromotionController::new(
        store,
        runtime,
        notifier,
        GatePolicy { min_accuracy: args.min_accuracy, max_regression: args.max_regression },
        CanaryConfig {
            traffic_fraction: args.canary_fraction,
            trial_duration: Duration::from_secs(args.trial_seconds),
            sample_interval: Duration::from_millis(args.sample_interval_ms),
            max_error_rate_delta: args.max_error_rate_delta,
            max_latency_regression: args.max_latency_regression,
        },
    );

    // Clean up anything a previous unclean shutdown left behind.
    controller.recover().await?;
    mark_ready();

    // Ctrl-C cancels an in-flight canary; handled as a rollback, not a kill.
    let (cancel_handle, cancel) = CancelHandle::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancellation requested, reverting canary");
            cancel_handle.cancel();
        }
    });

    let code = match controller.run(args.accuracy, &args.artifact, cancel).await {
        Ok(outcome) => {
            info!(?outcome, "promotion run finished");
            outcome.exit_code()
        }
        Err(PromotionError::AlreadyInProgress) => {
            error!("another promotion is in flight, try again later");
            5
        }
        Err(e) => {
            error!(error = %e, "promotion run failed");
            1
        }
    };
    std::process::exit(code);
}
