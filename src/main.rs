//! tilestitch - Retrieve and stitch extreme-resolution page images.
//!
//! This binary parses the command line, builds the shared network stack and
//! runs one command.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tilestitch::{
    config::{Cli, Command, FetchArgs, InspectArgs, NetworkArgs},
    fetch::{PageFailure, PageFetcher},
    io::PooledHttpSource,
    resilience::ResilienceContext,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Fetch(args) => run_fetch(args).await,
        Command::Inspect(args) => run_inspect(args).await,
    }
}

/// Shared network stack for one command.
struct Runtime {
    fetcher: PageFetcher,
    shutdown: CancellationToken,
}

impl Runtime {
    fn new(network: &NetworkArgs) -> Self {
        let resilience = Arc::new(ResilienceContext::new(network.resilience_config()));
        let shutdown = CancellationToken::new();
        resilience.spawn_maintenance(shutdown.child_token());

        let http = Arc::new(PooledHttpSource::new(Arc::clone(&resilience)));
        let fetcher = PageFetcher::new(http, resilience, network.fetch_settings());

        let ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling downloads");
                ctrl_c.cancel();
            }
        });

        Self { fetcher, shutdown }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Fetch Command
// =============================================================================

async fn run_fetch(args: FetchArgs) -> ExitCode {
    init_logging(args.network.verbose);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let runtime = Runtime::new(&args.network);
    let source = args.page_source();

    info!("Fetching page:");
    info!("  Source: {}", source.url());
    info!("  Profile: {}", args.profile);
    info!(
        "  Concurrency: {}, retries: {}",
        args.network.concurrency, args.network.retries
    );

    let result = runtime
        .fetcher
        .fetch_page_with_cancel(&source, &args.profile, &runtime.shutdown)
        .await;

    let (page, failure) = match result {
        Ok(page) => (page, None),
        Err(mut failure) => match failure.partial.take() {
            Some(partial) => (partial, Some(failure)),
            None => {
                report_failure(&failure);
                return ExitCode::FAILURE;
            }
        },
    };

    if let Err(e) = tokio::fs::write(&args.output, &page.data).await {
        error!("Failed to write {}: {}", args.output.display(), e);
        return ExitCode::FAILURE;
    }

    info!(
        "Wrote {} ({}x{}, {} of {} tiles)",
        args.output.display(),
        page.width,
        page.height,
        page.tiles_total - page.tiles_missing,
        page.tiles_total
    );
    if page.tiles_missing > 0 {
        warn!("  {} tile(s) missing, painted white", page.tiles_missing);
    }
    if page.degraded {
        warn!("  Canvas could not be allocated, wrote the first tile only");
    }
    if page.clamped {
        warn!("  Page exceeds the maximum canvas size and was cropped");
    }

    match failure {
        Some(failure) => {
            warn!("  Image is partial");
            report_failure(&failure);
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}

// =============================================================================
// Inspect Command
// =============================================================================

async fn run_inspect(args: InspectArgs) -> ExitCode {
    if args.network.verbose {
        init_logging(true);
    }

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let runtime = Runtime::new(&args.network);
    match runtime.fetcher.inspect(&args.page_source()).await {
        Ok(summary) => match serde_json::to_string_pretty(&summary) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(failure) => {
            eprintln!("Error: {}", failure.error);
            eprintln!("  {}", failure.classification.user_message);
            eprintln!("  {}", failure.classification.suggested_action);
            ExitCode::FAILURE
        }
    }
}

/// Log a failed page with its classification.
fn report_failure(failure: &PageFailure) {
    error!("Page failed: {}", failure.error);
    error!("  Category: {}", failure.classification.category);
    error!("  {}", failure.classification.user_message);
    error!("  {}", failure.classification.suggested_action);
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tilestitch=debug"
    } else {
        "tilestitch=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
