//! # gossip_wire
//!
//! Rate-limited LLM enrichment jobs for a celebrity-news document store.
//! Each run reads articles from the store, asks an OpenAI-compatible model to
//! categorize, summarize or extract facts from them, and writes the results
//! back in batched writes.
//!
//! ## Usage
//!
//! ```sh
//! gossip_wire categorize -c ./config.yaml -r ./reports
//! ```
//!
//! ## Architecture
//!
//! 1. **Fetching**: Stream unprocessed articles from the store
//! 2. **Admission**: Every request waits for the shared token budget
//! 3. **Processing**: Requests fan out in fixed-size batches with a cooldown
//!    between batches; rate-limited calls are retried with linear backoff
//! 4. **Output**: Results are committed in write batches and a JSON run
//!    report is written

use clap::Parser;
use std::error::Error;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

mod api;
mod cli;
mod config;
mod error;
mod jobs;
mod models;
mod outputs;
mod rate_limiter;
mod retry;
mod scheduler;
mod store;
mod utils;

use api::OpenAiClient;
use cli::Cli;
use jobs::Pipeline;
use outputs::json;
use store::JsonFileStore;
use utils::ensure_writable_dir;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("gossip_wire starting up");

    let args = Cli::parse();
    debug!(job = ?args.job, collection = %args.collection, config = %args.config, "Parsed CLI arguments");

    // ---- Load config ----
    let mut config = config::load_or_default(&args.config)?;
    if let Some(store_path) = &args.store {
        config.store.path = store_path.clone();
    }

    // Early check: ensure the report dir is writable before spending budget
    if let Some(report_dir) = &args.report_dir {
        if let Err(e) = ensure_writable_dir(report_dir).await {
            error!(
                path = %report_dir,
                error = %e,
                "Report directory is not writable (fix perms or choose a different path)"
            );
            return Err(e);
        }
    }

    // ---- Collaborators ----
    let store = JsonFileStore::open(&config.store.path).await?;
    let llm = OpenAiClient::new(&config.llm, args.api_key.clone())?;
    info!(
        endpoint = llm.endpoint(),
        model = %config.llm.model,
        policy = ?config.rate_limit.policy,
        tokens_per_minute = config.rate_limit.tokens_per_minute,
        requests_per_minute = ?config.rate_limit.requests_per_minute,
        "Collaborators ready"
    );

    // ---- Run ----
    let pipeline = Pipeline::new(&config, &llm, &store);
    let report = pipeline.run(args.job, &args.job_options()).await?;

    if let Some(report_dir) = &args.report_dir {
        if let Err(e) = json::write_report(&report, report_dir).await {
            error!(error = %e, "Failed to write run report");
        }
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        succeeded = report.summary.succeeded,
        failed = report.summary.failed,
        "Execution complete"
    );

    Ok(())
}
