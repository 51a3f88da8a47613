use anyhow::Result;
use ansscraper::{
    config::Config,
    pipeline::{self, RunOptions},
    reports,
    warehouse::open_reader,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Fetch, consolidate, enrich, aggregate and load ANS quarterly expense disclosures.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// YAML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Do not touch the network; use archives and registry already on disk.
    #[arg(long)]
    skip_fetch: bool,

    /// Delete all warehouse rows before loading.
    #[arg(long)]
    reset_warehouse: bool,

    /// Skip every other stage and reload the warehouse from the enriched CSV.
    #[arg(long)]
    load_only: bool,

    /// Number of most recent quarters to fetch.
    #[arg(long)]
    quarters: Option<usize>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(args.config.as_deref())?;
    if let Some(q) = args.quarters {
        cfg.source.quarters_limit = q;
    }
    info!(
        quarters = cfg.source.quarters_limit,
        skip_fetch = args.skip_fetch,
        reset = args.reset_warehouse,
        "startup"
    );

    let opts = RunOptions {
        skip_fetch: args.skip_fetch,
        reset_warehouse: args.reset_warehouse,
        load_only: args.load_only,
    };
    let report = match pipeline::run(&cfg, opts).await {
        Ok(r) => r,
        Err(e) => {
            error!(error = ?e, "run aborted");
            return Ok(ExitCode::FAILURE);
        }
    };

    if report.partial_fetch() {
        warn!(
            failed = report.fetch.as_ref().map(|f| f.failed).unwrap_or(0),
            "some archives could not be downloaded"
        );
        return Ok(ExitCode::FAILURE);
    }
    summarize(&cfg);
    info!("all done");
    Ok(ExitCode::SUCCESS)
}

/// Log headline numbers through the read-only role.
fn summarize(cfg: &Config) {
    let stats = open_reader(cfg.reader_url()).and_then(|conn| reports::market_stats(&conn));
    match stats {
        Ok(s) => info!(
            total = s.total,
            mean_per_organization = s.mean_per_organization,
            states = s.by_state.len(),
            "warehouse summary"
        ),
        Err(e) => warn!(error = ?e, "could not summarize warehouse"),
    }
}
