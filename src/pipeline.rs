// src/pipeline.rs
//! Stage orchestration for one batch run. Each stage fully materializes its
//! artifact before the next starts; the network stages run first, the
//! file and warehouse stages run on the blocking pool.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::aggregate;
use crate::archive;
use crate::config::Config;
use crate::consolidate::{self, ConsolidationReport};
use crate::enrich::{self, EnrichmentReport};
use crate::fetch::{self, http::HttpClient, FetchReport};
use crate::model::EnrichedRecord;
use crate::warehouse::{LoadReport, Warehouse};

#[derive(Debug, Default, Clone, Copy)]
pub struct RunOptions {
    /// Use only what is already on disk; no HTTP at all.
    pub skip_fetch: bool,
    /// Clear every warehouse table before loading.
    pub reset_warehouse: bool,
    /// Only reload the warehouse from the enriched artifact of an earlier run.
    pub load_only: bool,
}

#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetch: Option<FetchReport>,
    pub extracted: usize,
    pub consolidation: ConsolidationReport,
    pub enrichment: EnrichmentReport,
    pub aggregates: usize,
    pub load: LoadReport,
}

impl RunReport {
    /// Some archives could not be downloaded; the run used what it had.
    pub fn partial_fetch(&self) -> bool {
        self.fetch.as_ref().map(FetchReport::has_failures).unwrap_or(false)
    }
}

/// Archives already sitting in the raw directory, oldest name first.
pub fn local_archives(raw_dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*.zip", raw_dir.display());
    let mut out = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("bad pattern {}", pattern))? {
        out.push(entry?);
    }
    out.sort();
    Ok(out)
}

fn prepare_dirs(cfg: &Config) -> Result<()> {
    for dir in [cfg.paths.data_dir.clone(), cfg.raw_dir(), cfg.processed_dir()] {
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(())
}

fn compress_next_to(path: &Path) -> Result<()> {
    let zip = path.with_extension("zip");
    archive::compress_file(path, &zip)?;
    info!(file = %zip.display(), "artifact compressed");
    Ok(())
}

/// Extract, consolidate, enrich, aggregate and load. Blocking.
fn process(cfg: &Config, archives: &[PathBuf], opts: RunOptions, report: &mut RunReport) -> Result<()> {
    report.extracted = archive::extract_all(archives, &cfg.processed_dir()).len();

    let consolidated = cfg.consolidated_file();
    report.consolidation = consolidate::consolidate(&cfg.processed_dir(), &consolidated, &cfg.etl)
        .context("consolidation stage")?;
    if cfg.etl.compress_outputs {
        compress_next_to(&consolidated)?;
    }

    let (rows, enrichment) = enrich::enrich(&consolidated, &cfg.registry_file(), &cfg.enriched_file())
        .context("enrichment stage")?;
    report.enrichment = enrichment;

    let aggregated = cfg.aggregated_file();
    report.aggregates = aggregate::run(&rows, &aggregated)
        .context("aggregation stage")?
        .len();
    if cfg.etl.compress_outputs {
        compress_next_to(&aggregated)?;
    }

    report.load = load_warehouse(cfg, &rows, opts)?;
    Ok(())
}

fn load_warehouse(cfg: &Config, rows: &[EnrichedRecord], opts: RunOptions) -> Result<LoadReport> {
    let mut wh = Warehouse::open(&cfg.warehouse.url)?;
    wh.init_schema()?;
    if opts.reset_warehouse {
        warn!(url = %cfg.warehouse.url, "resetting warehouse before load");
        wh.reset()?;
    }
    wh.load(rows, cfg.warehouse.batch_size)
        .context("warehouse load stage")
}

/// Rerun the load stage from the enriched artifact. Blocking.
fn reload(cfg: &Config, opts: RunOptions, report: &mut RunReport) -> Result<()> {
    let rows = enrich::read_enriched(&cfg.enriched_file()).context("reading enriched artifact")?;
    info!(rows = rows.len(), file = %cfg.enriched_file().display(), "loading from enriched artifact");
    report.load = load_warehouse(cfg, &rows, opts)?;
    Ok(())
}

#[instrument(level = "info", skip(cfg), fields(data_dir = %cfg.paths.data_dir.display()))]
pub async fn run(cfg: &Config, opts: RunOptions) -> Result<RunReport> {
    prepare_dirs(cfg)?;
    let mut report = RunReport {
        started_at: Utc::now(),
        ..Default::default()
    };

    if opts.load_only {
        let cfg = cfg.clone();
        let mut report = tokio::task::spawn_blocking(move || -> Result<RunReport> {
            reload(&cfg, opts, &mut report)?;
            Ok(report)
        })
        .await
        .context("load task panicked")??;
        report.finished_at = Utc::now();
        info!(events = report.load.events, aggregates = report.load.aggregates, "reload complete");
        return Ok(report);
    }

    let archives = if opts.skip_fetch {
        let local = local_archives(&cfg.raw_dir())?;
        info!(archives = local.len(), "fetch skipped, using local archives");
        local
    } else {
        let client = HttpClient::new(&cfg.http, cfg.retry_policy())?;
        let fetched = fetch::fetch_all(&client, cfg).await?;
        info!(
            discovered = fetched.discovered,
            downloaded = fetched.downloaded,
            reused = fetched.reused,
            failed = fetched.failed,
            "fetch finished"
        );
        enrich::ensure_registry(&client, &cfg.source.registry_url, &cfg.registry_file()).await?;
        let archives = fetched.archives.clone();
        report.fetch = Some(fetched);
        archives
    };

    let cfg = cfg.clone();
    let mut report = tokio::task::spawn_blocking(move || -> Result<RunReport> {
        process(&cfg, &archives, opts, &mut report)?;
        Ok(report)
    })
    .await
    .context("processing task panicked")??;
    report.finished_at = Utc::now();

    info!(
        rows = report.consolidation.rows_written,
        matched = report.enrichment.matched,
        aggregates = report.aggregates,
        events = report.load.events,
        elapsed_s = (report.finished_at - report.started_at).num_seconds(),
        "run complete"
    );
    Ok(report)
}
