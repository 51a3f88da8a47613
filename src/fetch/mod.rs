// src/fetch/mod.rs
pub mod http;
pub mod urls;
pub mod zips;

use anyhow::Result;
use std::path::PathBuf;
use tracing::{error, info, instrument};

use crate::config::Config;
use crate::error::EtlError;
use http::HttpClient;
use zips::Download;

/// Outcome of one fetch run. Per-file failures are counted, not propagated.
#[derive(Debug, Default, Clone)]
pub struct FetchReport {
    pub discovered: usize,
    pub downloaded: usize,
    pub reused: usize,
    pub failed: usize,
    pub archives: Vec<PathBuf>,
}

impl FetchReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Discover the newest quarterly archives and download each one sequentially.
#[instrument(level = "info", skip(client, cfg))]
pub async fn fetch_all(client: &HttpClient, cfg: &Config) -> Result<FetchReport> {
    let links = urls::discover_quarter_archives(
        client,
        &cfg.source.base_url,
        cfg.source.years_scanned,
        cfg.source.quarters_limit,
    )
    .await?;
    if links.is_empty() {
        return Err(EtlError::NoArchives(cfg.source.base_url.clone()).into());
    }

    let raw_dir = cfg.raw_dir();
    let mut report = FetchReport {
        discovered: links.len(),
        ..Default::default()
    };
    for link in &links {
        match zips::download_archive(client, &link.url, &raw_dir, &link.filename).await {
            Ok(Download::Fetched(path)) => {
                report.downloaded += 1;
                report.archives.push(path);
            }
            Ok(Download::Existing(path)) => {
                report.reused += 1;
                report.archives.push(path);
            }
            Err(e) => {
                error!(url = %link.url, period = %link.period, error = %e, "download failed");
                report.failed += 1;
            }
        }
    }

    info!(
        discovered = report.discovered,
        downloaded = report.downloaded,
        reused = report.reused,
        failed = report.failed,
        "fetch complete"
    );
    Ok(report)
}
