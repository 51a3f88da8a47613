// src/enrich/mod.rs
pub mod registry;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::cnpj;
use crate::consolidate::read_consolidated;
use crate::error::EtlError;
use crate::fetch::http::HttpClient;
use crate::fetch::zips::{self, Download};
use crate::model::{
    ConsolidatedRecord, EnrichedRecord, RegistryRecord, INACTIVE_NAME, UNKNOWN_MODALITY,
    UNKNOWN_STATE,
};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnrichmentReport {
    pub rows: usize,
    pub matched: usize,
    /// Rows that received the inactive/unknown name sentinel.
    pub unmatched: usize,
    pub invalid_tax_ids: usize,
    pub invalid_ratio: f64,
}

/// Download the registry unless it is already on disk.
pub async fn ensure_registry(client: &HttpClient, url: &str, path: &Path) -> Result<PathBuf> {
    let got = zips::download_if_missing(client, url, path)
        .await
        .context("downloading organization registry")?;
    if let Download::Existing(p) = &got {
        info!(file = %p.display(), "registry already present");
    }
    Ok(got.path().to_path_buf())
}

fn non_empty(v: &str) -> Option<&str> {
    let t = v.trim();
    (!t.is_empty()).then_some(t)
}

/// Left-join financial facts with the registry. Every fact survives.
pub fn join(facts: Vec<ConsolidatedRecord>, registry: &[RegistryRecord]) -> (Vec<EnrichedRecord>, EnrichmentReport) {
    let by_key: HashMap<&str, &RegistryRecord> = registry
        .iter()
        .map(|r| (r.registry_id.as_str(), r))
        .collect();

    let mut report = EnrichmentReport {
        rows: facts.len(),
        ..Default::default()
    };
    let mut out = Vec::with_capacity(facts.len());

    for fact in facts {
        let key = registry::normalize_key(&fact.organization_id);
        let reg = by_key.get(key.as_str()).copied();
        if reg.is_some() {
            report.matched += 1;
        }
        let pick = |from_reg: Option<&Option<String>>| -> Option<String> {
            from_reg.and_then(|v| v.as_deref()).and_then(non_empty).map(str::to_string)
        };

        let tax_id = pick(reg.map(|r| &r.tax_id)).unwrap_or_else(|| fact.tax_id.trim().to_string());
        let name = pick(reg.map(|r| &r.legal_name))
            .or_else(|| non_empty(&fact.name).map(str::to_string))
            .unwrap_or_else(|| {
                report.unmatched += 1;
                INACTIVE_NAME.to_string()
            });
        let modality = pick(reg.map(|r| &r.modality))
            .or_else(|| non_empty(&fact.modality).map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_MODALITY.to_string());
        let state = pick(reg.map(|r| &r.state)).unwrap_or_else(|| UNKNOWN_STATE.to_string());

        let tax_id_valid = cnpj::is_valid(&tax_id);
        if !tax_id_valid {
            report.invalid_tax_ids += 1;
        }

        out.push(EnrichedRecord {
            organization_id: key,
            tax_id,
            name,
            quarter: fact.quarter,
            year: fact.year,
            account_code: fact.account_code,
            description: fact.description,
            modality,
            state,
            amount: fact.amount,
            trade_name: pick(reg.map(|r| &r.trade_name)),
            street: pick(reg.map(|r| &r.street)),
            number: pick(reg.map(|r| &r.number)),
            complement: pick(reg.map(|r| &r.complement)),
            district: pick(reg.map(|r| &r.district)),
            city: pick(reg.map(|r| &r.city)),
            postal_code: pick(reg.map(|r| &r.postal_code)),
            area_code: pick(reg.map(|r| &r.area_code)),
            phone: pick(reg.map(|r| &r.phone)),
            fax: pick(reg.map(|r| &r.fax)),
            email: pick(reg.map(|r| &r.email)),
            representative: pick(reg.map(|r| &r.representative)),
            representative_role: pick(reg.map(|r| &r.representative_role)),
            sales_region: pick(reg.map(|r| &r.sales_region)),
            registered_on: pick(reg.map(|r| &r.registered_on)),
            tax_id_valid,
        });
    }

    report.invalid_ratio = if report.rows == 0 {
        0.0
    } else {
        report.invalid_tax_ids as f64 / report.rows as f64
    };
    (out, report)
}

pub fn write_enriched(rows: &[EnrichedRecord], path: &Path) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        let mut w = WriterBuilder::new()
            .delimiter(b';')
            .from_writer(BufWriter::new(file));
        for r in rows {
            w.serialize(r).context("writing enriched row")?;
        }
        w.flush()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Load an enriched dataset written by [`write_enriched`].
pub fn read_enriched(path: &Path) -> Result<Vec<EnrichedRecord>> {
    if !path.exists() {
        return Err(EtlError::MissingArtifact(path.to_path_buf()).into());
    }
    let mut rdr = ReaderBuilder::new()
        .delimiter(b';')
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for (i, rec) in rdr.deserialize::<EnrichedRecord>().enumerate() {
        rows.push(rec.with_context(|| format!("{} line {}", path.display(), i + 2))?);
    }
    Ok(rows)
}

/// Read the consolidated artifact, join it with the registry file and write the enriched artifact.
#[instrument(level = "info", skip_all, fields(input = %consolidated.display()))]
pub fn enrich(
    consolidated: &Path,
    registry_path: &Path,
    output: &Path,
) -> Result<(Vec<EnrichedRecord>, EnrichmentReport)> {
    if !consolidated.exists() {
        return Err(EtlError::MissingArtifact(consolidated.to_path_buf()).into());
    }
    if !registry_path.exists() {
        return Err(EtlError::MissingArtifact(registry_path.to_path_buf()).into());
    }

    let facts = read_consolidated(consolidated)?;
    let registry = registry::load_registry(registry_path)?;
    let (rows, report) = join(facts, &registry);

    if report.invalid_tax_ids > 0 {
        warn!(
            invalid = report.invalid_tax_ids,
            total = report.rows,
            ratio = format!("{:.1}%", report.invalid_ratio * 100.0),
            "tax ids failing check digits"
        );
    }
    write_enriched(&rows, output)?;
    info!(
        rows = report.rows,
        matched = report.matched,
        unmatched = report.unmatched,
        output = %output.display(),
        "enrichment finished"
    );
    Ok((rows, report))
}
