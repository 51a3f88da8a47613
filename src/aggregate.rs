// src/aggregate.rs
use anyhow::{Context, Result};
use csv::WriterBuilder;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::model::{round2, AggregateRecord, EnrichedRecord};

/// Descriptive attributes an organization is grouped under.
type OrgKey = (String, String, String, String);
type QuarterKey = (Option<u16>, Option<u8>);

/// Sum, mean, population standard deviation and count of per-quarter totals.
///
/// The deviation is 0 when fewer than two quarters exist. Results are not rounded.
pub fn quarter_stats(totals: &[f64]) -> (f64, f64, f64, u32) {
    let n = totals.len();
    if n == 0 {
        return (0.0, 0.0, 0.0, 0);
    }
    let sum: f64 = totals.iter().sum();
    let mean = sum / n as f64;
    let stddev = if n < 2 {
        0.0
    } else {
        let var = totals.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n as f64;
        var.sqrt()
    };
    (sum, mean, stddev, n as u32)
}

/// Two-level aggregation: sum amounts within each quarter, then summarize across quarters.
pub fn aggregate(rows: &[EnrichedRecord]) -> Vec<AggregateRecord> {
    let mut quarterly: BTreeMap<OrgKey, BTreeMap<QuarterKey, f64>> = BTreeMap::new();
    for r in rows {
        let org = (
            r.organization_id.clone(),
            r.name.clone(),
            r.state.clone(),
            r.modality.clone(),
        );
        *quarterly
            .entry(org)
            .or_default()
            .entry((r.year, r.quarter))
            .or_insert(0.0) += r.amount;
    }

    let mut out: Vec<AggregateRecord> = quarterly
        .into_iter()
        .map(|((organization_id, name, state, modality), by_quarter)| {
            let totals: Vec<f64> = by_quarter.into_values().collect();
            let (total, mean, stddev, count) = quarter_stats(&totals);
            AggregateRecord {
                organization_id,
                name,
                state,
                modality,
                total_amount: round2(total),
                mean_quarterly: round2(mean),
                stddev: round2(stddev),
                quarter_count: count,
            }
        })
        .collect();

    out.sort_by(|a, b| {
        b.total_amount
            .total_cmp(&a.total_amount)
            .then_with(|| a.organization_id.cmp(&b.organization_id))
    });
    out
}

/// Aggregate and replace the aggregate artifact at `output`.
#[instrument(level = "info", skip(rows), fields(rows = rows.len()))]
pub fn run(rows: &[EnrichedRecord], output: &Path) -> Result<Vec<AggregateRecord>> {
    let aggregates = aggregate(rows);

    let mut tmp = output.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        let mut w = WriterBuilder::new()
            .delimiter(b';')
            .from_writer(BufWriter::new(file));
        for a in &aggregates {
            w.serialize(a).context("writing aggregate row")?;
        }
        w.flush()?;
    }
    fs::rename(&tmp, output)
        .with_context(|| format!("renaming {} to {}", tmp.display(), output.display()))?;

    info!(organizations = aggregates.len(), output = %output.display(), "aggregation finished");
    Ok(aggregates)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn enriched(org: &str, year: u16, quarter: u8, amount: f64) -> EnrichedRecord {
        EnrichedRecord {
            organization_id: org.to_string(),
            tax_id: "11222333000181".to_string(),
            name: format!("OPERADORA {org}"),
            quarter: Some(quarter),
            year: Some(year),
            account_code: "411111111".to_string(),
            description: "EVENTOS".to_string(),
            modality: "Cooperativa Médica".to_string(),
            state: "SP".to_string(),
            amount,
            trade_name: None,
            street: None,
            number: None,
            complement: None,
            district: None,
            city: None,
            postal_code: None,
            area_code: None,
            phone: None,
            fax: None,
            email: None,
            representative: None,
            representative_role: None,
            sales_region: None,
            registered_on: None,
            tax_id_valid: true,
        }
    }

    #[test]
    fn closed_form_three_quarters() {
        let rows = vec![
            enriched("1", 2024, 1, 100.0),
            enriched("1", 2024, 2, 200.0),
            enriched("1", 2024, 3, 300.0),
        ];
        let agg = aggregate(&rows);
        assert_eq!(agg.len(), 1);
        let a = &agg[0];
        assert_eq!(a.total_amount, 600.0);
        assert_eq!(a.mean_quarterly, 200.0);
        let expected = round2((20_000.0f64 / 3.0).sqrt());
        assert_eq!(a.stddev, expected);
        assert_eq!(a.stddev, 81.65);
        assert_eq!(a.quarter_count, 3);
    }

    #[test]
    fn rows_in_same_quarter_are_summed() {
        let rows = vec![
            enriched("1", 2024, 1, 40.0),
            enriched("1", 2024, 1, 60.0),
            enriched("1", 2024, 2, 300.0),
        ];
        let a = &aggregate(&rows)[0];
        assert_eq!(a.quarter_count, 2);
        assert_eq!(a.total_amount, 400.0);
        assert_eq!(a.mean_quarterly, 200.0);
        assert_eq!(a.stddev, 100.0);
    }

    #[test]
    fn single_quarter_has_zero_deviation() {
        let a = &aggregate(&[enriched("9", 2025, 1, 123.456)])[0];
        assert_eq!(a.stddev, 0.0);
        assert_eq!(a.total_amount, 123.46);
        assert_eq!(a.quarter_count, 1);
    }

    #[test]
    fn sorted_by_total_descending() {
        let rows = vec![
            enriched("small", 2024, 1, 1.0),
            enriched("big", 2024, 1, 1_000.0),
            enriched("mid", 2024, 1, 50.0),
        ];
        let ids: Vec<_> = aggregate(&rows).into_iter().map(|a| a.organization_id).collect();
        assert_eq!(ids, vec!["big", "mid", "small"]);
    }

    #[test]
    fn run_replaces_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("agg.csv");
        fs::write(&out, "stale content\n").unwrap();
        run(&[enriched("1", 2024, 1, 10.0)], &out).unwrap();
        let text = fs::read_to_string(&out).unwrap();
        assert!(!text.contains("stale"));
        assert_eq!(text.lines().count(), 2);
    }
}
