// src/warehouse/load.rs
use anyhow::{Context, Result};
use duckdb::{params, Connection};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::consolidate::normalize::strip_float_suffix;
use crate::model::{EnrichedRecord, NULL_TAX_ID};

/// Canonical organization key for the store: no `.0`, no leading zeros,
/// and `"0"` for anything that is not an integer.
pub fn standardize_id(raw: &str) -> String {
    strip_float_suffix(raw)
        .parse::<i64>()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| "0".to_string())
}

/// Append one dimension row per organization (first occurrence wins).
pub fn load_organizations(conn: &Connection, rows: &[EnrichedRecord], batch_size: usize) -> Result<usize> {
    let mut seen = HashSet::new();
    let mut app = conn.appender("organizations")?;
    let mut n = 0usize;
    for r in rows {
        let key = standardize_id(&r.organization_id);
        if !seen.insert(key.clone()) {
            continue;
        }
        let tax_id = match r.tax_id.trim() {
            "" => NULL_TAX_ID,
            t => t,
        };
        app.append_row(params![
            key,
            tax_id,
            r.name,
            r.trade_name,
            r.modality,
            r.state,
            r.street,
            r.number,
            r.complement,
            r.district,
            r.city,
            r.postal_code,
            r.area_code,
            r.phone,
            r.fax,
            r.email,
            r.representative,
            r.representative_role,
            r.sales_region,
            r.registered_on,
        ])
        .with_context(|| format!("appending organization {}", r.organization_id))?;
        n += 1;
        if n % batch_size.max(1) == 0 {
            app.flush()?;
        }
    }
    app.flush().context("flushing organizations")?;
    debug!(organizations = n, "dimension appended");
    Ok(n)
}

/// Append every fact row. Ids continue after the current maximum.
pub fn load_events(conn: &Connection, rows: &[EnrichedRecord], batch_size: usize) -> Result<usize> {
    let start: i64 = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM expense_events", [], |r| r.get(0))?;
    let mut app = conn.appender("expense_events")?;
    for (i, r) in rows.iter().enumerate() {
        let id = start + i as i64 + 1;
        app.append_row(params![
            id,
            standardize_id(&r.organization_id),
            r.year.map(i32::from),
            r.quarter.map(i32::from),
            r.account_code,
            r.description,
            r.amount,
        ])
        .with_context(|| format!("appending expense event {}", id))?;
        if (i + 1) % batch_size.max(1) == 0 {
            app.flush()?;
            debug!(rows = i + 1, "fact batch flushed");
        }
    }
    app.flush().context("flushing expense events")?;
    Ok(rows.len())
}

/// Truncate-and-recompute of the aggregate table from the persisted facts.
///
/// Same definition as [`crate::aggregate::aggregate`]: sum per quarter, then
/// total, mean, population deviation and count across quarters, rounded to cents.
pub const MATERIALIZE_SQL: &str = "
    INSERT INTO aggregates (registry_id, total_amount, mean_quarterly, stddev, quarter_count, computed_at)
    WITH quarterly AS (
        SELECT registry_id, year, quarter, SUM(amount) AS total
        FROM expense_events
        GROUP BY registry_id, year, quarter
    )
    SELECT registry_id,
           ROUND(COALESCE(SUM(total), 0), 2),
           ROUND(COALESCE(AVG(total), 0), 2),
           ROUND(COALESCE(STDDEV_POP(total), 0), 2),
           COUNT(*),
           CAST(current_timestamp AS TIMESTAMP)
    FROM quarterly
    GROUP BY registry_id
    ORDER BY registry_id";

pub fn materialize_aggregates(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM aggregates", [])
        .context("truncating aggregates")?;
    let n = conn
        .execute(MATERIALIZE_SQL, [])
        .context("recomputing aggregates")?;
    info!(organizations = n, "aggregates materialized");
    Ok(n)
}
