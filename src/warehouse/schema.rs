// src/warehouse/schema.rs
use anyhow::Result;
use duckdb::Connection;
use tracing::{debug, error, info, warn};

use crate::error::EtlError;

/// DDL applied one statement at a time. Plain `CREATE`/`DROP` are used so a
/// rerun exercises the tolerated-error path rather than hiding behind `IF EXISTS`.
pub const STATEMENTS: &[&str] = &[
    "CREATE SEQUENCE aggregates_id_seq START 1",
    "CREATE TABLE organizations (
        registry_id         VARCHAR PRIMARY KEY,
        tax_id              VARCHAR NOT NULL,
        legal_name          VARCHAR,
        trade_name          VARCHAR,
        modality            VARCHAR,
        state               VARCHAR,
        street              VARCHAR,
        number              VARCHAR,
        complement          VARCHAR,
        district            VARCHAR,
        city                VARCHAR,
        postal_code         VARCHAR,
        area_code           VARCHAR,
        phone               VARCHAR,
        fax                 VARCHAR,
        email               VARCHAR,
        representative      VARCHAR,
        representative_role VARCHAR,
        sales_region        VARCHAR,
        registered_on       VARCHAR
    )",
    "CREATE TABLE expense_events (
        id           BIGINT PRIMARY KEY,
        registry_id  VARCHAR NOT NULL REFERENCES organizations(registry_id),
        year         INTEGER,
        quarter      INTEGER,
        account_code VARCHAR NOT NULL,
        description  VARCHAR,
        amount       DOUBLE NOT NULL
    )",
    "CREATE TABLE aggregates (
        id             BIGINT PRIMARY KEY DEFAULT nextval('aggregates_id_seq'),
        registry_id    VARCHAR NOT NULL REFERENCES organizations(registry_id),
        total_amount   DOUBLE NOT NULL,
        mean_quarterly DOUBLE NOT NULL,
        stddev         DOUBLE NOT NULL,
        quarter_count  INTEGER NOT NULL,
        computed_at    TIMESTAMP NOT NULL
    )",
    "CREATE INDEX idx_expense_events_registry ON expense_events(registry_id)",
    "CREATE INDEX idx_expense_events_period ON expense_events(year, quarter)",
    "DROP VIEW quarterly_totals",
    "CREATE VIEW quarterly_totals AS
        SELECT e.registry_id, o.legal_name, o.state, o.modality, e.year, e.quarter,
               SUM(e.amount) AS total
        FROM expense_events e
        JOIN organizations o ON o.registry_id = e.registry_id
        GROUP BY e.registry_id, o.legal_name, o.state, o.modality, e.year, e.quarter",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Drop,
    Other,
}

/// Leading keyword of a statement, ignoring `--` comment lines.
pub fn verb(statement: &str) -> Verb {
    let first = statement
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("--"))
        .flat_map(str::split_whitespace)
        .next()
        .unwrap_or("");
    match first.to_ascii_uppercase().as_str() {
        "CREATE" => Verb::Create,
        "DROP" => Verb::Drop,
        _ => Verb::Other,
    }
}

/// Idempotency noise: a catalog error saying a created object already exists
/// or a dropped object is absent.
pub fn is_benign(statement: &str, message: &str) -> bool {
    if !message.contains("Catalog Error") {
        return false;
    }
    match verb(statement) {
        Verb::Create => message.contains("already exists"),
        Verb::Drop => message.contains("does not exist"),
        Verb::Other => false,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchemaReport {
    pub applied: usize,
    pub tolerated: usize,
}

fn head(statement: &str) -> String {
    statement.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}

/// Apply `statements` in order. Tolerated errors are logged; every other
/// failure is logged, the loop moves on, and the failures are returned at the end.
pub fn apply(conn: &Connection, statements: &[&str]) -> Result<SchemaReport> {
    let mut report = SchemaReport::default();
    let mut failures = Vec::new();
    for stmt in statements {
        match conn.execute_batch(stmt) {
            Ok(()) => {
                debug!(statement = %head(stmt), "applied");
                report.applied += 1;
            }
            Err(e) => {
                let msg = e.to_string();
                if is_benign(stmt, &msg) {
                    warn!(statement = %head(stmt), error = %msg, "ignoring idempotency error");
                    report.tolerated += 1;
                } else {
                    error!(statement = %head(stmt), error = %msg, "schema statement failed");
                    failures.push(format!("{}: {}", head(stmt), msg));
                }
            }
        }
    }
    if !failures.is_empty() {
        return Err(EtlError::SchemaInit { failures }.into());
    }
    info!(applied = report.applied, tolerated = report.tolerated, "schema ready");
    Ok(report)
}

pub fn init(conn: &Connection) -> Result<SchemaReport> {
    apply(conn, STATEMENTS)
}
