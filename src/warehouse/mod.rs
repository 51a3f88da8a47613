// src/warehouse/mod.rs
pub mod load;
pub mod schema;

use anyhow::{Context, Result};
use duckdb::{AccessMode, Config as DuckConfig, Connection};
use tracing::{info, instrument, warn};

use crate::model::EnrichedRecord;

const IN_MEMORY: &str = ":memory:";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub organizations: usize,
    pub events: usize,
    pub aggregates: usize,
}

/// Read-write handle on the embedded store, owned by the load stage.
pub struct Warehouse {
    conn: Connection,
}

impl Warehouse {
    /// Open (or create) the database at `url`; `:memory:` gives a private in-memory store.
    pub fn open(url: &str) -> Result<Self> {
        let conn = if url == IN_MEMORY {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = std::path::Path::new(url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
            }
            Connection::open(url).with_context(|| format!("opening warehouse {}", url))?
        };
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(IN_MEMORY)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn init_schema(&self) -> Result<schema::SchemaReport> {
        schema::init(&self.conn)
    }

    /// Remove all rows, children first. Only done on operator request.
    pub fn reset(&self) -> Result<()> {
        for table in ["aggregates", "expense_events", "organizations"] {
            let n = self
                .conn
                .execute(&format!("DELETE FROM {}", table), [])
                .with_context(|| format!("clearing {}", table))?;
            warn!(table, rows = n, "table cleared");
        }
        Ok(())
    }

    /// Dimension, facts and aggregate recomputation in a single transaction.
    #[instrument(level = "info", skip(self, rows), fields(rows = rows.len()))]
    pub fn load(&mut self, rows: &[EnrichedRecord], batch_size: usize) -> Result<LoadReport> {
        let tx = self.conn.transaction()?;
        let organizations = load::load_organizations(&tx, rows, batch_size)
            .context("loading organizations")?;
        let events = load::load_events(&tx, rows, batch_size).context("loading expense events")?;
        let aggregates = load::materialize_aggregates(&tx)?;
        tx.commit().context("committing warehouse load")?;

        let report = LoadReport {
            organizations,
            events,
            aggregates,
        };
        info!(?report, "warehouse load committed");
        Ok(report)
    }
}

/// Read-only connection for the query side.
pub fn open_reader(url: &str) -> Result<Connection> {
    if url == IN_MEMORY {
        return Ok(Connection::open_in_memory()?);
    }
    let cfg = DuckConfig::default().access_mode(AccessMode::ReadOnly)?;
    Connection::open_with_flags(url, cfg).with_context(|| format!("opening {} read-only", url))
}
