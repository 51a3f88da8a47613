//! Read-side queries over the warehouse: listings, point lookups, market KPIs
//! and the dashboard bundle. Every function borrows a connection and never writes.

pub mod ask;

use anyhow::{Context, Result};
use duckdb::{params, params_from_iter, Connection};
use serde::Serialize;

use crate::cnpj;
use crate::model::INACTIVE_NAME;

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrganizationSummary {
    pub registry_id: String,
    pub tax_id: String,
    pub legal_name: Option<String>,
    pub modality: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub data: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpenseEvent {
    pub year: Option<i32>,
    pub quarter: Option<i32>,
    pub account_code: String,
    pub description: Option<String>,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedTotal {
    pub legal_name: Option<String>,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTotal {
    pub state: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketStats {
    pub total: f64,
    pub mean_per_organization: f64,
    pub top_organizations: Vec<NamedTotal>,
    pub by_state: Vec<StateTotal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MacroKpis {
    pub total_expenses: f64,
    pub mean_per_organization: f64,
    pub active_organizations: i64,
    /// Change between the first and the last observed quarter, in percent.
    pub trend_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mover {
    pub legal_name: Option<String>,
    pub growth_percent: f64,
    pub final_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateEfficiency {
    pub state: String,
    pub total: f64,
    pub organizations: i64,
    pub mean_per_organization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistentPerformer {
    pub legal_name: Option<String>,
    pub state: Option<String>,
    pub quarters_above_average: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub macro_kpis: MacroKpis,
    pub top_movers: Vec<Mover>,
    pub states: Vec<StateEfficiency>,
    pub consistent: Vec<ConsistentPerformer>,
}

/// Page through organizations ordered by name, optionally filtered by a
/// case-insensitive fragment of the name or tax id.
pub fn list_organizations(
    conn: &Connection,
    page: u32,
    limit: u32,
    search: Option<&str>,
) -> Result<Page<OrganizationSummary>> {
    let page = page.max(1);
    let limit = limit.clamp(1, MAX_PAGE_SIZE);
    let offset = i64::from(page - 1) * i64::from(limit);

    let pattern = search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s));
    let filter = if pattern.is_some() {
        " WHERE legal_name ILIKE ? OR tax_id ILIKE ?"
    } else {
        ""
    };
    let filter_args: Vec<String> = pattern.into_iter().flat_map(|p| [p.clone(), p]).collect();

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM organizations{}", filter),
            params_from_iter(filter_args.iter()),
            |r| r.get(0),
        )
        .context("counting organizations")?;

    let mut stmt = conn.prepare(&format!(
        "SELECT registry_id, tax_id, legal_name, modality, state
         FROM organizations{}
         ORDER BY legal_name, registry_id
         LIMIT {} OFFSET {}",
        filter, limit, offset
    ))?;
    let data = stmt
        .query_map(params_from_iter(filter_args.iter()), |r| {
            Ok(OrganizationSummary {
                registry_id: r.get(0)?,
                tax_id: r.get(1)?,
                legal_name: r.get(2)?,
                modality: r.get(3)?,
                state: r.get(4)?,
            })
        })?
        .collect::<duckdb::Result<Vec<_>>>()?;

    Ok(Page {
        total,
        page,
        limit,
        data,
    })
}

/// Lookup by tax id, written either as bare digits or punctuated (`11.222.333/0001-81`).
pub fn organization_by_tax_id(conn: &Connection, tax_id: &str) -> Result<Option<OrganizationSummary>> {
    let digits: String = tax_id.chars().filter(char::is_ascii_digit).collect();
    let punctuated = cnpj::format(&digits);
    let mut stmt = conn.prepare(
        "SELECT registry_id, tax_id, legal_name, modality, state
         FROM organizations WHERE tax_id IN (?, ?, ?)
         ORDER BY registry_id
         LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![tax_id.trim(), digits, punctuated], |r| {
        Ok(OrganizationSummary {
            registry_id: r.get(0)?,
            tax_id: r.get(1)?,
            legal_name: r.get(2)?,
            modality: r.get(3)?,
            state: r.get(4)?,
        })
    })?;
    Ok(rows.next().transpose()?)
}

/// Every event of the organization, newest quarter first. `None` if the tax id is unknown.
pub fn expense_history(conn: &Connection, tax_id: &str) -> Result<Option<Vec<ExpenseEvent>>> {
    let Some(org) = organization_by_tax_id(conn, tax_id)? else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT year, quarter, account_code, description, amount
         FROM expense_events
         WHERE registry_id = ?
         ORDER BY year DESC, quarter DESC, amount DESC",
    )?;
    let events = stmt
        .query_map(params![org.registry_id], |r| {
            Ok(ExpenseEvent {
                year: r.get(0)?,
                quarter: r.get(1)?,
                account_code: r.get(2)?,
                description: r.get(3)?,
                amount: r.get(4)?,
            })
        })?
        .collect::<duckdb::Result<Vec<_>>>()?;
    Ok(Some(events))
}

fn state_totals(conn: &Connection) -> Result<Vec<StateTotal>> {
    let mut stmt = conn.prepare(
        "SELECT o.state, SUM(e.amount) AS total
         FROM expense_events e
         JOIN organizations o ON o.registry_id = e.registry_id
         WHERE o.state IS NOT NULL
         GROUP BY o.state
         ORDER BY total DESC",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(StateTotal {
                state: r.get(0)?,
                total: r.get(1)?,
            })
        })?
        .collect::<duckdb::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn market_stats(conn: &Connection) -> Result<MarketStats> {
    let (total, orgs): (Option<f64>, i64) = conn.query_row(
        "SELECT SUM(amount), COUNT(DISTINCT registry_id) FROM expense_events",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let total = total.unwrap_or(0.0);
    let mean_per_organization = if orgs > 0 { total / orgs as f64 } else { 0.0 };

    let mut stmt = conn.prepare(
        "SELECT o.legal_name, SUM(e.amount) AS total
         FROM expense_events e
         JOIN organizations o ON o.registry_id = e.registry_id
         GROUP BY o.legal_name
         ORDER BY total DESC
         LIMIT 5",
    )?;
    let top_organizations = stmt
        .query_map([], |r| {
            Ok(NamedTotal {
                legal_name: r.get(0)?,
                total: r.get(1)?,
            })
        })?
        .collect::<duckdb::Result<Vec<_>>>()?;

    Ok(MarketStats {
        total,
        mean_per_organization,
        top_organizations,
        by_state: state_totals(conn)?,
    })
}

const PERIOD_BOUNDS: &str = "
    bounds AS (
        SELECT MIN(year * 10 + quarter) AS first_p, MAX(year * 10 + quarter) AS last_p
        FROM expense_events
    )";

fn macro_kpis(conn: &Connection) -> Result<MacroKpis> {
    let sql = format!(
        "WITH {PERIOD_BOUNDS}
         SELECT SUM(e.amount),
                COUNT(DISTINCT e.registry_id),
                SUM(CASE WHEN e.year * 10 + e.quarter = b.first_p THEN e.amount ELSE 0 END),
                SUM(CASE WHEN e.year * 10 + e.quarter = b.last_p THEN e.amount ELSE 0 END)
         FROM expense_events e, bounds b"
    );
    let (total, active, first, last): (Option<f64>, i64, Option<f64>, Option<f64>) =
        conn.query_row(&sql, [], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?;

    let total = total.unwrap_or(0.0);
    let first = first.unwrap_or(0.0);
    let last = last.unwrap_or(0.0);
    Ok(MacroKpis {
        total_expenses: total,
        mean_per_organization: if active > 0 { total / active as f64 } else { 0.0 },
        active_organizations: active,
        trend_percent: if first > 0.0 {
            (last - first) / first * 100.0
        } else {
            0.0
        },
    })
}

fn top_movers(conn: &Connection) -> Result<Vec<Mover>> {
    let sql = format!(
        "WITH {PERIOD_BOUNDS},
         first_q AS (
            SELECT e.registry_id, SUM(e.amount) AS v
            FROM expense_events e, bounds b
            WHERE e.year * 10 + e.quarter = b.first_p
            GROUP BY e.registry_id
         ),
         last_q AS (
            SELECT e.registry_id, SUM(e.amount) AS v
            FROM expense_events e, bounds b
            WHERE e.year * 10 + e.quarter = b.last_p
            GROUP BY e.registry_id
         )
         SELECT o.legal_name,
                ROUND((l.v - f.v) / f.v * 100, 2) AS growth,
                l.v
         FROM organizations o
         JOIN first_q f ON f.registry_id = o.registry_id
         JOIN last_q l ON l.registry_id = o.registry_id
         WHERE f.v > 0
         ORDER BY growth DESC, o.legal_name
         LIMIT 5"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Mover {
                legal_name: r.get(0)?,
                growth_percent: r.get(1)?,
                final_total: r.get(2)?,
            })
        })?
        .collect::<duckdb::Result<Vec<_>>>()?;
    Ok(rows)
}

fn state_efficiency(conn: &Connection) -> Result<Vec<StateEfficiency>> {
    let mut stmt = conn.prepare(
        "SELECT o.state,
                SUM(e.amount) AS total,
                COUNT(DISTINCT o.registry_id) AS orgs,
                SUM(e.amount) / COUNT(DISTINCT o.registry_id) AS mean_per_org
         FROM expense_events e
         JOIN organizations o ON o.registry_id = e.registry_id
         WHERE o.state IS NOT NULL
         GROUP BY o.state
         ORDER BY total DESC
         LIMIT 10",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(StateEfficiency {
                state: r.get(0)?,
                total: r.get(1)?,
                organizations: r.get(2)?,
                mean_per_organization: r.get(3)?,
            })
        })?
        .collect::<duckdb::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Organizations whose quarterly total beats that quarter's cross-organization
/// average in at least two quarters. The inactive sentinel is never listed.
fn consistent_performers(conn: &Connection) -> Result<Vec<ConsistentPerformer>> {
    let mut stmt = conn.prepare(
        "WITH per_period AS (
            SELECT year, quarter, AVG(total) AS avg_total
            FROM quarterly_totals
            GROUP BY year, quarter
         ),
         wins AS (
            SELECT q.registry_id, q.legal_name, q.state,
                   CASE WHEN q.total > a.avg_total THEN 1 ELSE 0 END AS win
            FROM quarterly_totals q
            JOIN per_period a ON a.year = q.year AND a.quarter = q.quarter
         )
         SELECT legal_name, state, CAST(SUM(win) AS BIGINT) AS quarters_above
         FROM wins
         WHERE legal_name IS DISTINCT FROM ?
         GROUP BY registry_id, legal_name, state
         HAVING SUM(win) >= 2
         ORDER BY quarters_above DESC, legal_name
         LIMIT 50",
    )?;
    let rows = stmt
        .query_map(params![INACTIVE_NAME], |r| {
            Ok(ConsistentPerformer {
                legal_name: r.get(0)?,
                state: r.get(1)?,
                quarters_above_average: r.get(2)?,
            })
        })?
        .collect::<duckdb::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn dashboard(conn: &Connection) -> Result<Dashboard> {
    Ok(Dashboard {
        macro_kpis: macro_kpis(conn).context("macro KPIs")?,
        top_movers: top_movers(conn).context("top movers")?,
        states: state_efficiency(conn).context("state ranking")?,
        consistent: consistent_performers(conn).context("consistency ranking")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::enriched;
    use crate::model::EnrichedRecord;
    use crate::warehouse::Warehouse;

    fn org(id: &str, name: &str, tax: &str, state: &str, year: u16, quarter: u8, amount: f64) -> EnrichedRecord {
        let mut r = enriched(id, year, quarter, amount);
        r.name = name.to_string();
        r.tax_id = tax.to_string();
        r.state = state.to_string();
        r
    }

    fn fixture() -> Warehouse {
        let rows = vec![
            org("1", "ALFA SAUDE", "11.222.333/0001-81", "SP", 2024, 1, 100.0),
            org("1", "ALFA SAUDE", "11.222.333/0001-81", "SP", 2024, 2, 300.0),
            org("1", "ALFA SAUDE", "11.222.333/0001-81", "SP", 2024, 3, 500.0),
            org("2", "BETA PLANOS", "19.131.243/0001-97", "RJ", 2024, 1, 50.0),
            org("2", "BETA PLANOS", "19.131.243/0001-97", "RJ", 2024, 3, 40.0),
            org("3", INACTIVE_NAME, "", "ND", 2024, 1, 900.0),
            org("3", INACTIVE_NAME, "", "ND", 2024, 2, 900.0),
            org("3", INACTIVE_NAME, "", "ND", 2024, 3, 900.0),
        ];
        let mut wh = Warehouse::in_memory().unwrap();
        wh.init_schema().unwrap();
        wh.load(&rows, 100).unwrap();
        wh
    }

    #[test]
    fn listing_paginates_and_searches() {
        let wh = fixture();
        let conn = wh.connection();

        let all = list_organizations(conn, 1, 2, None).unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.data.len(), 2);
        assert_eq!(all.data[0].legal_name.as_deref(), Some("ALFA SAUDE"));

        let second = list_organizations(conn, 2, 2, None).unwrap();
        assert_eq!(second.data.len(), 1);

        let hit = list_organizations(conn, 1, 10, Some("beta")).unwrap();
        assert_eq!(hit.total, 1);
        assert_eq!(hit.data[0].registry_id, "2");

        let by_tax = list_organizations(conn, 1, 10, Some("0001-81")).unwrap();
        assert_eq!(by_tax.total, 1);

        let clamped = list_organizations(conn, 0, 1_000, None).unwrap();
        assert_eq!((clamped.page, clamped.limit), (1, MAX_PAGE_SIZE));
    }

    #[test]
    fn lookup_and_history() {
        let wh = fixture();
        let conn = wh.connection();

        let o = organization_by_tax_id(conn, "19.131.243/0001-97").unwrap().unwrap();
        assert_eq!(o.registry_id, "2");
        assert!(organization_by_tax_id(conn, "nope").unwrap().is_none());

        let hist = expense_history(conn, "11.222.333/0001-81").unwrap().unwrap();
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[0].quarter, Some(3));
        assert!(expense_history(conn, "nope").unwrap().is_none());
    }

    #[test]
    fn lookup_accepts_bare_or_punctuated_tax_id() {
        let bare = org("9", "GAMA", "11222333000181", "MG", 2024, 1, 10.0);
        let mut wh = Warehouse::in_memory().unwrap();
        wh.init_schema().unwrap();
        wh.load(&[bare], 10).unwrap();
        let conn = wh.connection();

        let a = organization_by_tax_id(conn, "11.222.333/0001-81").unwrap().unwrap();
        let b = organization_by_tax_id(conn, "11222333000181").unwrap().unwrap();
        assert_eq!(a, b);

        let wh = fixture();
        let c = organization_by_tax_id(wh.connection(), "19131243000197").unwrap().unwrap();
        assert_eq!(c.registry_id, "2");
    }

    #[test]
    fn consistency_ranking_reads_the_quarterly_view() {
        let wh = fixture();
        let conn = wh.connection();
        let view_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM quarterly_totals", [], |r| r.get(0))
            .unwrap();
        assert_eq!(view_rows, 8);

        conn.execute_batch("DROP VIEW quarterly_totals").unwrap();
        assert!(dashboard(conn).is_err());
    }

    #[test]
    fn market_kpis() {
        let wh = fixture();
        let stats = market_stats(wh.connection()).unwrap();
        assert_eq!(stats.total, 3690.0);
        assert_eq!(stats.mean_per_organization, 1230.0);
        assert_eq!(stats.top_organizations[0].legal_name.as_deref(), Some(INACTIVE_NAME));
        assert_eq!(stats.by_state.len(), 3);
    }

    #[test]
    fn dashboard_bundle() {
        let wh = fixture();
        let d = dashboard(wh.connection()).unwrap();

        // first quarter 1050, last quarter 1440
        assert!((d.macro_kpis.trend_percent - (390.0 / 1050.0 * 100.0)).abs() < 1e-9);
        assert_eq!(d.macro_kpis.active_organizations, 3);

        assert_eq!(d.top_movers[0].legal_name.as_deref(), Some("ALFA SAUDE"));
        assert_eq!(d.top_movers[0].growth_percent, 400.0);

        assert_eq!(d.states[0].state, "ND");

        // ALFA beats the average in Q3 only, the sentinel wins every quarter but is excluded
        assert!(d.consistent.is_empty());
    }

    #[test]
    fn consistency_needs_two_winning_quarters() {
        let rows = vec![
            org("10", "GAMA", "1", "MG", 2025, 1, 100.0),
            org("10", "GAMA", "1", "MG", 2025, 2, 100.0),
            org("11", "DELTA", "2", "MG", 2025, 1, 10.0),
            org("11", "DELTA", "2", "MG", 2025, 2, 10.0),
        ];
        let mut wh = Warehouse::in_memory().unwrap();
        wh.init_schema().unwrap();
        wh.load(&rows, 100).unwrap();

        let d = dashboard(wh.connection()).unwrap();
        assert_eq!(d.consistent.len(), 1);
        assert_eq!(d.consistent[0].legal_name.as_deref(), Some("GAMA"));
        assert_eq!(d.consistent[0].quarters_above_average, 2);
        assert_eq!(d.macro_kpis.trend_percent, 0.0);
    }
}
