// src/model.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name given to organizations that have financial facts but no registry entry.
/// Downstream analytics exclude it from "consistently above average" lists.
pub const INACTIVE_NAME: &str = "OPERADORA INATIVA/DESCONHECIDA";
pub const UNKNOWN_MODALITY: &str = "Desconhecida";
pub const UNKNOWN_STATE: &str = "ND";
/// Stored in the dimension table when no tax id is known.
pub const NULL_TAX_ID: &str = "00.000.000/0000-00";

/// A reporting period: calendar year plus quarter (1..=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    pub year: u16,
    pub quarter: u8,
}

impl Period {
    pub fn new(year: u16, quarter: u8) -> Self {
        Self { year, quarter }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}T{}", self.quarter, self.year)
    }
}

/// Normalized financial fact, one per expense event.
///
/// Invariants (enforced by the consolidator): `account_code` has exactly nine
/// characters and starts with a configured prefix, `amount` is finite and
/// non-zero, `organization_id` carries no `.0` float suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRecord {
    pub organization_id: String,
    pub tax_id: String,
    pub name: String,
    pub quarter: Option<u8>,
    pub year: Option<u16>,
    pub account_code: String,
    pub description: String,
    pub modality: String,
    pub amount: f64,
}

impl ConsolidatedRecord {
    pub const HEADER: [&'static str; 9] = [
        "organization_id",
        "tax_id",
        "name",
        "quarter",
        "year",
        "account_code",
        "description",
        "modality",
        "amount",
    ];
}

/// One organization from the authoritative cadastre.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryRecord {
    pub registry_id: String,
    pub tax_id: Option<String>,
    pub legal_name: Option<String>,
    pub trade_name: Option<String>,
    pub state: Option<String>,
    pub modality: Option<String>,
    pub street: Option<String>,
    pub number: Option<String>,
    pub complement: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub area_code: Option<String>,
    pub phone: Option<String>,
    pub fax: Option<String>,
    pub email: Option<String>,
    pub representative: Option<String>,
    pub representative_role: Option<String>,
    pub sales_region: Option<String>,
    pub registered_on: Option<String>,
}

/// A consolidated fact left-joined with its registry entry (if any).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub organization_id: String,
    pub tax_id: String,
    pub name: String,
    pub quarter: Option<u8>,
    pub year: Option<u16>,
    pub account_code: String,
    pub description: String,
    pub modality: String,
    pub state: String,
    pub amount: f64,
    pub trade_name: Option<String>,
    pub street: Option<String>,
    pub number: Option<String>,
    pub complement: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub area_code: Option<String>,
    pub phone: Option<String>,
    pub fax: Option<String>,
    pub email: Option<String>,
    pub representative: Option<String>,
    pub representative_role: Option<String>,
    pub sales_region: Option<String>,
    pub registered_on: Option<String>,
    pub tax_id_valid: bool,
}

impl EnrichedRecord {
    pub fn period(&self) -> Option<Period> {
        match (self.year, self.quarter) {
            (Some(y), Some(q)) => Some(Period::new(y, q)),
            _ => None,
        }
    }
}

/// Per-organization statistics across quarters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub organization_id: String,
    pub name: String,
    pub state: String,
    pub modality: String,
    pub total_amount: f64,
    pub mean_quarterly: f64,
    pub stddev: f64,
    pub quarter_count: u32,
}

/// Round half away from zero to two decimal places.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
