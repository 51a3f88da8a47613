// src/consolidate/normalize.rs

/// Canonical columns the consolidator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    OrganizationId,
    AccountCode,
    Description,
    Amount,
    TaxId,
    Name,
    Year,
    Quarter,
}

/// Source header → canonical field. Headers are compared after trim + uppercase.
pub const COLUMN_RENAMES: &[(&str, Field)] = &[
    ("REG_ANS", Field::OrganizationId),
    ("CD_CONTA_CONTABIL", Field::AccountCode),
    ("DESCRICAO", Field::Description),
    ("VL_SALDO_FINAL", Field::Amount),
    ("NR_CNPJ", Field::TaxId),
    ("NO_RAZAO_SOCIAL", Field::Name),
    ("ANO", Field::Year),
    ("TRIMESTRE", Field::Quarter),
];

pub const ACCOUNT_CODE_LEN: usize = 9;

pub fn canonical_field(header: &str) -> Option<Field> {
    let h = header.trim().trim_start_matches('\u{feff}').to_uppercase();
    COLUMN_RENAMES
        .iter()
        .find(|(src, _)| *src == h)
        .map(|(_, f)| *f)
}

/// Column index of every recognised field; the first matching header wins.
#[derive(Debug, Default, Clone)]
pub struct ColumnMap {
    indices: Vec<(Field, usize)>,
}

impl ColumnMap {
    pub fn from_headers<'a, I: IntoIterator<Item = &'a str>>(headers: I) -> Self {
        let mut indices: Vec<(Field, usize)> = Vec::new();
        for (i, h) in headers.into_iter().enumerate() {
            if let Some(f) = canonical_field(h) {
                if !indices.iter().any(|(seen, _)| *seen == f) {
                    indices.push((f, i));
                }
            }
        }
        Self { indices }
    }

    pub fn get(&self, field: Field) -> Option<usize> {
        self.indices
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, i)| *i)
    }

    pub fn has(&self, field: Field) -> bool {
        self.get(field).is_some()
    }
}

/// Expense sub-ledger rule: exactly nine characters and a configured prefix.
pub fn account_matches(code: &str, prefixes: &[String]) -> bool {
    code.chars().count() == ACCOUNT_CODE_LEN && prefixes.iter().any(|p| code.starts_with(p.as_str()))
}

/// Parse a pt-BR amount ("1.234,56"). Returns `None` for blanks, junk, NaN and zero.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace('.', "").replace(',', ".");
    if cleaned.is_empty() {
        return None;
    }
    let v: f64 = cleaned.parse().ok()?;
    (v.is_finite() && v != 0.0).then_some(v)
}

/// Drop the `.0` a spreadsheet round-trip leaves on integer ids.
pub fn strip_float_suffix(raw: &str) -> String {
    let t = raw.trim();
    t.strip_suffix(".0").unwrap_or(t).to_string()
}

pub fn parse_year(raw: &str) -> Option<u16> {
    let t = strip_float_suffix(raw);
    let y: u16 = t.parse().ok()?;
    (1900..=2999).contains(&y).then_some(y)
}

/// Accepts "3", "3.0", "3T" and "3º".
pub fn parse_quarter(raw: &str) -> Option<u8> {
    let t = strip_float_suffix(raw);
    let digits: String = t.chars().take_while(|c| c.is_ascii_digit()).collect();
    let q: u8 = digits.parse().ok()?;
    (1..=4).contains(&q).then_some(q)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_and_space_insensitive() {
        assert_eq!(canonical_field(" reg_ans "), Some(Field::OrganizationId));
        assert_eq!(canonical_field("\u{feff}REG_ANS"), Some(Field::OrganizationId));
        assert_eq!(canonical_field("Vl_Saldo_Final"), Some(Field::Amount));
        assert_eq!(canonical_field("VL_SALDO_INICIAL"), None);
    }

    #[test]
    fn column_map_keeps_first_duplicate() {
        let map = ColumnMap::from_headers(["DATA", "REG_ANS", "CD_CONTA_CONTABIL", "reg_ans"]);
        assert_eq!(map.get(Field::OrganizationId), Some(1));
        assert_eq!(map.get(Field::AccountCode), Some(2));
        assert!(!map.has(Field::Amount));
    }

    #[test]
    fn account_rule() {
        let p = vec!["41".to_string()];
        assert!(account_matches("411111111", &p));
        assert!(!account_matches("41111111", &p));
        assert!(!account_matches("4111111111", &p));
        assert!(!account_matches("311111111", &p));
        let p2 = vec!["41".to_string(), "46".to_string()];
        assert!(account_matches("461000000", &p2));
    }

    #[test]
    fn amounts_in_brazilian_locale() {
        assert_eq!(parse_amount("1.234,56"), Some(1234.56));
        assert_eq!(parse_amount(" -10,5 "), Some(-10.5));
        assert_eq!(parse_amount("1000"), Some(1000.0));
        assert_eq!(parse_amount("0,00"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount("NaN"), None);
    }

    #[test]
    fn ids_and_periods() {
        assert_eq!(strip_float_suffix("5711.0"), "5711");
        assert_eq!(strip_float_suffix(" 005711 "), "005711");
        assert_eq!(strip_float_suffix("5711.05"), "5711.05");
        assert_eq!(parse_year("2025"), Some(2025));
        assert_eq!(parse_year("2025.0"), Some(2025));
        assert_eq!(parse_year("25"), None);
        assert_eq!(parse_quarter("3T"), Some(3));
        assert_eq!(parse_quarter("2.0"), Some(2));
        assert_eq!(parse_quarter("5"), None);
    }
}
