// src/reports/ask.rs
//! Free-text questions answered by generated SQL. The generator is an outside
//! collaborator; everything it returns passes through [`guard`] before it
//! reaches the connection.
use anyhow::Result;
use duckdb::types::Value;
use duckdb::Connection;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value as Json};
use tracing::{debug, info, warn};

/// What a generator answers when the question is outside the disclosure data.
pub const INVALID_QUERY: &str = "INVALID_QUERY";

pub const OFF_TOPIC_MESSAGE: &str =
    "Sorry, I can only answer questions about the financial data of health insurance operators.";
pub const NO_ROWS_MESSAGE: &str = "No record in the warehouse matches this question.";
pub const NULL_FIELD_MESSAGE: &str =
    "The record was found, but the requested information is empty in the warehouse.";

const FORBIDDEN: &[&str] = &[
    "DROP", "DELETE", "UPDATE", "INSERT", "TRUNCATE", "ALTER", "GRANT", "REVOKE", "CREATE",
    "EXEC", "EXECUTE", "ATTACH", "COPY", "PRAGMA", "INSTALL", "LOAD", "EXPORT", "IMPORT",
];

static FORBIDDEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b({})\b", FORBIDDEN.join("|"))).unwrap()
});

/// Column names that hold money; an all-null result on one of these means zero.
const MONETARY_TERMS: &[&str] = &["total", "amount", "valor", "sum", "soma", "expense", "despesa", "gasto"];

/// Turns a question into candidate SQL.
pub trait SqlGenerator {
    fn generate(&self, question: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    OffTopic,
    NotReadOnly,
    MultipleStatements,
    ForbiddenKeyword(String),
}

impl Rejection {
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::OffTopic => OFF_TOPIC_MESSAGE,
            Rejection::NotReadOnly => "Only read queries are allowed.",
            Rejection::MultipleStatements => "Invalid query: more than one statement.",
            Rejection::ForbiddenKeyword(_) => "The query contains a command that is not allowed.",
        }
    }
}

fn strip_fences(raw: &str) -> String {
    let mut sql = raw.trim().replace("```sql", "").replace("```SQL", "").replace("```", "");
    sql = sql.trim().to_string();
    if let Some(stripped) = sql.strip_suffix(';') {
        sql = stripped.trim_end().to_string();
    }
    sql
}

/// Clean generator output and accept it only if it is a single read query.
pub fn guard(raw: &str) -> std::result::Result<String, Rejection> {
    let sql = strip_fences(raw);
    if sql == INVALID_QUERY {
        return Err(Rejection::OffTopic);
    }
    let upper = sql.to_ascii_uppercase();
    if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
        return Err(Rejection::NotReadOnly);
    }
    if sql.contains(';') {
        return Err(Rejection::MultipleStatements);
    }
    if let Some(m) = FORBIDDEN_RE.find(&sql) {
        return Err(Rejection::ForbiddenKeyword(m.as_str().to_ascii_uppercase()));
    }
    Ok(sql)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Answer {
    Rejected {
        reason: String,
        message: String,
    },
    Empty {
        sql: String,
        message: String,
    },
    NullField {
        sql: String,
        message: String,
    },
    Zero {
        sql: String,
        rows: Vec<Map<String, Json>>,
    },
    Rows {
        sql: String,
        columns: Vec<String>,
        rows: Vec<Map<String, Json>>,
    },
}

fn to_json(v: Value) -> Json {
    match v {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::TinyInt(n) => n.into(),
        Value::SmallInt(n) => n.into(),
        Value::Int(n) => n.into(),
        Value::BigInt(n) => n.into(),
        Value::UTinyInt(n) => n.into(),
        Value::USmallInt(n) => n.into(),
        Value::UInt(n) => n.into(),
        Value::UBigInt(n) => n.into(),
        Value::HugeInt(n) => i64::try_from(n)
            .map(Json::from)
            .unwrap_or_else(|_| Json::String(n.to_string())),
        Value::Float(f) => serde_json::Number::from_f64(f64::from(f))
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Double(f) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Decimal(d) => {
            let text = d.to_string();
            text.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Json::Number)
                .unwrap_or(Json::String(text))
        }
        Value::Text(s) => Json::String(s),
        other => Json::String(format!("{:?}", other)),
    }
}

fn is_blank(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn is_monetary(column: &str) -> bool {
    let lower = column.to_lowercase();
    MONETARY_TERMS.iter().any(|t| lower.contains(t))
}

/// Run a guarded query and classify what came back.
pub fn execute(conn: &Connection, sql: &str) -> Result<Answer> {
    let mut stmt = conn.prepare(sql)?;
    let mut values: Vec<Vec<Json>> = Vec::new();
    {
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut record = Vec::new();
            for i in 0.. {
                match row.get::<_, Value>(i) {
                    Ok(v) => record.push(to_json(v)),
                    Err(duckdb::Error::InvalidColumnIndex(_)) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            values.push(record);
        }
    }
    let columns = stmt.column_names();
    debug!(rows = values.len(), columns = columns.len(), "query executed");

    if values.is_empty() {
        return Ok(Answer::Empty {
            sql: sql.to_string(),
            message: NO_ROWS_MESSAGE.to_string(),
        });
    }

    if values.iter().flatten().all(is_blank) {
        if columns.iter().any(|c| is_monetary(c)) {
            let mut zero = Map::new();
            zero.insert("result".to_string(), Json::from(0.0));
            return Ok(Answer::Zero {
                sql: sql.to_string(),
                rows: vec![zero],
            });
        }
        return Ok(Answer::NullField {
            sql: sql.to_string(),
            message: NULL_FIELD_MESSAGE.to_string(),
        });
    }

    let rows = values
        .into_iter()
        .map(|record| columns.iter().cloned().zip(record).collect::<Map<_, _>>())
        .collect();
    Ok(Answer::Rows {
        sql: sql.to_string(),
        columns,
        rows,
    })
}

/// Generate, guard and execute. Rejections are answers, not errors.
pub fn ask(conn: &Connection, generator: &dyn SqlGenerator, question: &str) -> Result<Answer> {
    let raw = generator.generate(question)?;
    let sql = match guard(&raw) {
        Ok(sql) => sql,
        Err(rejection) => {
            warn!(?rejection, "generated query rejected");
            return Ok(Answer::Rejected {
                reason: format!("{:?}", rejection),
                message: rejection.message().to_string(),
            });
        }
    };
    info!(%sql, "running generated query");
    execute(conn, &sql)
}
