// src/config.rs

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

use crate::fetch::http::RetryPolicy;

const DEFAULT_BASE_URL: &str = "https://dadosabertos.ans.gov.br/FTP/PDA/demonstracoes_contabeis/";
const DEFAULT_REGISTRY_URL: &str =
    "https://dadosabertos.ans.gov.br/FTP/PDA/operadoras_de_plano_de_saude_ativas/Relatorio_cadop.csv";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Full run configuration. Every field has a default, so an empty YAML file
/// (or no file at all) yields a working setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub http: HttpConfig,
    pub paths: PathsConfig,
    pub etl: EtlConfig,
    pub warehouse: WarehouseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub registry_url: String,
    /// How many distinct (year, quarter) periods to download.
    pub quarters_limit: usize,
    /// How many of the newest year directories to scan.
    pub years_scanned: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_factor_ms: u64,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub chunk_size: usize,
    pub account_prefixes: Vec<String>,
    pub compress_outputs: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Read-write database location.
    pub url: String,
    /// Read-only location for the query side; falls back to `url`.
    pub reader_url: Option<String>,
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            http: HttpConfig::default(),
            paths: PathsConfig::default(),
            etl: EtlConfig::default(),
            warehouse: WarehouseConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            quarters_limit: 3,
            years_scanned: 3,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_retries: 3,
            backoff_factor_ms: 1_000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_invalid_certs: true,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50_000,
            account_prefixes: vec!["41".to_string()],
            compress_outputs: true,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            url: "data/warehouse.duckdb".to_string(),
            reader_url: None,
            batch_size: 5_000,
        }
    }
}

impl Config {
    /// Load from an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let text = fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                Self::from_yaml(&text).with_context(|| format!("parsing config {}", p.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env(|k| env::var(k).ok());
        info!(data_dir = %cfg.paths.data_dir.display(), warehouse = %cfg.warehouse.url, "configuration loaded");
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Environment wins over file values. `lookup` is injectable for tests.
    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(v) = lookup("DATABASE_URL") {
            debug!("DATABASE_URL override");
            self.warehouse.url = v;
        }
        if let Some(v) = lookup("DATABASE_URL_READER") {
            self.warehouse.reader_url = Some(v);
        }
        if let Some(v) = lookup("ANS_BASE_URL") {
            self.source.base_url = v;
        }
        if let Some(v) = lookup("CADASTRO_URL") {
            self.source.registry_url = v;
        }
        if let Some(v) = lookup("ANS_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(v);
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.paths.data_dir.join("raw")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.paths.data_dir.join("processed")
    }

    pub fn consolidated_file(&self) -> PathBuf {
        self.paths.data_dir.join("consolidado_despesas.csv")
    }

    pub fn enriched_file(&self) -> PathBuf {
        self.paths.data_dir.join("despesas_enriquecidas.csv")
    }

    pub fn aggregated_file(&self) -> PathBuf {
        self.paths.data_dir.join("despesas_agregadas.csv")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.paths.data_dir.join("cadastro_operadoras.csv")
    }

    pub fn reader_url(&self) -> &str {
        self.warehouse
            .reader_url
            .as_deref()
            .unwrap_or(&self.warehouse.url)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.http.max_retries,
            backoff_factor: Duration::from_millis(self.http.backoff_factor_ms),
        }
    }
}
