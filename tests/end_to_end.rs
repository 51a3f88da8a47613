use ansscraper::config::Config;
use ansscraper::pipeline::{self, RunOptions};
use ansscraper::reports;
use ansscraper::warehouse::open_reader;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const HEADER: &str = "DATA;REG_ANS;CD_CONTA_CONTABIL;DESCRICAO;VL_SALDO_INICIAL;VL_SALDO_FINAL\n";
const REGISTRY: &str = "REGISTRO_OPERADORA;CNPJ;RAZAO_SOCIAL;MODALIDADE;UF\n\
                        123456;11222333000181;SAUDE BOA;Cooperativa Médica;SP\n";

fn init_test_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ansscraper=debug")),
        )
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn write_quarter_zip(raw: &Path, period: &str, body: &str) {
    let file = File::create(raw.join(format!("{period}.zip"))).unwrap();
    let mut zip = ZipWriter::new(file);
    zip.start_file(format!("{period}.csv"), SimpleFileOptions::default())
        .unwrap();
    zip.write_all(body.as_bytes()).unwrap();
    zip.finish().unwrap();
}

fn setup(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.paths.data_dir = dir.to_path_buf();
    cfg.warehouse.url = dir.join("warehouse.duckdb").to_string_lossy().to_string();
    cfg.etl.compress_outputs = true;

    let raw = cfg.raw_dir();
    fs::create_dir_all(&raw).unwrap();
    write_quarter_zip(
        &raw,
        "1T2025",
        &format!("{HEADER}2025-03-31;123456;411111111;EVENTOS;0;1.000,00\n2025-03-31;123456;311111111;RECEITA;0;9,00\n"),
    );
    write_quarter_zip(
        &raw,
        "2T2025",
        &format!("{HEADER}2025-06-30;123456;411111111;EVENTOS;0;3.000,00\n"),
    );
    fs::write(cfg.registry_file(), REGISTRY).unwrap();
    cfg
}

fn offline(reset: bool) -> RunOptions {
    RunOptions {
        skip_fetch: true,
        reset_warehouse: reset,
        load_only: false,
    }
}

#[tokio::test]
async fn two_quarters_through_warehouse_and_dashboard() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let cfg = setup(dir.path());

    let report = pipeline::run(&cfg, offline(false)).await.unwrap();
    assert!(!report.partial_fetch());
    assert_eq!(report.extracted, 2);
    assert_eq!(report.consolidation.rows_written, 2);
    assert_eq!(report.enrichment.matched, 2);
    assert_eq!(report.aggregates, 1);
    assert_eq!(report.load.organizations, 1);
    assert_eq!(report.load.events, 2);
    assert_eq!(report.load.aggregates, 1);

    assert!(cfg.consolidated_file().with_extension("zip").exists());
    assert!(cfg.aggregated_file().with_extension("zip").exists());

    let aggregated = fs::read_to_string(cfg.aggregated_file()).unwrap();
    assert_eq!(aggregated.lines().count(), 2);
    assert!(aggregated.contains("SAUDE BOA"));

    let conn = open_reader(cfg.reader_url()).unwrap();
    let (total, mean, stddev, count): (f64, f64, f64, i32) = conn
        .query_row(
            "SELECT total_amount, mean_quarterly, stddev, quarter_count FROM aggregates WHERE registry_id = '123456'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .unwrap();
    assert_eq!(total, 4000.0);
    assert_eq!(mean, 2000.0);
    assert!(stddev > 0.0);
    assert_eq!(count, 2);

    let dashboard = reports::dashboard(&conn).unwrap();
    assert!((dashboard.macro_kpis.trend_percent - 200.0).abs() < 1e-9);
    assert_eq!(dashboard.macro_kpis.active_organizations, 1);

    let org = reports::organization_by_tax_id(&conn, "11222333000181")
        .unwrap()
        .unwrap();
    assert_eq!(org.legal_name.as_deref(), Some("SAUDE BOA"));
    let history = reports::expense_history(&conn, "11222333000181")
        .unwrap()
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].quarter, Some(2));
}

#[tokio::test]
async fn rerun_needs_explicit_reset() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let cfg = setup(dir.path());

    pipeline::run(&cfg, offline(false)).await.unwrap();
    assert!(pipeline::run(&cfg, offline(false)).await.is_err());

    let report = pipeline::run(&cfg, offline(true)).await.unwrap();
    assert_eq!(report.load.events, 2);

    let conn = open_reader(cfg.reader_url()).unwrap();
    let events: i64 = conn
        .query_row("SELECT COUNT(*) FROM expense_events", [], |r| r.get(0))
        .unwrap();
    assert_eq!(events, 2);
}
