// src/consolidate/mod.rs
pub mod normalize;
pub mod sniff;

use anyhow::{anyhow, Context, Result};
use csv::{ByteRecord, ReaderBuilder, WriterBuilder};
use encoding_rs::Encoding;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

use crate::config::EtlConfig;
use crate::model::{ConsolidatedRecord, Period};
use normalize::{ColumnMap, Field};

/// Counters for one consolidation run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub files_seen: usize,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub rows_written: u64,
    /// Rows dropped by the account rule or an unusable amount.
    pub rows_filtered: u64,
    pub malformed_lines: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct FileStats {
    written: u64,
    filtered: u64,
    malformed: u64,
}

enum FileError {
    /// The file cannot be read; log it and move on.
    Skip(anyhow::Error),
    /// The output stream failed; the run cannot continue.
    Fatal(anyhow::Error),
}

/// Every `.csv`/`.txt` file under `dir`, in a stable order.
pub fn discover_inputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/**/*", dir.display());
    let mut files = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("bad walk pattern {}", pattern))? {
        let path = entry.with_context(|| format!("walking {}", dir.display()))?;
        let is_tabular = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("csv") || e.eq_ignore_ascii_case("txt"))
            .unwrap_or(false);
        if is_tabular && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Buffers normalized rows and flushes them to the output in chunks.
struct ChunkWriter {
    out: csv::Writer<BufWriter<File>>,
    pending: Vec<ConsolidatedRecord>,
    chunk_size: usize,
}

impl ChunkWriter {
    fn create(path: &Path, chunk_size: usize) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut out = WriterBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        out.write_record(ConsolidatedRecord::HEADER)
            .context("writing consolidated header")?;
        Ok(Self {
            out,
            pending: Vec::with_capacity(chunk_size.min(65_536)),
            chunk_size: chunk_size.max(1),
        })
    }

    fn push(&mut self, rec: ConsolidatedRecord) -> Result<()> {
        self.pending.push(rec);
        if self.pending.len() >= self.chunk_size {
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        for rec in self.pending.drain(..) {
            self.out.serialize(&rec).context("writing consolidated row")?;
        }
        Ok(())
    }

    /// Drain everything buffered to disk and return the output offset.
    fn mark(&mut self) -> Result<u64> {
        self.flush_chunk()?;
        self.out.flush().context("flushing consolidated output")?;
        let mut file: &File = self.out.get_ref().get_ref();
        Ok(file.stream_position()?)
    }

    /// Discard every row written or buffered since `mark`.
    fn rollback(&mut self, mark: u64) -> Result<()> {
        self.pending.clear();
        self.out.flush().context("flushing consolidated output")?;
        let mut file: &File = self.out.get_ref().get_ref();
        file.set_len(mark).context("truncating consolidated output")?;
        file.seek(SeekFrom::Start(mark))?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.flush_chunk()?;
        self.out.flush().context("flushing consolidated output")?;
        Ok(())
    }
}

/// Merge every tabular file under `input_dir` into one `;`-delimited dataset at `output`.
///
/// Unreadable files are skipped; a walk failure or an output write failure aborts.
#[instrument(level = "info", skip(cfg), fields(input = %input_dir.display(), output = %output.display()))]
pub fn consolidate(input_dir: &Path, output: &Path, cfg: &EtlConfig) -> Result<ConsolidationReport> {
    let inputs = discover_inputs(input_dir)?;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = output.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut writer = ChunkWriter::create(&tmp, cfg.chunk_size)?;
    let report = match consolidate_paths(&inputs, &mut writer, &cfg.account_prefixes) {
        Ok(r) => r,
        Err(e) => {
            drop(writer);
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    };

    writer.finish()?;
    fs::rename(&tmp, output)
        .with_context(|| format!("renaming {} to {}", tmp.display(), output.display()))?;

    info!(
        files = report.files_processed,
        skipped = report.files_skipped,
        rows = report.rows_written,
        filtered = report.rows_filtered,
        malformed = report.malformed_lines,
        "consolidation finished"
    );
    Ok(report)
}

/// Feed each path through the writer. A skipped file contributes no rows,
/// even when it failed after some of its rows were already written.
fn consolidate_paths(
    inputs: &[PathBuf],
    writer: &mut ChunkWriter,
    prefixes: &[String],
) -> Result<ConsolidationReport> {
    let mut report = ConsolidationReport {
        files_seen: inputs.len(),
        ..Default::default()
    };
    for path in inputs {
        match take_file(writer, |w| process_file(path, w, prefixes)) {
            Ok(stats) => {
                report.files_processed += 1;
                report.rows_written += stats.written;
                report.rows_filtered += stats.filtered;
                report.malformed_lines += stats.malformed;
                debug!(file = %path.display(), rows = stats.written, filtered = stats.filtered, "file done");
                if report.files_processed % 10 == 0 {
                    info!(processed = report.files_processed, total = inputs.len(), "consolidation progress");
                }
            }
            Err(FileError::Skip(e)) => {
                report.files_skipped += 1;
                error!(file = %path.display(), error = ?e, "skipping unreadable file");
            }
            Err(FileError::Fatal(e)) => {
                return Err(e.context(format!("consolidating {}", path.display())));
            }
        }
    }
    Ok(report)
}

fn take_file<F>(writer: &mut ChunkWriter, body: F) -> std::result::Result<FileStats, FileError>
where
    F: FnOnce(&mut ChunkWriter) -> std::result::Result<FileStats, FileError>,
{
    let mark = writer.mark().map_err(FileError::Fatal)?;
    match body(writer) {
        Err(FileError::Skip(e)) => {
            writer.rollback(mark).map_err(FileError::Fatal)?;
            Err(FileError::Skip(e))
        }
        other => other,
    }
}

/// How a file is laid out, as detected from its first bytes and its path.
#[derive(Debug, Clone, Copy)]
struct FileFormat {
    encoding: &'static Encoding,
    delimiter: u8,
    period: Option<Period>,
}

fn process_file(
    path: &Path,
    writer: &mut ChunkWriter,
    prefixes: &[String],
) -> std::result::Result<FileStats, FileError> {
    let sample = sniff::read_sample(path)
        .with_context(|| format!("sampling {}", path.display()))
        .map_err(FileError::Skip)?;
    let encoding = sniff::detect_encoding(&sample);
    let delimiter = sniff::detect_delimiter(&encoding.decode_without_bom_handling(&sample).0);
    let path_period = sniff::period_from_path(path);
    debug!(
        file = %path.display(),
        encoding = encoding.name(),
        delimiter = %(delimiter as char).escape_default(),
        period = ?path_period,
        "detected format"
    );

    let file = File::open(path)
        .with_context(|| format!("opening {}", path.display()))
        .map_err(FileError::Skip)?;
    let format = FileFormat {
        encoding,
        delimiter,
        period: path_period,
    };
    read_rows(path, BufReader::new(file), format, writer, prefixes)
}

fn read_rows<R: Read>(
    path: &Path,
    input: R,
    format: FileFormat,
    writer: &mut ChunkWriter,
    prefixes: &[String],
) -> std::result::Result<FileStats, FileError> {
    let FileFormat {
        encoding,
        delimiter,
        period: path_period,
    } = format;
    let mut rdr = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(input);

    let headers: Vec<String> = rdr
        .byte_headers()
        .map_err(|e| FileError::Skip(anyhow!(e).context("reading header")))?
        .iter()
        .map(|h| sniff::decode(encoding, h))
        .collect();
    let columns = ColumnMap::from_headers(headers.iter().map(String::as_str));

    let mut stats = FileStats::default();
    if !columns.has(Field::AccountCode) || !columns.has(Field::Amount) {
        warn!(file = %path.display(), ?headers, "no account/amount columns, nothing to take");
        return Ok(stats);
    }

    let mut record = ByteRecord::new();
    loop {
        match rdr.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) if e.is_io_error() => {
                return Err(FileError::Skip(anyhow!(e).context("reading rows")));
            }
            Err(e) => {
                debug!(file = %path.display(), error = %e, "malformed line");
                stats.malformed += 1;
                continue;
            }
        }
        if record.len() > headers.len() {
            stats.malformed += 1;
            continue;
        }
        match normalize_row(&record, &columns, encoding, prefixes, path_period) {
            Some(rec) => {
                writer.push(rec).map_err(FileError::Fatal)?;
                stats.written += 1;
            }
            None => stats.filtered += 1,
        }
    }
    Ok(stats)
}

fn normalize_row(
    record: &ByteRecord,
    columns: &ColumnMap,
    encoding: &'static Encoding,
    prefixes: &[String],
    path_period: Option<Period>,
) -> Option<ConsolidatedRecord> {
    let field = |f: Field| -> String {
        columns
            .get(f)
            .and_then(|i| record.get(i))
            .map(|b| sniff::decode(encoding, b).trim().to_string())
            .unwrap_or_default()
    };

    let account_code = field(Field::AccountCode);
    if !normalize::account_matches(&account_code, prefixes) {
        return None;
    }
    let amount = normalize::parse_amount(&field(Field::Amount))?;

    let year = normalize::parse_year(&field(Field::Year)).or(path_period.map(|p| p.year));
    let quarter = normalize::parse_quarter(&field(Field::Quarter)).or(path_period.map(|p| p.quarter));

    Some(ConsolidatedRecord {
        organization_id: normalize::strip_float_suffix(&field(Field::OrganizationId)),
        tax_id: field(Field::TaxId),
        name: field(Field::Name),
        quarter,
        year,
        account_code,
        description: field(Field::Description),
        modality: String::new(),
        amount,
    })
}

/// Load a consolidated dataset written by [`consolidate`].
pub fn read_consolidated(path: &Path) -> Result<Vec<ConsolidatedRecord>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b';')
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for (i, rec) in rdr.deserialize::<ConsolidatedRecord>().enumerate() {
        let rec = rec.with_context(|| format!("{} line {}", path.display(), i + 2))?;
        rows.push(rec);
    }
    Ok(rows)
}
