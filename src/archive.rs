// src/archive.rs
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::fetch::urls::detect_quarter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub dir: PathBuf,
    pub files: usize,
}

/// Unpack `zip_path` into `processed_dir/<period>/<zip stem>/`, where the
/// period (`1T2025`) is read from the archive name. Archives without a
/// recognisable period go to `processed_dir/<zip stem>/`.
///
/// The target directory is cleared first, so extracting the same archive
/// twice leaves exactly one copy of its contents. Entries whose names would
/// escape the target are skipped.
#[instrument(level = "debug", skip(processed_dir), fields(zip = %zip_path.display()))]
pub fn extract_archive(zip_path: &Path, processed_dir: &Path) -> Result<Extracted> {
    let stem = zip_path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .with_context(|| format!("archive {} has no usable name", zip_path.display()))?;
    let target = match detect_quarter(stem) {
        Some(period) => processed_dir.join(period.to_string()).join(stem),
        None => processed_dir.join(stem),
    };

    let file = File::open(zip_path).with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("reading zip directory of {}", zip_path.display()))?;

    if target.exists() {
        fs::remove_dir_all(&target)
            .with_context(|| format!("clearing {}", target.display()))?;
    }
    fs::create_dir_all(&target).with_context(|| format!("creating {}", target.display()))?;

    let mut files = 0;
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        let Some(rel) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "unsafe entry path, skipping");
            continue;
        };
        let out_path = target.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(
            File::create(&out_path).with_context(|| format!("creating {}", out_path.display()))?,
        );
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("extracting {}", out_path.display()))?;
        files += 1;
    }

    debug!(dir = %target.display(), files, "extracted");
    Ok(Extracted { dir: target, files })
}

/// Extract every archive; a corrupt archive is logged and skipped.
pub fn extract_all(archives: &[PathBuf], processed_dir: &Path) -> Vec<Extracted> {
    let mut out = Vec::with_capacity(archives.len());
    for zip_path in archives {
        match extract_archive(zip_path, processed_dir) {
            Ok(x) => out.push(x),
            Err(e) => error!(zip = %zip_path.display(), error = ?e, "extraction failed, skipping"),
        }
    }
    info!(archives = archives.len(), extracted = out.len(), "extraction complete");
    out
}

/// Write `src` as the single deflated entry of `dest_zip`.
pub fn compress_file(src: &Path, dest_zip: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no file name", src.display()))?;

    let mut tmp = dest_zip.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut zip = ZipWriter::new(BufWriter::new(
            File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?,
        ));
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(true);
        zip.start_file(name, options)?;
        let mut input = BufReader::new(
            File::open(src).with_context(|| format!("opening {}", src.display()))?,
        );
        io::copy(&mut input, &mut zip)?;
        zip.finish()?;
    }
    fs::rename(&tmp, dest_zip)
        .with_context(|| format!("renaming {} to {}", tmp.display(), dest_zip.display()))?;
    info!(src = %src.display(), zip = %dest_zip.display(), "compressed");
    Ok(dest_zip.to_path_buf())
}
