//! Per-file format detection: text encoding, field delimiter and the
//! reporting period implied by the file's location.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::model::Period;

pub const SAMPLE_BYTES: usize = 8192;
pub const DEFAULT_DELIMITER: u8 = b';';
const CANDIDATES: [u8; 3] = [b';', b',', b'\t'];
const SNIFF_LINES: usize = 10;

static PERIOD_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^([1-4])T(\d{4})$").unwrap());

/// Read up to `SAMPLE_BYTES` from the start of a file.
pub fn read_sample(path: &Path) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(SAMPLE_BYTES);
    File::open(path)?
        .take(SAMPLE_BYTES as u64)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

/// Strict UTF-8 over the sample, otherwise Windows-1252.
///
/// A multi-byte sequence cut by the sample boundary does not count as invalid.
pub fn detect_encoding(sample: &[u8]) -> &'static Encoding {
    match std::str::from_utf8(sample) {
        Ok(_) => UTF_8,
        Err(e) if e.error_len().is_none() => UTF_8,
        Err(_) => WINDOWS_1252,
    }
}

/// Decode one field, dropping a UTF-8 byte order mark if present.
pub fn decode(encoding: &'static Encoding, bytes: &[u8]) -> String {
    let (text, _) = encoding.decode_without_bom_handling(bytes);
    text.trim_start_matches('\u{feff}').to_string()
}

/// Pick the field delimiter from a decoded sample.
pub fn detect_delimiter(sample: &str) -> u8 {
    let count = |d: u8| sample.bytes().filter(|b| *b == d).count();

    let semis = count(b';');
    if semis > 0 && semis > count(b',') {
        return b';';
    }
    if let Some(d) = sniff_consistent(sample) {
        return d;
    }
    CANDIDATES
        .iter()
        .map(|d| (*d, count(*d)))
        .filter(|(_, n)| *n > 0)
        .max_by_key(|(_, n)| *n)
        .map(|(d, _)| d)
        .unwrap_or(DEFAULT_DELIMITER)
}

// A delimiter that appears the same non-zero number of times on every sampled line.
fn sniff_consistent(sample: &str) -> Option<u8> {
    let mut lines: Vec<&str> = sample.lines().filter(|l| !l.trim().is_empty()).collect();
    // the last line may be cut by the sample boundary
    if lines.len() > 1 && !sample.ends_with('\n') {
        lines.pop();
    }
    lines.truncate(SNIFF_LINES);
    if lines.is_empty() {
        return None;
    }
    CANDIDATES.iter().copied().find(|d| {
        let first = lines[0].bytes().filter(|b| b == d).count();
        first > 0
            && lines
                .iter()
                .all(|l| l.bytes().filter(|b| b == d).count() == first)
    })
}

/// The period encoded in any path segment (or the file stem) as `{q}T{yyyy}`.
pub fn period_from_path(path: &Path) -> Option<Period> {
    let stem = path.file_stem().and_then(|s| s.to_str());
    path.iter()
        .filter_map(|seg| seg.to_str())
        .chain(stem)
        .find_map(|seg| {
            let caps = PERIOD_SEGMENT.captures(seg)?;
            Some(Period::new(caps[2].parse().ok()?, caps[1].parse().ok()?))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn utf8_and_legacy_detection() {
        assert_eq!(detect_encoding("REG_ANS;DESCRIÇÃO\n".as_bytes()), UTF_8);
        // "DESCRIÇÃO" in Windows-1252
        assert_eq!(detect_encoding(b"DESCRI\xC7\xC3O\n"), WINDOWS_1252);
        // truncated two-byte sequence at the end of the sample
        let mut cut = "abc;".as_bytes().to_vec();
        cut.push(0xC3);
        assert_eq!(detect_encoding(&cut), UTF_8);
    }

    #[test]
    fn decode_legacy_and_bom() {
        assert_eq!(decode(WINDOWS_1252, b"DESCRI\xC7\xC3O"), "DESCRIÇÃO");
        assert_eq!(decode(UTF_8, "\u{feff}REG_ANS".as_bytes()), "REG_ANS");
    }

    #[test]
    fn semicolon_wins_when_dominant() {
        assert_eq!(detect_delimiter("a;b;c\n1,5;2;3\n"), b';');
    }

    #[test]
    fn sniffs_consistent_comma_and_tab() {
        assert_eq!(detect_delimiter("a,b,c\n1,2,3\n4,5,6\n"), b',');
        assert_eq!(detect_delimiter("a\tb\n1\t2\n"), b'\t');
    }

    #[test]
    fn falls_back_to_highest_count_then_default() {
        // inconsistent per-line counts, comma most frequent
        assert_eq!(detect_delimiter("a,b,c,d\n1,2\n3\t4\n"), b',');
        assert_eq!(detect_delimiter("single column\nvalue\n"), b';');
        assert_eq!(detect_delimiter(""), b';');
    }

    #[test]
    fn period_from_directory_or_stem() {
        let p = PathBuf::from("data/processed/1T2025/1T2025.csv");
        assert_eq!(period_from_path(&p), Some(Period::new(2025, 1)));
        let p = PathBuf::from("data/processed/misc/3t2024.CSV");
        assert_eq!(period_from_path(&p), Some(Period::new(2024, 3)));
        let p = PathBuf::from("data/processed/2024/dados.csv");
        assert_eq!(period_from_path(&p), None);
    }
}
