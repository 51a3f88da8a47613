// src/fetch/urls.rs
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::http::HttpClient;
use crate::model::Period;

static YEAR_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})/?$").unwrap());

// `{q}T{yyyy}`, `{yyyy}-{q}T` / `{yyyy}_{q}T`, `{yyyy}_{q}_quarter` (or the portal's `_trimestre`)
static QUARTER_PATTERNS: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        Regex::new(r"(\d)t(\d{4})").unwrap(),
        Regex::new(r"(\d{4})[-_](\d)t").unwrap(),
        Regex::new(r"(\d{4})_(\d)_(?:trimestre|quarter)").unwrap(),
    ]
});

/// A remote quarterly archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLink {
    pub url: String,
    pub filename: String,
    pub period: Period,
}

/// Detect the reporting period encoded in an archive file name.
pub fn detect_quarter(filename: &str) -> Option<Period> {
    let lower = filename.to_lowercase();
    for re in QUARTER_PATTERNS.iter() {
        if let Some(caps) = re.captures(&lower) {
            let (g1, g2) = (&caps[1], &caps[2]);
            let (year, quarter) = if g1.len() == 4 { (g1, g2) } else { (g2, g1) };
            let year: u16 = year.parse().ok()?;
            let quarter: u8 = quarter.parse().ok()?;
            if !(1..=4).contains(&quarter) {
                return None;
            }
            return Some(Period::new(year, quarter));
        }
    }
    None
}

fn hrefs(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("a[href]").expect("selector should parse");
    doc.select(&sel)
        .filter_map(|el| el.value().attr("href"))
        .map(|h| h.trim().to_string())
        .collect()
}

/// Year directories linked from a listing page, newest first.
pub fn year_dirs(html: &str) -> Vec<u16> {
    let mut years: Vec<u16> = hrefs(html)
        .iter()
        .filter_map(|h| YEAR_DIR.captures(h))
        .filter_map(|c| c[1].parse().ok())
        .collect();
    years.sort_unstable_by(|a, b| b.cmp(a));
    years.dedup();
    years
}

/// `.zip` links on a year listing whose detected year matches the directory.
pub fn archive_links(html: &str, year_url: &Url, year: u16) -> Vec<ArchiveLink> {
    hrefs(html)
        .into_iter()
        .filter(|h| h.to_lowercase().ends_with(".zip"))
        .filter_map(|href| {
            let period = detect_quarter(&href)?;
            if period.year != year {
                debug!(%href, dir_year = year, "period/directory mismatch, skipping");
                return None;
            }
            let url = year_url.join(&href).ok()?;
            let filename = url
                .path_segments()
                .and_then(|s| s.last())
                .filter(|n| !n.is_empty())
                .unwrap_or(&href)
                .to_string();
            Some(ArchiveLink {
                url: url.to_string(),
                filename,
                period,
            })
        })
        .collect()
}

/// Keep every archive that belongs to the `limit` most recent distinct periods.
pub fn select_latest(candidates: Vec<ArchiveLink>, limit: usize) -> Vec<ArchiveLink> {
    let periods: BTreeSet<Period> = candidates.iter().map(|c| c.period).collect();
    let keep: BTreeSet<Period> = periods.into_iter().rev().take(limit).collect();
    candidates
        .into_iter()
        .filter(|c| keep.contains(&c.period))
        .collect()
}

/// Crawl the portal for the newest quarterly archives.
#[instrument(level = "info", skip(client))]
pub async fn discover_quarter_archives(
    client: &HttpClient,
    base_url: &str,
    years_scanned: usize,
    limit: usize,
) -> Result<Vec<ArchiveLink>> {
    let base = Url::parse(base_url).with_context(|| format!("parsing base URL {}", base_url))?;
    let listing = client
        .get_text(base.as_str())
        .await
        .with_context(|| format!("listing {}", base))?;

    let mut candidates = Vec::new();
    for year in year_dirs(&listing).into_iter().take(years_scanned) {
        let year_url = base.join(&format!("{}/", year))?;
        let html = match client.get_text(year_url.as_str()).await {
            Ok(h) => h,
            Err(e) => {
                warn!(%year_url, error = %e, "skipping year listing");
                continue;
            }
        };
        let links = archive_links(&html, &year_url, year);
        debug!(year, found = links.len(), "year scanned");
        candidates.extend(links);
    }

    let selected = select_latest(candidates, limit);
    info!(archives = selected.len(), "discovery complete");
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::http::RetryPolicy;
    use reqwest::Client;
    use std::time::Duration;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn detects_all_name_shapes() {
        assert_eq!(detect_quarter("1T2025.zip"), Some(Period::new(2025, 1)));
        assert_eq!(detect_quarter("2024-3t.zip"), Some(Period::new(2024, 3)));
        assert_eq!(detect_quarter("2024_4T_dados.zip"), Some(Period::new(2024, 4)));
        assert_eq!(
            detect_quarter("2023_2_trimestre.zip"),
            Some(Period::new(2023, 2))
        );
        assert_eq!(detect_quarter("2023_1_quarter.zip"), Some(Period::new(2023, 1)));
        assert_eq!(detect_quarter("readme.zip"), None);
        assert_eq!(detect_quarter("9T2025.zip"), None);
    }

    #[test]
    fn year_dirs_sorted_desc() {
        let html = r#"<a href="../">Parent</a><a href="2023/">2023/</a>
            <a href="2025/">2025/</a><a href="2024">2024</a><a href="notes/">x</a>"#;
        assert_eq!(year_dirs(html), vec![2025, 2024, 2023]);
    }

    #[test]
    fn links_must_match_directory_year() {
        let base = Url::parse("https://example.org/dc/2025/").unwrap();
        let html = r#"<a href="1T2025.zip">a</a><a href="4T2024.zip">b</a><a href="2T2025.csv">c</a>"#;
        let links = archive_links(html, &base, 2025);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url, "https://example.org/dc/2025/1T2025.zip");
        assert_eq!(links[0].filename, "1T2025.zip");
    }

    #[test]
    fn select_latest_keeps_all_files_of_top_periods() {
        let mk = |name: &str, y, q| ArchiveLink {
            url: format!("u/{name}"),
            filename: name.to_string(),
            period: Period::new(y, q),
        };
        let picked = select_latest(
            vec![
                mk("1T2024.zip", 2024, 1),
                mk("4T2024.zip", 2024, 4),
                mk("1T2025.zip", 2025, 1),
                mk("1T2025_extra.zip", 2025, 1),
                mk("3T2024.zip", 2024, 3),
            ],
            2,
        );
        let names: Vec<_> = picked.iter().map(|l| l.filename.as_str()).collect();
        assert_eq!(names, vec!["4T2024.zip", "1T2025.zip", "1T2025_extra.zip"]);
    }

    #[tokio::test]
    async fn crawls_listing_tree() {
        let server = MockServer::start().await;
        Mock::given(path("/dc/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="2024/">2024/</a><a href="2025/">2025/</a>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(path("/dc/2025/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"<a href="1T2025.zip">1T2025.zip</a>"#),
            )
            .mount(&server)
            .await;
        Mock::given(path("/dc/2024/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="3T2024.zip">x</a><a href="4T2024.zip">y</a>"#,
            ))
            .mount(&server)
            .await;

        let client = HttpClient::from_client(
            Client::new(),
            RetryPolicy {
                max_retries: 0,
                backoff_factor: Duration::from_millis(1),
            },
        );
        let found = discover_quarter_archives(&client, &format!("{}/dc/", server.uri()), 3, 2)
            .await
            .unwrap();
        let periods: Vec<_> = found.iter().map(|l| l.period.to_string()).collect();
        assert_eq!(periods, vec!["1T2025", "4T2024"]);
    }
}
