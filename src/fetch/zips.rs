use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::http::HttpClient;

/// Where a requested file came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Download {
    Fetched(PathBuf),
    /// Already on disk from an earlier run; the network was not touched.
    Existing(PathBuf),
}

impl Download {
    pub fn path(&self) -> &Path {
        match self {
            Download::Fetched(p) | Download::Existing(p) => p,
        }
    }
}

/// Download a quarterly archive into `dest_dir/filename` unless it is already there.
#[instrument(level = "debug", skip(client, dest_dir), fields(dest = %dest_dir.as_ref().display()))]
pub async fn download_archive(
    client: &HttpClient,
    url: &str,
    dest_dir: impl AsRef<Path>,
    filename: &str,
) -> Result<Download> {
    let dest_path = dest_dir.as_ref().join(filename);
    download_if_missing(client, url, &dest_path).await
}

/// Fetch `url` to `dest_path`, skipping the request when the file exists.
pub async fn download_if_missing(
    client: &HttpClient,
    url: &str,
    dest_path: &Path,
) -> Result<Download> {
    if fs::try_exists(dest_path).await.unwrap_or(false) {
        debug!(file = %dest_path.display(), "already downloaded");
        return Ok(Download::Existing(dest_path.to_path_buf()));
    }
    if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let mut part = dest_path.as_os_str().to_owned();
    part.push(".part");
    let part_path = PathBuf::from(part);

    match stream_to_file(client, url, &part_path).await {
        Ok(bytes) => {
            fs::rename(&part_path, dest_path).await.with_context(|| {
                format!(
                    "renaming {} to {}",
                    part_path.display(),
                    dest_path.display()
                )
            })?;
            info!(file = %dest_path.display(), bytes, "downloaded");
            Ok(Download::Fetched(dest_path.to_path_buf()))
        }
        Err(e) => {
            if let Err(rm) = fs::remove_file(&part_path).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!(file = %part_path.display(), error = %rm, "could not remove partial download");
                }
            }
            Err(e)
        }
    }
}

async fn stream_to_file(client: &HttpClient, url: &str, path: &Path) -> Result<u64> {
    let response = client.get(url).await?;
    let mut file = fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    let mut stream = response.bytes_stream();
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("reading body from {}", url))?;
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::http::RetryPolicy;
    use reqwest::Client;
    use std::time::Duration;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::from_client(
            Client::new(),
            RetryPolicy {
                max_retries: 1,
                backoff_factor: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn downloads_then_reuses() {
        let server = MockServer::start().await;
        Mock::given(path("/2025/1T2025.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/2025/1T2025.zip", server.uri());

        let first = download_archive(&client(), &url, dir.path(), "1T2025.zip")
            .await
            .unwrap();
        assert!(matches!(first, Download::Fetched(_)));
        assert_eq!(std::fs::read(first.path()).unwrap().len(), 4096);

        let second = download_archive(&client(), &url, dir.path(), "1T2025.zip")
            .await
            .unwrap();
        assert_eq!(second, Download::Existing(dir.path().join("1T2025.zip")));
    }

    #[tokio::test]
    async fn failed_download_leaves_no_partial() {
        let server = MockServer::start().await;
        Mock::given(path("/cadop.csv"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cadastro_operadoras.csv");
        let res = download_if_missing(&client(), &format!("{}/cadop.csv", server.uri()), &dest).await;
        assert!(res.is_err());
        assert!(!dest.exists());
        assert!(!dir.path().join("cadastro_operadoras.csv.part").exists());
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}
