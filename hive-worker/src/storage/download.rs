//! Downloads from pre-signed URLs

use anyhow::{Context, Result};
use reqwest::{Client, Url};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::archive::{is_archive, unpack_in_place};

/// Local file name for a pre-signed URL: its last path segment
pub fn file_name_from_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("Invalid download URL '{}'", url))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Download URL '{}' has no file name", url))
}

/// Streams one URL into `dir`, returning the written file
pub async fn download_to_dir(client: &Client, url: &str, dir: &Path) -> Result<PathBuf> {
    let name = file_name_from_url(url)?;
    let target = dir.join(&name);

    debug!("Downloading {} to {}", name, target.display());

    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to request {}", name))?;

    if !response.status().is_success() {
        let status = response.status();
        anyhow::bail!("Download of {} failed: {}", name, status);
    }

    let mut file = tokio::fs::File::create(&target)
        .await
        .with_context(|| format!("Failed to create {}", target.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("Transfer of {} interrupted", name))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    debug!("Downloaded {} ({} bytes)", name, written);
    Ok(target)
}

/// Downloads every URL into `dir` and unpacks the archives among them
pub async fn download_all(client: &Client, urls: &[String], dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    for url in urls {
        let path = download_to_dir(client, url, dir).await?;
        if is_archive(&path) {
            unpack_in_place(path).await?;
        }
    }

    info!("Downloaded {} file(s) into {}", urls.len(), dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_file_name_from_url_strips_query() {
        assert_eq!(
            file_name_from_url("https://bucket.s3/jobs/abc/code.tar.gz?X-Amz-Signature=1").unwrap(),
            "code.tar.gz"
        );
        assert!(file_name_from_url("https://bucket.s3/").is_err());
        assert!(file_name_from_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_download_all_writes_plain_files() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/data/train.csv");
            then.status(200).body("a,b\n1,2\n");
        });

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dataset");
        download_all(&Client::new(), &[server.url("/data/train.csv?sig=x")], &target)
            .await
            .unwrap();

        let content = std::fs::read_to_string(target.join("train.csv")).unwrap();
        assert_eq!(content, "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_download_error_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/code.tar.gz");
            then.status(403);
        });

        let dir = tempfile::tempdir().unwrap();
        let result = download_to_dir(&Client::new(), &server.url("/code.tar.gz"), dir.path()).await;
        assert!(result.is_err());
    }
}
