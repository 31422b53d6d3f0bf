//! Artifact uploads

use anyhow::{Context, Result};
use hive_core::domain::task::PresignedPost;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// POSTs a file to a pre-signed multipart target
///
/// The form fields issued with the URL go first; object storage expects the
/// `file` part last.
pub async fn upload_presigned(client: &Client, target: &PresignedPost, file: &Path) -> Result<()> {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact.tar.gz".to_string());

    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let size = bytes.len();

    let mut form = Form::new();
    for (key, value) in &target.fields {
        form = form.text(key.clone(), value.clone());
    }
    form = form.part("file", Part::bytes(bytes).file_name(name.clone()));

    let response = client
        .post(&target.url)
        .multipart(form)
        .send()
        .await
        .with_context(|| format!("Failed to upload {}", name))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Upload of {} failed: {} - {}", name, status, body);
    }

    info!("Uploaded {} ({} bytes)", name, size);
    Ok(())
}

/// Recursively copies `src` into `dest`, creating directories as needed
pub async fn copy_dir(src: PathBuf, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || copy_dir_blocking(&src, &dest))
        .await
        .context("Copy task panicked")?
}

fn copy_dir_blocking(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    for entry in std::fs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_blocking(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            debug!("Copied {}", target.display());
        }
    }

    Ok(())
}
