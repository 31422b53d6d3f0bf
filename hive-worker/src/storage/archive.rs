//! Gzip'd tarball handling

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::debug;

/// Whether a downloaded file is an archive that must be unpacked
pub fn is_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Unpacks an archive into its own directory and deletes the archive
pub async fn unpack_in_place(archive: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || unpack_blocking(&archive))
        .await
        .context("Unpack task panicked")?
}

fn unpack_blocking(archive: &Path) -> Result<()> {
    let target = archive
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Archive {} has no parent", archive.display()))?;

    debug!("Unpacking {} into {}", archive.display(), target.display());

    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    Archive::new(GzDecoder::new(file))
        .unpack(target)
        .with_context(|| format!("Failed to unpack {}", archive.display()))?;

    std::fs::remove_file(archive)
        .with_context(|| format!("Failed to remove archive {}", archive.display()))?;
    Ok(())
}

/// Packs directories into a gzip'd tarball
///
/// Each `(name, dir)` pair lands in the archive under `name/`. Missing
/// directories are skipped.
pub async fn pack(dest: PathBuf, dirs: Vec<(String, PathBuf)>) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || {
        let file = File::create(&dest)
            .with_context(|| format!("Failed to create archive {}", dest.display()))?;
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

        for (name, dir) in &dirs {
            if dir.is_dir() {
                builder
                    .append_dir_all(name, dir)
                    .with_context(|| format!("Failed to add {} to archive", dir.display()))?;
            }
        }

        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .context("Failed to finish archive")?;

        debug!("Packed {} director(ies) into {}", dirs.len(), dest.display());
        Ok(dest)
    })
    .await
    .context("Pack task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_archive() {
        assert!(is_archive(Path::new("/tmp/code.tar.gz")));
        assert!(is_archive(Path::new("data.TGZ")));
        assert!(!is_archive(Path::new("train.csv")));
        assert!(!is_archive(Path::new("model.tar")));
    }

    #[tokio::test]
    async fn test_pack_then_unpack_in_place() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("output/nested")).unwrap();
        std::fs::write(src.path().join("output/nested/model.bin"), b"weights").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let archive = dest.path().join("abc123-output.tar.gz");
        pack(
            archive.clone(),
            vec![
                ("output".to_string(), src.path().join("output")),
                ("log".to_string(), src.path().join("missing")),
            ],
        )
        .await
        .unwrap();
        assert!(archive.exists());

        unpack_in_place(archive.clone()).await.unwrap();

        assert!(!archive.exists());
        let restored = std::fs::read(dest.path().join("output/nested/model.bin")).unwrap();
        assert_eq!(restored, b"weights");
        assert!(!dest.path().join("log").exists());
    }

    #[tokio::test]
    async fn test_unpack_corrupt_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.tar.gz");
        std::fs::write(&archive, b"definitely not gzip").unwrap();

        assert!(unpack_in_place(archive).await.is_err());
    }
}
