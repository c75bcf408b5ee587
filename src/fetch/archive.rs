//! Local tar archive source.

use std::fs::File;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::RepoFetcher;

/// Extracts an uploaded tar archive of the code.
#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    archive: PathBuf,
}

impl ArchiveFetcher {
    pub const fn new(archive: PathBuf) -> Self {
        Self { archive }
    }
}

#[async_trait]
impl RepoFetcher for ArchiveFetcher {
    #[instrument(skip(self), fields(archive = %self.archive.display()))]
    async fn fetch(&self, dest: &Path) -> Result<()> {
        let archive = self.archive.clone();
        let dest = dest.to_path_buf();

        let entries = tokio::task::spawn_blocking(move || extract(&archive, &dest))
            .await
            .context("Archive extraction task panicked")??;

        debug!(entries, "Extracted code archive");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("archive {}", self.archive.display())
    }
}

/// Unpack every entry of `archive` under `dest`, refusing entries that
/// would land outside it.
fn extract(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open code archive {}", archive.display()))?;
    let mut tar = tar::Archive::new(file);
    tar.set_preserve_permissions(true);

    let mut count = 0;
    for entry in tar
        .entries()
        .with_context(|| format!("Failed to read code archive {}", archive.display()))?
    {
        let mut entry = entry.context("Corrupt entry in code archive")?;
        let path = entry
            .path()
            .context("Invalid path in code archive")?
            .into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            anyhow::bail!("Archive entry escapes destination: {}", path.display());
        }

        let unpacked = entry
            .unpack_in(dest)
            .with_context(|| format!("Failed to unpack {}", path.display()))?;
        anyhow::ensure!(unpacked, "Archive entry was refused: {}", path.display());
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_archive(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[tokio::test]
    async fn extracts_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("code.tar");
        write_archive(
            &archive,
            &[("README.md", b"hello\n"), ("src/main.py", b"print(1)\n")],
        );
        let dest = dir.path().join("repo");
        std::fs::create_dir(&dest).unwrap();

        ArchiveFetcher::new(archive).fetch(&dest).await.unwrap();

        assert_eq!(std::fs::read(dest.join("README.md")).unwrap(), b"hello\n");
        assert_eq!(
            std::fs::read(dest.join("src/main.py")).unwrap(),
            b"print(1)\n"
        );
    }

    #[tokio::test]
    async fn missing_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ArchiveFetcher::new(dir.path().join("nope.tar"))
            .fetch(dir.path())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to open code archive"));
    }

    #[tokio::test]
    async fn corrupt_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.tar");
        std::fs::write(&archive, vec![0x42u8; 1024]).unwrap();
        let dest = dir.path().join("repo");
        std::fs::create_dir(&dest).unwrap();

        let result = ArchiveFetcher::new(archive).fetch(&dest).await;
        assert!(result.is_err());
    }

    /// Write an archive whose single entry has `name` verbatim. The builder's
    /// own path checks are bypassed by filling the header name directly.
    fn write_raw_archive(path: &Path, name: &str, data: &[u8]) {
        let mut header = tar::Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();

        let mut builder = tar::Builder::new(File::create(path).unwrap());
        builder.append(&header, data).unwrap();
        builder.finish().unwrap();
    }

    #[tokio::test]
    async fn parent_dir_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.tar");
        write_raw_archive(&archive, "../evil", b"pwned\n");
        let dest = dir.path().join("repo");
        std::fs::create_dir(&dest).unwrap();

        let err = ArchiveFetcher::new(archive).fetch(&dest).await.unwrap_err();

        assert!(format!("{err:#}").contains("escapes destination"), "{err:#}");
        assert!(!dir.path().join("evil").exists());
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn absolute_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("absolute-evil");
        let archive = dir.path().join("evil.tar");
        write_raw_archive(&archive, &target.to_string_lossy(), b"pwned\n");
        let dest = dir.path().join("repo");
        std::fs::create_dir(&dest).unwrap();

        let err = ArchiveFetcher::new(archive).fetch(&dest).await.unwrap_err();

        assert!(format!("{err:#}").contains("escapes destination"), "{err:#}");
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    }
}
