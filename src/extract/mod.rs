use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use log::{debug, info};
use tar::Archive;
use tokio::sync::mpsc;
use walkdir::WalkDir;
use zip::read::ZipArchive;

use crate::error::{Result, UpdateError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtractionCheck {
    pub success: bool,
    pub file_count: usize,
}

/// Unpacks downloaded archives into the install directory.
///
/// Extraction runs to completion once started; it is not cancellable.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<()>;

    async fn verify_extracted(&self, dest: &Path, min_file_count: usize) -> Result<ExtractionCheck>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::Zip => "zip",
        }
    }
}

/// Default extractor for `.zip` and `.tar.gz` archives.
#[derive(Clone, Debug, Default)]
pub struct ArchiveExtractor;

#[async_trait]
impl Extractor for ArchiveExtractor {
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<()> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = ArchiveKind::from_name(&name).ok_or_else(|| UpdateError::ExtractionFailed {
            archive: archive.to_path_buf(),
            message: "unsupported archive format".into(),
        })?;
        info!("extract: {} ({:?}) into {}", archive.display(), kind, dest.display());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let archive_path = archive.to_path_buf();
        let dest_path = dest.to_path_buf();
        let task = tokio::task::spawn_blocking(move || {
            let report = |done: u64, total: u64| {
                let _ = tx.send((done, total));
            };
            match kind {
                ArchiveKind::Zip => extract_zip(&archive_path, &dest_path, &report),
                ArchiveKind::TarGz => extract_targz(&archive_path, &dest_path, &report),
            }
        });
        while let Some((done, total)) = rx.recv().await {
            on_progress(done, total);
        }
        let result = task.await.map_err(|e| UpdateError::ExtractionFailed {
            archive: archive.to_path_buf(),
            message: format!("extraction task failed: {e}"),
        })?;
        result.map_err(|message| UpdateError::ExtractionFailed {
            archive: archive.to_path_buf(),
            message,
        })
    }

    async fn verify_extracted(&self, dest: &Path, min_file_count: usize) -> Result<ExtractionCheck> {
        let dir = dest.to_path_buf();
        let file_count = tokio::task::spawn_blocking(move || count_files(&dir))
            .await
            .map_err(|e| UpdateError::io("failed to count extracted files", io::Error::other(e)))?;
        debug!(
            "extract: {} holds {} files (need {})",
            dest.display(),
            file_count,
            min_file_count
        );
        Ok(ExtractionCheck {
            success: file_count >= min_file_count,
            file_count,
        })
    }
}

/// Number of regular files below `dir`; zero if it does not exist.
pub fn count_files(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

fn extract_zip(
    archive_path: &Path,
    dest: &Path,
    report: &dyn Fn(u64, u64),
) -> std::result::Result<(), String> {
    let file = fs::File::open(archive_path).map_err(|e| format!("zip open error: {e}"))?;
    let mut archive = ZipArchive::new(file).map_err(|e| format!("zip parse error: {e}"))?;
    let total = archive.len() as u64;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| format!("zip entry error: {e}"))?;
        let relative: PathBuf = entry
            .enclosed_name()
            .ok_or_else(|| format!("zip entry escapes destination: {}", entry.name()))?;
        let out_path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| format!("zip dir create error: {e}"))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| format!("zip parent dir error: {e}"))?;
            }
            let mut out_file =
                fs::File::create(&out_path).map_err(|e| format!("zip create file error: {e}"))?;
            io::copy(&mut entry, &mut out_file).map_err(|e| format!("zip write error: {e}"))?;
        }
        report(i as u64 + 1, total);
    }
    Ok(())
}

fn extract_targz(
    archive_path: &Path,
    dest: &Path,
    report: &dyn Fn(u64, u64),
) -> std::result::Result<(), String> {
    let file = fs::File::open(archive_path).map_err(|e| format!("tar.gz open error: {e}"))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    fs::create_dir_all(dest).map_err(|e| format!("tar.gz dest error: {e}"))?;
    let entries = archive
        .entries()
        .map_err(|e| format!("tar.gz read error: {e}"))?;
    let mut done = 0u64;
    for entry in entries {
        let mut entry = entry.map_err(|e| format!("tar.gz entry error: {e}"))?;
        entry
            .unpack_in(dest)
            .map_err(|e| format!("tar.gz extract error: {e}"))?;
        done += 1;
        report(done, 0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use zip::write::{SimpleFileOptions, ZipWriter};

    fn write_zip(path: &Path, files: usize) {
        let mut zip = ZipWriter::new(fs::File::create(path).unwrap());
        zip.add_directory("data/", SimpleFileOptions::default()).unwrap();
        for i in 0..files {
            zip.start_file(format!("data/f{i}.txt"), SimpleFileOptions::default())
                .unwrap();
            zip.write_all(format!("file {i}").as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn detects_archive_kind() {
        assert_eq!(ArchiveKind::from_name("full.ZIP"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_name("p.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("p.tgz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("p.rar"), None);
    }

    #[tokio::test]
    async fn extracts_zip_and_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("patch.zip");
        write_zip(&archive, 5);
        let dest = dir.path().join("install");

        let seen = AtomicU64::new(0);
        ArchiveExtractor
            .extract(&archive, &dest, &|done, _| {
                seen.store(done, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(dest.join("data/f3.txt")).unwrap(), "file 3");
        assert_eq!(seen.load(Ordering::SeqCst), 6);
        let check = ArchiveExtractor.verify_extracted(&dest, 5).await.unwrap();
        assert_eq!(check, ExtractionCheck { success: true, file_count: 5 });
        let check = ArchiveExtractor.verify_extracted(&dest, 100).await.unwrap();
        assert!(!check.success);
    }

    #[tokio::test]
    async fn extracts_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("patch.tar.gz");
        {
            let encoder = GzEncoder::new(fs::File::create(&archive).unwrap(), Compression::fast());
            let mut builder = tar::Builder::new(encoder);
            for i in 0..3 {
                let body = format!("entry {i}");
                let mut header = tar::Header::new_gnu();
                header.set_size(body.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(&mut header, format!("bin/e{i}"), body.as_bytes())
                    .unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
        }
        let dest = dir.path().join("install");

        ArchiveExtractor
            .extract(&archive, &dest, &|_, _| {})
            .await
            .unwrap();
        assert_eq!(count_files(&dest), 3);
    }

    #[tokio::test]
    async fn corrupt_archive_is_an_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"not a zip at all").unwrap();

        let err = ArchiveExtractor
            .extract(&archive, &dir.path().join("out"), &|_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::ExtractionFailed { .. }));
    }

    #[test]
    fn missing_directory_counts_zero() {
        assert_eq!(count_files(Path::new("/definitely/not/here")), 0);
    }
}
