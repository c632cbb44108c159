//! src/services/archive.rs
//!
//! Zip packing and unpacking for directory payloads. Directory backups travel
//! as a single zip archive; rebuilds unpack it again before restoring.
//! The zip crate is synchronous, so every entry point runs on the blocking pool.

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// A regular file found under a directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    pub path: PathBuf,
    /// Path relative to the walked root, `/`-separated.
    pub relative: String,
    pub size: u64,
}

/// Unpack `archive` into `dest`. Entries escaping `dest` are skipped.
pub async fn unzip(archive: &Path, dest: &Path) -> ArchiveResult<usize> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unzip_blocking(&archive, &dest)).await?
}

fn unzip_blocking(archive: &Path, dest: &Path) -> ArchiveResult<usize> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    fs::create_dir_all(dest)?;
    let mut written = 0;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping archive entry outside destination");
            continue;
        };
        let out = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
        written += 1;
    }

    debug!(archive = %archive.display(), files = written, "archive unpacked");
    Ok(written)
}

/// Pack every regular file under `src` into a new archive at `archive`.
pub async fn zip_dir(src: &Path, archive: &Path) -> ArchiveResult<usize> {
    let src = src.to_path_buf();
    let archive = archive.to_path_buf();
    tokio::task::spawn_blocking(move || zip_dir_blocking(&src, &archive)).await?
}

fn zip_dir_blocking(src: &Path, archive: &Path) -> ArchiveResult<usize> {
    let files = walk_files(src)?;
    let mut zip = ZipWriter::new(File::create(archive)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for file in &files {
        zip.start_file(file.relative.as_str(), options)?;
        io::copy(&mut File::open(&file.path)?, &mut zip)?;
    }
    zip.finish()?;
    Ok(files.len())
}

/// Regular files under `root`, sorted by relative path. Directories are not listed.
pub fn walk_files(root: &Path) -> ArchiveResult<Vec<TreeFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(TreeFile {
            path: entry.path().to_path_buf(),
            relative,
            size: entry.metadata()?.len(),
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zip_then_unzip_preserves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), b"alpha").unwrap();
        fs::write(src.join("sub/b.txt"), b"beta").unwrap();

        let archive = dir.path().join("payload.zip");
        assert_eq!(zip_dir(&src, &archive).await.unwrap(), 2);

        let out = dir.path().join("out");
        assert_eq!(unzip(&archive, &out).await.unwrap(), 2);

        let files = walk_files(&out).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub/b.txt"]);
        assert_eq!(fs::read(out.join("sub/b.txt")).unwrap(), b"beta");
    }

    #[tokio::test]
    async fn corrupt_archives_fail() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.zip");
        fs::write(&archive, b"not a zip").unwrap();
        assert!(matches!(
            unzip(&archive, &dir.path().join("out")).await,
            Err(ArchiveError::Zip(_))
        ));
    }
}
