//! File store: the capture directory on disk.

use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use sysinfo::Disks;
use tracing::{debug, warn};

pub trait FileStore: Send + Sync {
    /// Directory segments are written into.
    fn dir(&self) -> &Path;
    /// Allocate a path for a segment starting at `timestamp_ms`.
    fn create_path(&self, timestamp_ms: i64) -> PathBuf;
    /// Remove a file. An absent file counts as deleted.
    fn delete(&self, path: &Path) -> bool;
    fn exists(&self, path: &Path) -> bool;
    fn size(&self, path: &Path) -> io::Result<u64>;
    /// Last modification time, epoch milliseconds.
    fn modified_ms(&self, path: &Path) -> io::Result<i64>;
    /// Regular files directly inside the capture directory.
    fn list_files(&self) -> io::Result<Vec<PathBuf>>;
    /// Bytes available to an unprivileged writer on the capture filesystem.
    fn free_space(&self) -> io::Result<u64>;
}

/// [`FileStore`] backed by a local directory.
pub struct LocalFileStore {
    dir: PathBuf,
}

impl LocalFileStore {
    /// Use `dir` as the capture directory, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

/// `segment_YYYYMMDD_HHMMSS_mmm.wav` for the given epoch milliseconds.
pub fn segment_file_name(timestamp_ms: i64) -> String {
    let dt = DateTime::<Utc>::from_timestamp_millis(timestamp_ms).unwrap_or_default();
    format!("segment_{}.wav", dt.format("%Y%m%d_%H%M%S_%3f"))
}

/// Available bytes on the disk whose mount point is the deepest prefix
/// of `dir`.
fn available_on(disks: &Disks, dir: &Path) -> Option<u64> {
    disks
        .list()
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().components().count())
        .map(|d| d.available_space())
}

impl FileStore for LocalFileStore {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn create_path(&self, timestamp_ms: i64) -> PathBuf {
        let mut path = self.dir.join(segment_file_name(timestamp_ms));
        // Two sessions opened within the same millisecond must not share a file.
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!(
                "{}-{n}.wav",
                segment_file_name(timestamp_ms).trim_end_matches(".wav")
            ));
            n += 1;
        }
        path
    }

    fn delete(&self, path: &Path) -> bool {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("Deleted {}", path.display());
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("Cannot delete {}: {e}", path.display());
                false
            }
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn modified_ms(&self, path: &Path) -> io::Result<i64> {
        let modified = std::fs::metadata(path)?.modified()?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0))
    }

    fn list_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn free_space(&self) -> io::Result<u64> {
        let dir = self.dir.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        available_on(&disks, &dir).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mounted filesystem holds {}", dir.display()),
            )
        })
    }
}
