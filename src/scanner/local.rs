use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;

use super::types::FileStat;
use super::FsSource;

/// Reads the local filesystem through `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl FsSource for LocalFs {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        fs::symlink_metadata(path).map(|md| FileStat::from_metadata(&md))
    }

    fn stat_follow(&self, path: &Path) -> io::Result<FileStat> {
        fs::metadata(path).map(|md| FileStat::from_metadata(&md))
    }

    fn list_directory(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            match entry {
                Ok(entry) => names.push(entry.file_name()),
                // One bad entry should not hide the rest of the directory
                Err(e) => tracing::warn!("Skipping unreadable entry in {}: {}", path.display(), e),
            }
        }
        Ok(names)
    }
}
