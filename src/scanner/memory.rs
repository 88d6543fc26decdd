use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::types::{EntryKind, FileStat};
use super::FsSource;

/// In-memory filesystem for driving scans in tests.
///
/// Clones share state, so a test can keep a handle and change the "disk"
/// after handing a clone to a `DirTree`.
#[derive(Clone, Default)]
pub(crate) struct MemFs {
    inner: Arc<Mutex<MemInner>>,
}

#[derive(Default)]
struct MemInner {
    stats: HashMap<PathBuf, FileStat>,
    listings: HashMap<PathBuf, Vec<OsString>>,
    link_targets: HashMap<PathBuf, PathBuf>,
    unstatable: HashSet<PathBuf>,
    unlistable: HashSet<PathBuf>,
    next_inode: u64,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap()
    }

    pub fn entry(&self, path: &str, mut stat: FileStat) -> &Self {
        let path = PathBuf::from(path);
        let mut inner = self.lock();
        inner.next_inode += 1;
        if stat.inode == 0 {
            stat.inode = inner.next_inode;
        }
        if stat.device == 0 {
            stat.device = 1;
        }
        if stat.is_dir() {
            inner.listings.entry(path.clone()).or_default();
        }
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            if let Some(listing) = inner.listings.get_mut(parent) {
                if !listing.iter().any(|n| n == name) {
                    listing.push(name.to_os_string());
                }
            }
        }
        inner.stats.insert(path, stat);
        self
    }

    pub fn dir(&self, path: &str) -> &Self {
        self.entry(path, FileStat::new(EntryKind::Directory, 0))
    }

    pub fn file(&self, path: &str, size: u64) -> &Self {
        self.entry(path, FileStat::new(EntryKind::File, size))
    }

    pub fn symlink(&self, path: &str, target: &str) -> &Self {
        self.entry(path, FileStat::new(EntryKind::Symlink, target.len() as u64));
        self.lock()
            .link_targets
            .insert(PathBuf::from(path), PathBuf::from(target));
        self
    }

    /// Remove `path` and everything below it.
    pub fn remove(&self, path: &str) -> &Self {
        let path = PathBuf::from(path);
        let mut inner = self.lock();
        inner.stats.retain(|p, _| !p.starts_with(&path));
        inner.listings.retain(|p, _| !p.starts_with(&path));
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            if let Some(listing) = inner.listings.get_mut(parent) {
                listing.retain(|n| n != name);
            }
        }
        self
    }

    pub fn fail_stat(&self, path: &str) -> &Self {
        self.lock().unstatable.insert(PathBuf::from(path));
        self
    }

    pub fn fail_list(&self, path: &str) -> &Self {
        self.lock().unlistable.insert(PathBuf::from(path));
        self
    }

    pub fn set_device(&self, path: &str, device: u64) -> &Self {
        if let Some(stat) = self.lock().stats.get_mut(Path::new(path)) {
            stat.device = device;
        }
        self
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{}: no such entry", path.display()))
}

fn denied(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, format!("{}: permission denied", path.display()))
}

impl MemInner {
    /// Rewrite a path that runs through a symlinked directory to the real path.
    /// The last component is resolved too only when `follow_last` is set.
    fn resolve(&self, path: &Path, follow_last: bool) -> PathBuf {
        for (link, target) in &self.link_targets {
            if path == link.as_path() {
                if follow_last {
                    return target.clone();
                }
            } else if let Ok(rest) = path.strip_prefix(link) {
                return target.join(rest);
            }
        }
        path.to_path_buf()
    }
}

impl FsSource for MemFs {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let inner = self.lock();
        if inner.unstatable.contains(path) {
            return Err(denied(path));
        }
        let real = inner.resolve(path, false);
        inner.stats.get(&real).cloned().ok_or_else(|| not_found(path))
    }

    fn stat_follow(&self, path: &Path) -> io::Result<FileStat> {
        let inner = self.lock();
        let real = inner.resolve(path, true);
        inner.stats.get(&real).cloned().ok_or_else(|| not_found(path))
    }

    fn list_directory(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let inner = self.lock();
        if inner.unlistable.contains(path) {
            return Err(denied(path));
        }
        let real = inner.resolve(path, true);
        inner.listings.get(&real).cloned().ok_or_else(|| not_found(path))
    }
}
