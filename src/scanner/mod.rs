//! Filesystem access used by the directory read jobs.
//!
//! Everything the tree learns about the disk goes through [`FsSource`], so
//! the reading logic can be driven by the real filesystem ([`LocalFs`]) or by
//! an in-memory fake in tests.

pub mod local;
#[cfg(test)]
pub(crate) mod memory;
pub mod types;

use std::ffi::OsString;
use std::io;
use std::path::Path;

pub use self::local::LocalFs;
pub use self::types::{EntryKind, FileStat};

/// The filesystem collaborator: `stat()` and directory listing, both fallible.
pub trait FsSource: Send {
    /// Stat `path` without following a trailing symlink (`lstat`).
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Stat `path`, following symlinks. Used for the toplevel of a read and,
    /// when configured, for symlinks that may point to directories.
    fn stat_follow(&self, path: &Path) -> io::Result<FileStat> {
        self.stat(path)
    }

    /// Names of the entries in directory `path`, excluding `.` and `..`,
    /// in the order the OS returns them.
    fn list_directory(&self, path: &Path) -> io::Result<Vec<OsString>>;
}
