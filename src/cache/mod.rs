//! Cache files: a line-based text snapshot of a scanned tree.
//!
//! ```text
//! [dirstat-rs 1.0 cache file]
//! # comment
//! D /abs/path 4096 0x6512a3c1
//! F file%20name 1234 0x6512a3c1 alloc:4096
//! L link 12 0x6512a3c1
//! D subdir 4096 0x6512a3c1 err
//! <
//! <
//! ```
//!
//! Each directory line is followed by its files, then its subdirectories,
//! then a `<` line that closes it. Files ending in `.gz` are gzip-compressed.

pub mod escape;
pub mod reader;
pub mod writer;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const CACHE_FORMAT: &str = "dirstat-rs";
pub const CACHE_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error on cache file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not a dirstat-rs cache file (first line: {found:?})", .path.display())]
    BadHeader { path: PathBuf, found: String },

    #[error("no tree has been read")]
    NoTree,

    #[error("{} is not a directory; only directory trees can be cached", .path.display())]
    NotADirectory { path: PathBuf },
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn header_line() -> String {
    format!("[{CACHE_FORMAT} {CACHE_VERSION} cache file]")
}

/// Cache files named `*.gz` are compressed.
pub fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_is_chosen_by_extension() {
        assert!(is_gzip_path(Path::new("/tmp/home.cache.gz")));
        assert!(is_gzip_path(Path::new("TREE.GZ")));
        assert!(!is_gzip_path(Path::new("/tmp/home.cache")));
        assert!(!is_gzip_path(Path::new("gz")));
    }

    #[test]
    fn header_names_format_and_version() {
        assert_eq!(header_line(), "[dirstat-rs 1.0 cache file]");
        assert!(reader::is_header(&header_line()));
    }
}
