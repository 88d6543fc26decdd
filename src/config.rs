//! Configuration for directory reading.
//!
//! [`ReadConfig`] is what a `DirTree` consults while reading; [`CliArgs`] is
//! the command line of the `dirstat` binary, which maps onto it.

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

/// Default number of directory entries handled per queue step
const DEFAULT_ENTRIES_PER_STEP: usize = 256;

/// Default number of started directory jobs between progress notifications
const DEFAULT_PROGRESS_INTERVAL: u64 = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_active_jobs must be at least 1")]
    NoActiveJobs,

    #[error("entries_per_step must be at least 1")]
    EmptyStep,
}

/// Policy and pacing for reading directory trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadConfig {
    /// Descend into directories that live on another filesystem than their parent
    pub cross_filesystems: bool,
    /// Allow reading from the local filesystem at all (false = cache files only)
    pub enable_local_dir_reader: bool,
    /// Treat symlinks to directories as directories and read them
    pub follow_dir_symlinks: bool,
    /// Upper bound on jobs that are started but have not exhausted their entries
    pub max_active_jobs: usize,
    /// Directory entries processed per queue step before yielding
    pub entries_per_step: usize,
    /// Emit a progress notification every N started directory jobs (0 = never)
    pub progress_interval: u64,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            cross_filesystems: false,
            enable_local_dir_reader: true,
            follow_dir_symlinks: false,
            max_active_jobs: 1,
            entries_per_step: DEFAULT_ENTRIES_PER_STEP,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl ReadConfig {
    pub fn with_cross_filesystems(mut self, cross: bool) -> Self {
        self.cross_filesystems = cross;
        self
    }

    pub fn with_local_dir_reader(mut self, enable: bool) -> Self {
        self.enable_local_dir_reader = enable;
        self
    }

    pub fn with_follow_dir_symlinks(mut self, follow: bool) -> Self {
        self.follow_dir_symlinks = follow;
        self
    }

    pub fn with_max_active_jobs(mut self, max: usize) -> Self {
        self.max_active_jobs = max;
        self
    }

    pub fn with_entries_per_step(mut self, entries: usize) -> Self {
        self.entries_per_step = entries;
        self
    }

    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_jobs == 0 {
            return Err(ConfigError::NoActiveJobs);
        }
        if self.entries_per_step == 0 {
            return Err(ConfigError::EmptyStep);
        }
        Ok(())
    }
}

/// Directory tree size statistics
#[derive(Parser, Debug, Clone)]
#[command(
    name = "dirstat",
    version,
    about = "Scan a directory tree and summarize disk usage",
    after_help = "EXAMPLES:\n    \
        dirstat /home --top 20\n    \
        dirstat /srv --write-cache srv.cache.gz\n    \
        dirstat --read-cache srv.cache.gz"
)]
pub struct CliArgs {
    /// Directory to scan (defaults to the current directory)
    #[arg(value_name = "PATH")]
    pub path: Option<PathBuf>,

    /// Load the tree from a cache file instead of scanning
    #[arg(long, value_name = "FILE", conflicts_with = "path")]
    pub read_cache: Option<PathBuf>,

    /// Write the finished tree to a cache file (.gz for gzip)
    #[arg(long, value_name = "FILE")]
    pub write_cache: Option<PathBuf>,

    /// Descend into mounted filesystems below the scanned path
    #[arg(short = 'x', long)]
    pub cross_filesystems: bool,

    /// Follow symlinks that point to directories
    #[arg(short = 'L', long)]
    pub follow_symlinks: bool,

    /// Read in a background worker thread and report progress
    #[arg(short = 'b', long)]
    pub background: bool,

    /// Number of largest children to list
    #[arg(short = 'n', long, default_value = "10", value_name = "NUM")]
    pub top: usize,

    /// Directory entries handled per step
    #[arg(long, default_value_t = DEFAULT_ENTRIES_PER_STEP, value_name = "NUM")]
    pub entries_per_step: usize,
}

impl CliArgs {
    /// Build the reading configuration from the command line.
    pub fn read_config(&self) -> Result<ReadConfig, ConfigError> {
        let config = ReadConfig::default()
            .with_cross_filesystems(self.cross_filesystems)
            .with_follow_dir_symlinks(self.follow_symlinks)
            .with_entries_per_step(self.entries_per_step);
        config.validate()?;
        Ok(config)
    }
}
