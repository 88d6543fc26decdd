use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::{JobContext, ReadJob, ReadOutcome, SeenDirs};
use crate::scanner::types::EntryKind;
use crate::tree::arena::{FileNode, NodeId, NodeKind, ReadState};

/// Reads one directory of the local filesystem.
///
/// The listing is taken when the job starts; each step then stats a bounded
/// number of entries and adds them to the tree. Subdirectories become new jobs.
pub struct LocalReadJob {
    dir: NodeId,
    path: PathBuf,
    /// Device of `dir`, for detecting mount points below it
    device: u64,
    entries: std::vec::IntoIter<OsString>,
}

impl LocalReadJob {
    pub fn new(dir: NodeId, path: impl Into<PathBuf>) -> Self {
        Self {
            dir,
            path: path.into(),
            device: 0,
            entries: Vec::new().into_iter(),
        }
    }

    pub fn dir(&self) -> NodeId {
        self.dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn start(&mut self, ctx: &mut JobContext<'_>, seen: &mut SeenDirs) {
        let node = ctx.tree.get(self.dir);
        self.device = node.device;
        if ctx.config.follow_dir_symlinks {
            seen.insert((node.device, node.inode));
        }
        ctx.tree.set_read_state(self.dir, ReadState::Reading);

        match ctx.fs.list_directory(&self.path) {
            Ok(names) => {
                tracing::debug!("Reading {} ({} entries)", self.path.display(), names.len());
                self.entries = names.into_iter();
            }
            Err(e) => {
                tracing::warn!("Cannot read directory {}: {}", self.path.display(), e);
                ctx.tree.mark_read_error(self.dir);
            }
        }
    }

    pub(super) fn read_some(&mut self, ctx: &mut JobContext<'_>, seen: &mut SeenDirs) -> ReadOutcome {
        let budget = ctx.config.entries_per_step.max(1);
        let batch: Vec<OsString> = self.entries.by_ref().take(budget).collect();

        let mut spawned = Vec::new();
        for name in batch {
            if let Some(job) = self.read_entry(ctx, &name, seen) {
                spawned.push(job);
            }
        }

        let exhausted = self.entries.len() == 0;
        if exhausted {
            super::finalize_local(ctx, self.dir);
        }
        ReadOutcome { exhausted, spawned }
    }

    /// Stat one entry and add it below `dir`. Returns a job if it is a
    /// directory that should be read too.
    fn read_entry(&self, ctx: &mut JobContext<'_>, name: &OsString, seen: &mut SeenDirs) -> Option<ReadJob> {
        let path = self.path.join(name);

        let stat = match ctx.fs.stat(&path) {
            Ok(stat) => stat,
            Err(e) => {
                tracing::warn!("stat({}) failed: {}", path.display(), e);
                let added = ctx.tree.add_entry(self.dir, FileNode::unreadable(name))?;
                super::notify_added(ctx, added);
                return None;
            }
        };

        let stat = if stat.kind == EntryKind::Symlink && ctx.config.follow_dir_symlinks {
            match ctx.fs.stat_follow(&path) {
                Ok(target) if target.is_dir() => target,
                _ => stat,
            }
        } else {
            stat
        };

        let added = ctx.tree.add_entry(self.dir, FileNode::from_os_stat(name, &stat))?;
        super::notify_added(ctx, added);
        if !stat.is_dir() {
            return None;
        }
        let child = added.node;

        if stat.device != self.device && !ctx.config.cross_filesystems {
            tracing::info!("Not descending into mounted filesystem {}", path.display());
            if let NodeKind::Directory(info) = &mut ctx.tree.get_mut(child).kind {
                info.state = ReadState::OnRequestOnly;
                info.mount_point = true;
            }
            return None;
        }

        if ctx.config.follow_dir_symlinks && !seen.insert((stat.device, stat.inode)) {
            tracing::warn!("Not reading {} again: directory already visited", path.display());
            ctx.tree.set_read_state(child, ReadState::OnRequestOnly);
            return None;
        }

        Some(ReadJob::Local(LocalReadJob::new(child, path)))
    }
}
