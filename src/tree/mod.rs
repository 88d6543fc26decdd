pub mod aggregate;
pub mod arena;
pub mod events;

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use self::arena::{Added, FileNode, FileTree, NodeId, NodeKind, ReadState, Totals};
use self::events::{EventSink, TreeEvent};
use crate::cache::reader;
use crate::cache::writer;
use crate::cache::CacheError;
use crate::config::ReadConfig;
use crate::jobs::{CacheReadJob, JobContext, JobId, JobQueue, LocalReadJob, ReadJob};
use crate::scanner::types::FileStat;
use crate::scanner::{FsSource, LocalFs};

/// A directory tree that is read incrementally by a queue of jobs.
///
/// Reading is cooperative: [`DirTree::start_reading`] only queues work, and
/// each call to [`DirTree::step`] does a bounded amount of it. Observers learn
/// about changes through channels from [`DirTree::subscribe`].
pub struct DirTree {
    nodes: FileTree,
    queue: JobQueue,
    fs: Box<dyn FsSource>,
    config: ReadConfig,
    events: EventSink,
    busy: bool,
}

impl DirTree {
    /// A tree that reads the local filesystem.
    pub fn new(config: ReadConfig) -> Self {
        Self::with_source(config, Box::new(LocalFs))
    }

    pub fn with_source(config: ReadConfig, fs: Box<dyn FsSource>) -> Self {
        Self {
            nodes: FileTree::new(),
            queue: JobQueue::new(),
            fs,
            config,
            events: EventSink::default(),
            busy: false,
        }
    }

    pub fn subscribe(&mut self) -> mpsc::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    pub fn nodes(&self) -> &FileTree {
        &self.nodes
    }

    pub fn root(&self) -> NodeId {
        self.nodes.root()
    }

    pub fn first_toplevel(&self) -> Option<NodeId> {
        self.nodes.first_child(self.nodes.root())
    }

    pub fn is_top_level(&self, id: NodeId) -> bool {
        self.nodes.try_get(id).and_then(FileNode::parent) == Some(self.nodes.root())
    }

    /// Absolute path of the tree that was read, if any.
    pub fn url(&self) -> Option<PathBuf> {
        self.first_toplevel().map(|top| self.nodes.node_path(top))
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn config(&self) -> &ReadConfig {
        &self.config
    }

    /// Takes effect for jobs started after the call.
    pub fn set_config(&mut self, config: ReadConfig) {
        self.config = config;
    }

    /// Read jobs not yet finished.
    pub fn pending_jobs(&self) -> usize {
        self.queue.len()
    }

    /// # Panics
    ///
    /// If `id` is stale; see [`DirTree::try_totals`].
    pub fn totals(&self, id: NodeId) -> Totals {
        self.nodes.totals(id)
    }

    /// Totals of `id`, or `None` if the node has been deleted.
    pub fn try_totals(&self, id: NodeId) -> Option<Totals> {
        self.nodes.contains(id).then(|| self.nodes.totals(id))
    }

    /// Clear the tree and start reading `path` from the filesystem.
    pub fn start_reading(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let url = std::path::absolute(path).unwrap_or_else(|e| {
            tracing::warn!("Cannot make {} absolute: {}", path.display(), e);
            path.to_path_buf()
        });
        tracing::info!("Reading {}", url.display());

        let root = self.nodes.root();
        if self.nodes.has_children(root) {
            self.clear();
        }
        self.busy = true;
        self.events.emit(TreeEvent::StartingReading);

        if !self.config.enable_local_dir_reader {
            tracing::warn!("Local directory reading is disabled; not reading {}", url.display());
            self.fail_start();
            return;
        }

        match self.stat_toplevel(&url) {
            Ok(stat) => {
                let node = FileNode::from_os_stat(url.as_os_str(), &stat);
                let Some(top) = self.nodes.insert_child(root, node) else {
                    self.fail_start();
                    return;
                };
                self.events.emit(TreeEvent::ChildAdded(top));
                if stat.is_dir() {
                    self.queue.enqueue(ReadJob::Local(LocalReadJob::new(top, url)), None);
                }
                // The pseudo-root has all the children it will get
                self.events.emit(TreeEvent::ReadJobFinished(root));
                self.finish_if_idle();
            }
            Err(e) => {
                tracing::warn!("stat({}) failed: {}", url.display(), e);
                self.fail_start();
            }
        }
    }

    /// The toplevel was named explicitly, so a symlink to it is followed.
    fn stat_toplevel(&self, path: &Path) -> io::Result<FileStat> {
        self.fs.stat_follow(path)
    }

    fn fail_start(&mut self) {
        self.busy = false;
        self.events.emit(TreeEvent::Finished);
        self.events.emit(TreeEvent::FinalizeLocal(None));
    }

    fn finish_if_idle(&mut self) {
        if self.busy && self.queue.is_empty() {
            self.busy = false;
            tracing::info!("Reading finished; {} nodes in tree", self.nodes.len());
            self.events.emit(TreeEvent::Finished);
        }
    }

    /// Re-read a subtree, or everything when `subtree` is `None` or the root.
    /// Nodes outside the subtree keep their handles.
    pub fn refresh(&mut self, subtree: Option<NodeId>) {
        let root = self.nodes.root();
        let target = match subtree {
            Some(id) if !self.nodes.contains(id) => {
                tracing::warn!("Ignoring refresh of deleted node {:?}", id);
                return;
            }
            // A dot entry is not a filesystem object; re-read its directory
            Some(id) if self.nodes.get(id).is_dot_entry() => self.nodes.parent(id),
            other => other,
        };

        match target.filter(|&id| id != root) {
            Some(id) => self.refresh_subtree(id),
            None => match self.url() {
                Some(url) => self.start_reading(url),
                None => tracing::warn!("Nothing to refresh"),
            },
        }
    }

    fn refresh_subtree(&mut self, id: NodeId) {
        let Some(parent) = self.nodes.parent(id) else {
            tracing::error!("Cannot refresh unattached node {:?}", id);
            return;
        };
        // A plain file may sit in its directory's dot entry
        let old_dot = self.nodes.get(parent).is_dot_entry().then_some(parent);
        let dir = match old_dot {
            Some(dot) => match self.nodes.parent(dot) {
                Some(dir) => dir,
                None => {
                    tracing::error!("Dot entry {:?} has no parent", dot);
                    return;
                }
            },
            None => parent,
        };
        let path = self.nodes.node_path(id);
        let name = self.nodes.get(id).os_name().to_os_string();
        let toplevel = dir == self.nodes.root();
        tracing::info!("Refreshing {}", path.display());

        // A job still reading `dir` must not finish before the new subtree
        let dir_job = self.queue.job_for(dir);
        if let Some(job) = dir_job {
            self.queue.hold(job);
        }

        self.discard_jobs_below(id);
        self.nodes.set_excluded(id, false);
        self.events.emit(TreeEvent::DeletingChild(id));
        self.nodes.remove_subtree(id);
        self.events.emit(TreeEvent::ChildDeleted);

        self.busy = true;
        self.events.emit(TreeEvent::StartingReading);
        if let Some(job) = self.reinsert(dir, old_dot, &path, &name, toplevel) {
            self.queue.enqueue(job, dir_job);
        }
        if let Some(job) = dir_job {
            self.release_job(job);
        }
        self.finish_if_idle();
    }

    /// Stat `path` again and add the new node to `dir`, back into the dot
    /// entry if it is a plain file and `dir` groups its files in one.
    /// Returns the job that reads the new node if it is a directory.
    fn reinsert(
        &mut self,
        dir: NodeId,
        old_dot: Option<NodeId>,
        path: &Path,
        name: &OsStr,
        toplevel: bool,
    ) -> Option<ReadJob> {
        if !self.config.enable_local_dir_reader {
            tracing::warn!("Local directory reading is disabled; not refreshing {}", path.display());
            self.events.emit(TreeEvent::FinalizeLocal(None));
            return None;
        }

        let stat = if toplevel {
            self.stat_toplevel(path)
        } else {
            self.fs.stat(path)
        };
        let stat = match stat {
            Ok(stat) => stat,
            Err(e) => {
                tracing::warn!("stat({}) failed: {}", path.display(), e);
                self.events.emit(TreeEvent::FinalizeLocal(None));
                return None;
            }
        };

        let node = FileNode::from_os_stat(name, &stat);
        let into_dot = !stat.is_dir() && (old_dot.is_some() || self.nodes.dot_entry(dir).is_some());
        let added = if into_dot {
            self.nodes.add_entry(dir, node)?
        } else {
            Added {
                node: self.nodes.insert_child(dir, node)?,
                new_dot_entry: None,
            }
        };
        if let Some(dot) = added.new_dot_entry {
            self.events.emit(TreeEvent::ChildAdded(dot));
        }
        self.events.emit(TreeEvent::ChildAdded(added.node));

        if let Some(dot) = old_dot {
            if self.remove_empty_dot_entry(dot) {
                self.events.emit(TreeEvent::ChildDeleted);
            }
        }

        if !stat.is_dir() {
            return None;
        }
        let new = added.node;
        if !toplevel && stat.device != self.nodes.get(dir).device && !self.config.cross_filesystems {
            tracing::info!("Not descending into mounted filesystem {}", path.display());
            if let NodeKind::Directory(info) = &mut self.nodes.get_mut(new).kind {
                info.state = ReadState::OnRequestOnly;
                info.mount_point = true;
            }
            return None;
        }
        Some(ReadJob::Local(LocalReadJob::new(new, path)))
    }

    /// Stop reading. Directories not completely read are marked `Aborted`.
    /// Does nothing if no reading is in progress.
    pub fn abort_reading(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let Self {
            nodes,
            queue,
            fs,
            config,
            events,
            ..
        } = self;
        let mut ctx = JobContext {
            tree: nodes,
            fs: &**fs,
            config,
            events,
        };
        queue.abort(&mut ctx);
        self.busy = false;
        self.events.emit(TreeEvent::Aborted);
    }

    /// Drop all pending jobs and every node below the root.
    pub fn clear(&mut self) {
        self.queue.clear();
        let root = self.nodes.root();
        if self.nodes.has_children(root) {
            self.events.emit(TreeEvent::Clearing);
            self.nodes.clear_children(root);
        }
        self.busy = false;
    }

    /// Remove `node` and everything below it. An emptied dot entry is removed
    /// too once its directory has finished reading.
    pub fn delete_subtree(&mut self, node: NodeId) {
        if !self.nodes.contains(node) {
            tracing::warn!("Ignoring deletion of unknown node {:?}", node);
            return;
        }
        if node == self.nodes.root() {
            tracing::error!("Refusing to delete the root");
            return;
        }

        self.discard_jobs_below(node);
        let parent = self.nodes.parent(node);
        self.events.emit(TreeEvent::DeletingChild(node));
        self.nodes.remove_subtree(node);

        if let Some(dot) = parent.filter(|&p| self.nodes.get(p).is_dot_entry()) {
            self.remove_empty_dot_entry(dot);
        }

        self.events.emit(TreeEvent::ChildDeleted);
        self.finish_if_idle();
    }

    /// Remove a dot entry that a deletion left empty, but only once its
    /// directory has finished reading. Returns whether it was removed.
    fn remove_empty_dot_entry(&mut self, dot: NodeId) -> bool {
        if !self.nodes.contains(dot) || self.nodes.has_children(dot) {
            return false;
        }
        match self.nodes.parent(dot) {
            Some(dir) if self.nodes.read_state(dir) == Some(ReadState::Finished) => {
                self.events.emit(TreeEvent::DeletingChild(dot));
                self.nodes.remove_subtree(dot);
                true
            }
            Some(_) => false,
            None => {
                tracing::error!("Dot entry {:?} has no parent", dot);
                false
            }
        }
    }

    fn release_job(&mut self, job: JobId) {
        let Self {
            nodes,
            queue,
            fs,
            config,
            events,
            ..
        } = self;
        let mut ctx = JobContext {
            tree: nodes,
            fs: &**fs,
            config,
            events,
        };
        queue.release(job, &mut ctx);
    }

    fn discard_jobs_below(&mut self, top: NodeId) {
        let Self {
            nodes,
            queue,
            fs,
            config,
            events,
            ..
        } = self;
        let mut ctx = JobContext {
            tree: nodes,
            fs: &**fs,
            config,
            events,
        };
        queue.discard_subtree(&mut ctx, top);
    }

    /// Write the tree to a cache file; `.gz` files are compressed.
    pub fn write_cache(&self, path: impl AsRef<Path>) -> Result<u64, CacheError> {
        let top = self.first_toplevel().ok_or(CacheError::NoTree)?;
        writer::write_cache(&self.nodes, top, path.as_ref())
    }

    /// Replace the tree with the contents of a cache file. The file is opened
    /// and its header checked right away; the entries are read by `step()`.
    pub fn read_cache(&mut self, path: impl AsRef<Path>) -> Result<(), CacheError> {
        let input = reader::open(path.as_ref())?;
        let root = self.nodes.root();
        if self.nodes.has_children(root) {
            self.clear();
        }
        self.busy = true;
        self.events.emit(TreeEvent::StartingReading);
        self.queue.enqueue(ReadJob::Cache(CacheReadJob::new(root, input)), None);
        Ok(())
    }

    /// Do one bounded unit of reading. Returns whether reading is still going on.
    pub fn step(&mut self) -> bool {
        if !self.queue.is_empty() {
            let Self {
                nodes,
                queue,
                fs,
                config,
                events,
                ..
            } = self;
            let mut ctx = JobContext {
                tree: nodes,
                fs: &**fs,
                config,
                events,
            };
            queue.step(&mut ctx);
        }
        self.finish_if_idle();
        self.busy
    }

    pub fn run_to_completion(&mut self) {
        while self.step() {}
    }

    pub fn send_progress_info(&mut self, text: impl Into<String>) {
        self.events.emit(TreeEvent::ProgressInfo(text.into()));
    }
}
