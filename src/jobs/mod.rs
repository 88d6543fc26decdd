//! Directory read jobs and the queue that runs them.
//!
//! A job moves through `Queued -> Active -> Waiting -> (gone)`. It is Active
//! while it still has entries of its own to read, Waiting while sub-jobs it
//! spawned are outstanding, and is finalized once both are done. A parent job
//! therefore always finishes after all of its sub-jobs.

pub mod cache_read;
pub mod local;

use std::collections::{HashSet, VecDeque};

use crate::config::ReadConfig;
use crate::scanner::FsSource;
use crate::tree::arena::{Added, FileTree, NodeId, ReadState};
use crate::tree::events::{EventSink, TreeEvent};

pub use self::cache_read::CacheReadJob;
pub use self::local::LocalReadJob;

/// Everything a job may touch while it runs.
pub struct JobContext<'a> {
    pub tree: &'a mut FileTree,
    pub fs: &'a dyn FsSource,
    pub config: &'a ReadConfig,
    pub events: &'a mut EventSink,
}

/// One pending unit of traversal work for one directory.
pub enum ReadJob {
    Local(LocalReadJob),
    Cache(CacheReadJob),
}

/// What one step of a job produced.
pub(crate) struct ReadOutcome {
    /// The job has no entries of its own left
    pub exhausted: bool,
    pub spawned: Vec<ReadJob>,
}

/// (device, inode) pairs of directories already read in this pass
pub(crate) type SeenDirs = HashSet<(u64, u64)>;

impl ReadJob {
    /// The directory this job fills.
    pub fn dir(&self) -> NodeId {
        match self {
            ReadJob::Local(job) => job.dir(),
            ReadJob::Cache(job) => job.dir(),
        }
    }

    fn start(&mut self, ctx: &mut JobContext<'_>, seen: &mut SeenDirs) {
        match self {
            ReadJob::Local(job) => job.start(ctx, seen),
            ReadJob::Cache(job) => job.start(ctx),
        }
    }

    fn read_some(&mut self, ctx: &mut JobContext<'_>, seen: &mut SeenDirs) -> ReadOutcome {
        match self {
            ReadJob::Local(job) => job.read_some(ctx, seen),
            ReadJob::Cache(job) => job.read_some(ctx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Active,
    /// Own entries exhausted, sub-jobs still pending
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(usize);

struct JobSlot {
    job: ReadJob,
    state: JobState,
    parent: Option<JobId>,
    pending: usize,
}

/// FIFO of read jobs with a cap on how many are Active at once.
#[derive(Default)]
pub struct JobQueue {
    slots: Vec<Option<JobSlot>>,
    queued: VecDeque<JobId>,
    active: VecDeque<JobId>,
    live: usize,
    started: u64,
    seen_dirs: SeenDirs,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Jobs not yet finalized, in any state.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.slot(id).map(|slot| slot.state)
    }

    fn slot(&self, id: JobId) -> Option<&JobSlot> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: JobId) -> Option<&mut JobSlot> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn enqueue(&mut self, job: ReadJob, parent: Option<JobId>) -> JobId {
        if let Some(parent) = parent.and_then(|p| self.slot_mut(p)) {
            parent.pending += 1;
        }
        let id = JobId(self.slots.len());
        self.slots.push(Some(JobSlot {
            job,
            state: JobState::Queued,
            parent,
            pending: 0,
        }));
        self.queued.push_back(id);
        self.live += 1;
        id
    }

    /// Run one bounded unit of work. Returns false if there was nothing to do.
    pub fn step(&mut self, ctx: &mut JobContext<'_>) -> bool {
        let max_active = ctx.config.max_active_jobs.max(1);
        while self.active.len() < max_active {
            let Some(id) = self.queued.pop_front() else {
                break;
            };
            self.admit(id, ctx);
        }

        let Some(id) = self.active.pop_front() else {
            return false;
        };
        let Some(slot) = self.slots.get_mut(id.0).and_then(Option::as_mut) else {
            tracing::error!("Active read job {:?} has no slot", id);
            return true;
        };

        let outcome = slot.job.read_some(ctx, &mut self.seen_dirs);
        if outcome.exhausted {
            slot.state = JobState::Waiting;
        }
        for job in outcome.spawned {
            self.enqueue(job, Some(id));
        }

        if !outcome.exhausted {
            // Round-robin between active jobs
            self.active.push_back(id);
        } else if self.slot(id).is_some_and(|slot| slot.pending == 0) {
            self.finish(id, ctx);
        }
        true
    }

    fn admit(&mut self, id: JobId, ctx: &mut JobContext<'_>) {
        let Some(slot) = self.slots.get_mut(id.0).and_then(Option::as_mut) else {
            return;
        };
        slot.state = JobState::Active;
        self.started += 1;

        let interval = ctx.config.progress_interval;
        if interval > 0 && self.started % interval == 0 {
            let path = ctx.tree.node_path(slot.job.dir());
            ctx.events.emit(TreeEvent::ProgressInfo(format!(
                "Reading {} ({} directories so far)",
                path.display(),
                self.started
            )));
        }

        slot.job.start(ctx, &mut self.seen_dirs);
        self.active.push_back(id);
    }

    fn take(&mut self, id: JobId) -> Option<JobSlot> {
        let slot = self.slots.get_mut(id.0)?.take()?;
        self.live -= 1;
        if self.live == 0 {
            self.reset();
        }
        Some(slot)
    }

    fn reset(&mut self) {
        self.slots.clear();
        self.queued.clear();
        self.active.clear();
        self.live = 0;
        self.seen_dirs.clear();
    }

    /// Finalize a job and every waiting ancestor job it was the last one to hold up.
    fn finish(&mut self, id: JobId, ctx: &mut JobContext<'_>) {
        let mut next = Some(id);
        while let Some(id) = next.take() {
            let Some(slot) = self.take(id) else {
                tracing::error!("Read job {:?} finished twice", id);
                return;
            };
            finish_dir(ctx, slot.job.dir());

            if let Some(parent_id) = slot.parent {
                if let Some(parent) = self.slot_mut(parent_id) {
                    parent.pending = parent.pending.saturating_sub(1);
                    if parent.pending == 0 && parent.state == JobState::Waiting {
                        next = Some(parent_id);
                    }
                }
            }
        }
    }

    /// The live job filling `dir`, if any.
    pub fn job_for(&self, dir: NodeId) -> Option<JobId> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.job.dir() == dir))
            .map(JobId)
    }

    /// Keep job `id` from finishing as if it had one more sub-job, until
    /// [`JobQueue::release`] is called.
    pub fn hold(&mut self, id: JobId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.pending += 1;
        }
    }

    /// Drop one hold or sub-job of `id`; the job finishes now if it was
    /// only waiting for that.
    pub fn release(&mut self, id: JobId, ctx: &mut JobContext<'_>) {
        let ready = match self.slot_mut(id) {
            Some(slot) => {
                slot.pending = slot.pending.saturating_sub(1);
                slot.pending == 0 && slot.state == JobState::Waiting
            }
            None => false,
        };
        if ready {
            self.finish(id, ctx);
        }
    }

    /// Drop every job. Unfinished directories are marked `Aborted`.
    pub fn abort(&mut self, ctx: &mut JobContext<'_>) {
        let mut aborted = 0;
        for slot in self.slots.iter().flatten() {
            let dir = slot.job.dir();
            if ctx.tree.contains(dir)
                && matches!(
                    ctx.tree.read_state(dir),
                    Some(ReadState::Queued | ReadState::Reading)
                )
            {
                ctx.tree.set_read_state(dir, ReadState::Aborted);
                sync_dot_entry_state(ctx.tree, dir);
                aborted += 1;
            }
        }
        tracing::info!("Aborted reading; {} directories left incomplete", aborted);
        self.reset();
    }

    /// Drop every job without touching the tree.
    pub fn clear(&mut self) {
        self.reset();
    }

    /// Drop the jobs of directories inside the subtree of `top`, e.g. before
    /// that subtree is deleted. Parent jobs outside the subtree stop waiting
    /// for them and may finish as a result.
    pub fn discard_subtree(&mut self, ctx: &mut JobContext<'_>, top: NodeId) {
        let doomed: HashSet<JobId> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let slot = slot.as_ref()?;
                ctx.tree
                    .is_in_subtree(slot.job.dir(), top)
                    .then_some(JobId(i))
            })
            .collect();
        if doomed.is_empty() {
            return;
        }
        tracing::debug!("Discarding {} read jobs below {:?}", doomed.len(), top);

        self.queued.retain(|id| !doomed.contains(id));
        self.active.retain(|id| !doomed.contains(id));

        let mut parents = Vec::new();
        for &id in &doomed {
            if let Some(slot) = self.take(id) {
                if let Some(parent) = slot.parent.filter(|p| !doomed.contains(p)) {
                    parents.push(parent);
                }
            }
        }

        for parent_id in parents {
            self.release(parent_id, ctx);
        }
    }
}

/// Tell observers about a node added by a job, dot entry first.
pub(crate) fn notify_added(ctx: &mut JobContext<'_>, added: Added) {
    if let Some(dot) = added.new_dot_entry {
        ctx.events.emit(TreeEvent::ChildAdded(dot));
    }
    ctx.events.emit(TreeEvent::ChildAdded(added.node));
}

/// A directory's own entries are exhausted: tidy up its dot entry and notify.
pub(crate) fn finalize_local(ctx: &mut JobContext<'_>, dir: NodeId) {
    cleanup_dot_entry(ctx, dir);
    ctx.events.emit(TreeEvent::FinalizeLocal(Some(dir)));
}

/// Drop an empty dot entry; dissolve it into its parent when the parent has
/// no subdirectories to separate the files from.
fn cleanup_dot_entry(ctx: &mut JobContext<'_>, dir: NodeId) {
    let Some(dot) = ctx.tree.dot_entry(dir) else {
        return;
    };
    if ctx.tree.first_child(dot).is_some() {
        let has_subdirs = ctx.tree.children(dir).any(|id| ctx.tree.get(id).is_dir());
        if has_subdirs {
            return;
        }
        ctx.tree.adopt_dot_entry_children(dir);
    }
    ctx.events.emit(TreeEvent::DeletingChild(dot));
    ctx.tree.remove_subtree(dot);
    ctx.events.emit(TreeEvent::ChildDeleted);
}

/// A dot entry is read together with its directory.
fn sync_dot_entry_state(tree: &mut FileTree, dir: NodeId) {
    if let (Some(dot), Some(state)) = (tree.dot_entry(dir), tree.read_state(dir)) {
        tree.set_read_state(dot, state);
    }
}

/// A directory and all of its sub-jobs are done.
pub(crate) fn finish_dir(ctx: &mut JobContext<'_>, dir: NodeId) {
    if dir == ctx.tree.root() || !ctx.tree.contains(dir) {
        return;
    }
    if matches!(
        ctx.tree.read_state(dir),
        Some(ReadState::Queued | ReadState::Reading)
    ) {
        ctx.tree.set_read_state(dir, ReadState::Finished);
    }
    sync_dot_entry_state(ctx.tree, dir);
    // Resolve the cached totals while the directory is hot
    ctx.tree.totals(dir);
    ctx.events.emit(TreeEvent::ReadJobFinished(dir));
}
