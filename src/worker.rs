//! Running a [`DirTree`] on a background thread.
//!
//! The tree lives on the worker thread; the owner talks to it through
//! commands and receives its events over a channel. Between commands the
//! worker keeps calling `step()` while the tree is busy.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::cache::CacheError;
use crate::tree::arena::NodeId;
use crate::tree::events::TreeEvent;
use crate::tree::DirTree;

type Inspector = Box<dyn FnOnce(&DirTree) + Send>;

pub enum TreeCommand {
    StartReading(PathBuf),
    Refresh(Option<NodeId>),
    /// Acknowledged once reading has stopped
    Abort(Sender<()>),
    Clear,
    DeleteSubtree(NodeId),
    WriteCache(PathBuf, Sender<Result<u64, CacheError>>),
    ReadCache(PathBuf, Sender<Result<(), CacheError>>),
    Inspect(Inspector),
    Shutdown,
}

/// Handle to a reader thread that owns a [`DirTree`].
pub struct ScanWorker {
    commands: Sender<TreeCommand>,
    events: Receiver<TreeEvent>,
    handle: Option<JoinHandle<DirTree>>,
}

impl ScanWorker {
    pub fn spawn(mut tree: DirTree) -> anyhow::Result<Self> {
        let events = tree.subscribe();
        let (commands, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("dirstat-reader".to_string())
            .spawn(move || run(tree, rx))
            .context("Failed to spawn reader thread")?;

        Ok(Self {
            commands,
            events,
            handle: Some(handle),
        })
    }

    fn send(&self, command: TreeCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("reader thread has exited"))
    }

    pub fn start_reading(&self, path: impl Into<PathBuf>) -> anyhow::Result<()> {
        self.send(TreeCommand::StartReading(path.into()))
    }

    pub fn refresh(&self, subtree: Option<NodeId>) -> anyhow::Result<()> {
        self.send(TreeCommand::Refresh(subtree))
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        self.send(TreeCommand::Clear)
    }

    pub fn delete_subtree(&self, node: NodeId) -> anyhow::Result<()> {
        self.send(TreeCommand::DeleteSubtree(node))
    }

    /// Stop reading and wait until the worker has done so.
    pub fn abort(&self) -> anyhow::Result<()> {
        let (ack, done) = mpsc::channel();
        self.send(TreeCommand::Abort(ack))?;
        done.recv().context("reader thread exited during abort")
    }

    pub fn write_cache(&self, path: impl Into<PathBuf>) -> anyhow::Result<u64> {
        let (reply, result) = mpsc::channel();
        self.send(TreeCommand::WriteCache(path.into(), reply))?;
        Ok(result.recv().context("reader thread exited while writing the cache")??)
    }

    pub fn read_cache(&self, path: impl Into<PathBuf>) -> anyhow::Result<()> {
        let (reply, result) = mpsc::channel();
        self.send(TreeCommand::ReadCache(path.into(), reply))?;
        Ok(result.recv().context("reader thread exited while opening the cache")??)
    }

    /// Run `f` against the tree on the worker thread and return its result.
    pub fn inspect<R, F>(&self, f: F) -> anyhow::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&DirTree) -> R + Send + 'static,
    {
        let (reply, result) = mpsc::channel();
        self.send(TreeCommand::Inspect(Box::new(move |tree| {
            let _ = reply.send(f(tree));
        })))?;
        result.recv().context("reader thread exited during inspection")
    }

    /// Drain all events available right now.
    pub fn poll(&self) -> Vec<TreeEvent> {
        self.events.try_iter().collect()
    }

    pub fn next_event(&self, timeout: Duration) -> Option<TreeEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Stop the worker and take the tree back.
    pub fn shutdown(mut self) -> anyhow::Result<DirTree> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("reader thread already joined"))?;
        // The thread may be gone already; joining tells us how it ended
        let _ = self.commands.send(TreeCommand::Shutdown);
        handle.join().map_err(|_| anyhow!("reader thread panicked"))
    }
}

impl Drop for ScanWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.commands.send(TreeCommand::Shutdown);
            let _ = handle.join();
        }
    }
}

fn run(mut tree: DirTree, commands: Receiver<TreeCommand>) -> DirTree {
    loop {
        let command = if tree.is_busy() {
            match commands.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            }
        };

        match command {
            Some(TreeCommand::Shutdown) => break,
            Some(command) => apply(&mut tree, command),
            None => {
                tree.step();
            }
        }
    }

    if tree.is_busy() {
        tree.abort_reading();
    }
    tracing::debug!("Reader thread exiting");
    tree
}

fn apply(tree: &mut DirTree, command: TreeCommand) {
    match command {
        TreeCommand::StartReading(path) => tree.start_reading(path),
        TreeCommand::Refresh(subtree) => tree.refresh(subtree),
        TreeCommand::Abort(ack) => {
            tree.abort_reading();
            let _ = ack.send(());
        }
        TreeCommand::Clear => tree.clear(),
        TreeCommand::DeleteSubtree(node) => tree.delete_subtree(node),
        TreeCommand::WriteCache(path, reply) => {
            let _ = reply.send(tree.write_cache(path));
        }
        TreeCommand::ReadCache(path, reply) => {
            let _ = reply.send(tree.read_cache(path));
        }
        TreeCommand::Inspect(f) => f(tree),
        TreeCommand::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadConfig;
    use crate::scanner::memory::MemFs;

    fn wait_for_finished(worker: &ScanWorker) -> Vec<TreeEvent> {
        let mut seen = Vec::new();
        while let Some(event) = worker.next_event(Duration::from_secs(5)) {
            let done = matches!(event, TreeEvent::Finished | TreeEvent::Aborted);
            seen.push(event);
            if done {
                return seen;
            }
        }
        panic!("reader did not finish; events so far: {seen:?}");
    }

    fn sample_tree() -> DirTree {
        let fs = MemFs::new();
        fs.dir("/w").dir("/w/x").file("/w/x/one", 10).file("/w/two", 20);
        DirTree::with_source(ReadConfig::default(), Box::new(fs))
    }

    #[test]
    fn reads_in_the_background() {
        let worker = ScanWorker::spawn(sample_tree()).unwrap();
        worker.start_reading("/w").unwrap();
        let events = wait_for_finished(&worker);
        assert_eq!(events.first(), Some(&TreeEvent::StartingReading));

        let size = worker
            .inspect(|tree| tree.totals(tree.first_toplevel().unwrap()).size)
            .unwrap();
        assert_eq!(size, 30);

        let tree = worker.shutdown().unwrap();
        assert!(!tree.is_busy());
        assert_eq!(tree.url(), Some(PathBuf::from("/w")));
    }

    #[test]
    fn abort_stops_a_running_read() {
        let fs = MemFs::new();
        fs.dir("/big");
        for i in 0..200 {
            fs.dir(&format!("/big/d{i}")).file(&format!("/big/d{i}/f"), 1);
        }
        let tree = DirTree::with_source(ReadConfig::default().with_entries_per_step(1), Box::new(fs));
        let worker = ScanWorker::spawn(tree).unwrap();
        worker.start_reading("/big").unwrap();
        worker.abort().unwrap();

        // Everything emitted before the abort is already queued
        assert!(worker.poll().contains(&TreeEvent::Aborted));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!worker.inspect(DirTree::is_busy).unwrap());
        let late = worker.poll();
        assert!(
            !late.iter().any(|e| matches!(e, TreeEvent::ChildAdded(_))),
            "children added after abort: {late:?}"
        );

        // Aborting an idle tree is a no-op
        worker.abort().unwrap();
        assert!(worker.poll().is_empty());
    }

    #[test]
    fn cache_commands_report_errors() {
        let worker = ScanWorker::spawn(sample_tree()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = worker.write_cache(dir.path().join("none.cache")).unwrap_err();
        assert!(matches!(err.downcast_ref::<CacheError>(), Some(CacheError::NoTree)));

        worker.start_reading("/w").unwrap();
        wait_for_finished(&worker);
        assert_eq!(worker.write_cache(dir.path().join("w.cache")).unwrap(), 4);

        worker.read_cache(dir.path().join("w.cache")).unwrap();
        wait_for_finished(&worker);
        let url = worker.inspect(DirTree::url).unwrap();
        assert_eq!(url, Some(PathBuf::from("/w")));
    }
}
