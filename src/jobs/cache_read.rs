use std::io::BufRead;

use super::{JobContext, ReadOutcome};
use crate::cache::reader::{self, CacheInput, EntryRecord, Record, RecordKind};
use crate::scanner::types::{EntryKind, FileStat};
use crate::tree::arena::{FileNode, NodeId, NodeKind, ReadState};

/// Rebuilds a tree from a cache file below `target` (normally the pseudo-root).
///
/// The whole file is consumed in one step; directories are closed, and their
/// jobs finished, as their `<` lines are reached.
pub struct CacheReadJob {
    target: NodeId,
    input: Option<CacheInput>,
}

impl CacheReadJob {
    pub fn new(target: NodeId, input: CacheInput) -> Self {
        Self {
            target,
            input: Some(input),
        }
    }

    pub fn dir(&self) -> NodeId {
        self.target
    }

    pub(super) fn start(&mut self, _ctx: &mut JobContext<'_>) {
        if let Some(input) = &self.input {
            tracing::info!("Reading cache file {}", input.path.display());
        }
    }

    pub(super) fn read_some(&mut self, ctx: &mut JobContext<'_>) -> ReadOutcome {
        if let Some(input) = self.input.take() {
            self.materialize(ctx, input);
        }
        ReadOutcome {
            exhausted: true,
            spawned: Vec::new(),
        }
    }

    fn materialize(&self, ctx: &mut JobContext<'_>, mut input: CacheInput) {
        let path = input.path.display().to_string();
        // Open directories, innermost last, with the state they get when closed
        let mut open: Vec<(NodeId, ReadState)> = Vec::new();
        let mut seen_toplevel = false;
        let mut entries = 0u64;
        let mut line = String::new();

        loop {
            line.clear();
            match input.lines.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => input.line_no += 1,
                Err(e) => {
                    tracing::warn!("{}:{}: read error: {}", path, input.line_no + 1, e);
                    break;
                }
            }

            let record = match reader::parse_line(&line) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("{}:{}: skipping malformed line: {}", path, input.line_no, e);
                    continue;
                }
            };

            let rec = match record {
                Record::Close => match open.pop() {
                    Some((dir, state)) => {
                        close_dir(ctx, dir, state);
                        continue;
                    }
                    None => {
                        tracing::error!("{}:{}: '<' without an open directory", path, input.line_no);
                        break;
                    }
                },
                Record::Entry(rec) => rec,
            };

            let parent = match open.last() {
                Some(&(dir, _)) => dir,
                None if !seen_toplevel && rec.kind == RecordKind::Dir => self.target,
                None => {
                    tracing::error!(
                        "{}:{}: entry '{}' is outside of any directory",
                        path,
                        input.line_no,
                        rec.name.to_string_lossy()
                    );
                    break;
                }
            };

            let (node, end_state) = node_from_record(&rec);
            let Some(added) = ctx.tree.add_entry(parent, node) else {
                continue;
            };
            super::notify_added(ctx, added);
            entries += 1;

            if rec.kind == RecordKind::Dir {
                ctx.tree.set_read_state(added.node, ReadState::Reading);
                open.push((added.node, end_state));
                seen_toplevel = true;
            }
        }

        if !open.is_empty() {
            tracing::warn!("{}: {} directories were not closed", path, open.len());
        }
        while let Some((dir, _)) = open.pop() {
            close_dir(ctx, dir, ReadState::Aborted);
        }
        tracing::info!("Read {} entries from cache file {}", entries, path);
    }
}

fn node_from_record(rec: &EntryRecord) -> (FileNode, ReadState) {
    let kind = match rec.kind {
        RecordKind::Dir => EntryKind::Directory,
        RecordKind::Symlink => EntryKind::Symlink,
        RecordKind::File if rec.flags.special => EntryKind::Special,
        RecordKind::File => EntryKind::File,
    };
    let mut stat = FileStat::new(kind, rec.size);
    stat.allocated = rec.allocated.unwrap_or(rec.size);
    stat.mtime = rec.mtime;
    stat.links = rec.links;
    stat.uid = rec.uid;
    stat.gid = rec.gid;

    let mut node = FileNode::from_os_stat(&rec.name, &stat);
    node.excluded = rec.flags.excluded;
    node.read_error = rec.flags.read_error;
    if let NodeKind::Directory(info) = &mut node.kind {
        info.mount_point = rec.flags.mount_point;
    }

    let end_state = if rec.flags.read_error {
        ReadState::Error
    } else if rec.flags.aborted {
        ReadState::Aborted
    } else if rec.flags.mount_point {
        ReadState::OnRequestOnly
    } else {
        ReadState::Finished
    };
    (node, end_state)
}

fn close_dir(ctx: &mut JobContext<'_>, dir: NodeId, state: ReadState) {
    super::finalize_local(ctx, dir);
    ctx.tree.set_read_state(dir, state);
    super::finish_dir(ctx, dir);
}
