//! Human-readable summaries of tree nodes for the command line tools.

use crate::tree::aggregate::children_by_size;
use crate::tree::arena::{FileTree, NodeId, NodeKind, ReadState};

/// What the `dirstat` binary prints about one node.
#[derive(Debug)]
pub struct NodeSummary {
    pub name: String,
    pub full_path: String,
    pub size_display: String,
    pub allocated_display: String,
    pub kind: &'static str,
    pub state: Option<ReadState>,
    pub items: u64,
    pub files: u64,
    pub sub_dirs: u64,
    pub error_dirs: u64,
    pub read_error: bool,
}

pub fn build_summary(tree: &FileTree, node_id: NodeId) -> NodeSummary {
    let node = tree.get(node_id);
    let totals = tree.totals(node_id);

    NodeSummary {
        name: node.name.to_string(),
        full_path: tree.node_path(node_id).display().to_string(),
        size_display: format_size(totals.size),
        allocated_display: format_size(totals.allocated),
        kind: kind_label(&node.kind),
        state: node.read_state(),
        items: totals.items,
        files: totals.files,
        sub_dirs: totals.sub_dirs,
        error_dirs: totals.error_dirs,
        read_error: node.read_error,
    }
}

fn kind_label(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::File => "file",
        NodeKind::Symlink => "symlink",
        NodeKind::Special => "special",
        NodeKind::Directory(_) => "directory",
        NodeKind::DotEntry(_) => "files",
    }
}

pub fn state_label(state: ReadState) -> &'static str {
    match state {
        ReadState::Queued => "queued",
        ReadState::Reading => "reading",
        ReadState::Finished => "finished",
        ReadState::OnRequestOnly => "not read (mount point)",
        ReadState::Aborted => "aborted",
        ReadState::Error => "unreadable",
    }
}

/// Format bytes into human-readable size string.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One line per entry of `dir`, largest first: size, share of the parent, name.
pub fn largest_children(tree: &FileTree, dir: NodeId, limit: usize) -> Vec<String> {
    let total = tree.total_size(dir).max(1);
    children_by_size(tree, dir)
        .into_iter()
        .take(limit)
        .map(|id| {
            let node = tree.get(id);
            let size = tree.total_size(id);
            let marker = match node.read_state() {
                Some(state @ (ReadState::Aborted | ReadState::Error | ReadState::OnRequestOnly)) => {
                    format!("  [{}]", state_label(state))
                }
                _ if node.read_error => "  [unreadable]".to_string(),
                _ => String::new(),
            };
            let suffix = if node.is_dir() { "/" } else { "" };
            format!(
                "{:>10}  {:5.1}%  {}{}{}",
                format_size(size),
                size as f64 * 100.0 / total as f64,
                node.name,
                suffix,
                marker
            )
        })
        .collect()
}
