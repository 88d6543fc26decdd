use super::arena::{FileTree, NodeId, NodeKind, Totals};

/// A directory whose cached totals disagree with a recount of its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotalsMismatch {
    pub node: NodeId,
    pub expected: Totals,
    pub actual: Totals,
}

/// Recount the totals of every directory below `top` from its direct entries
/// and compare with the cached values. Returns every directory that disagrees.
///
/// Each directory is checked against the totals of its children, so a clean
/// result means the whole subtree is consistent.
pub fn verify_totals(tree: &FileTree, top: NodeId) -> Vec<TotalsMismatch> {
    let mut mismatches = Vec::new();
    let mut stack = vec![top];
    while let Some(dir) = stack.pop() {
        if tree.get(dir).dir_info().is_none() {
            continue;
        }
        let expected = recount(tree, dir);
        let actual = tree.totals(dir);
        if expected != actual {
            tracing::warn!(
                "Totals of {} are off: cached {:?}, counted {:?}",
                tree.node_path(dir).display(),
                actual,
                expected
            );
            mismatches.push(TotalsMismatch {
                node: dir,
                expected,
                actual,
            });
        }
        stack.extend(tree.entries(dir));
    }
    mismatches
}

fn recount(tree: &FileTree, dir: NodeId) -> Totals {
    let node = tree.get(dir);
    let mut sum = Totals {
        size: node.size,
        allocated: node.allocated,
        ..Totals::default()
    };

    for child in tree.entries(dir) {
        let node = tree.get(child);
        if node.excluded {
            continue;
        }
        match &node.kind {
            NodeKind::File | NodeKind::Symlink | NodeKind::Special => {
                sum.size += node.size;
                sum.allocated += node.allocated;
                sum.items += 1;
                sum.files += 1;
            }
            NodeKind::Directory(_) => {
                let sub = tree.totals(child);
                sum.size += sub.size;
                sum.allocated += sub.allocated;
                sum.items += sub.items + 1;
                sum.files += sub.files;
                sum.sub_dirs += sub.sub_dirs + 1;
                sum.error_dirs += sub.error_dirs + u64::from(node.read_error);
            }
            NodeKind::DotEntry(_) => {
                let sub = tree.totals(child);
                sum.size += sub.size;
                sum.allocated += sub.allocated;
                sum.items += sub.items;
                sum.files += sub.files;
                sum.sub_dirs += sub.sub_dirs;
                sum.error_dirs += sub.error_dirs;
            }
        }
    }
    sum
}

/// Entries of `dir` (dot entry included) sorted by total size, largest first.
/// Ties keep tree order.
pub fn children_by_size(tree: &FileTree, dir: NodeId) -> Vec<NodeId> {
    let mut children: Vec<(NodeId, u64)> = tree
        .entries(dir)
        .map(|id| (id, tree.total_size(id)))
        .collect();
    children.sort_by(|a, b| b.1.cmp(&a.1));
    children.into_iter().map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::types::{EntryKind, FileStat};
    use crate::tree::arena::FileNode;

    fn node(name: &str, kind: EntryKind, size: u64) -> FileNode {
        FileNode::from_stat(name, &FileStat::new(kind, size))
    }

    #[test]
    fn incremental_totals_match_a_recount() {
        let mut tree = FileTree::new();
        let root = tree.root();
        let top = tree.insert_child(root, node("/t", EntryKind::Directory, 4096)).unwrap();
        let a = tree.add_entry(top, node("a", EntryKind::Directory, 4096)).unwrap().node;
        let b = tree.add_entry(top, node("b", EntryKind::Directory, 4096)).unwrap().node;
        for i in 0..5 {
            tree.add_entry(a, node(&format!("f{i}"), EntryKind::File, 10 * i)).unwrap();
            tree.add_entry(b, node(&format!("g{i}"), EntryKind::Symlink, i)).unwrap();
        }
        assert!(verify_totals(&tree, root).is_empty());

        // Mutate after totals are cached: detach subtracts incrementally
        let dot = tree.dot_entry(a).unwrap();
        let first = tree.first_child(dot).unwrap();
        tree.remove_subtree(first);
        tree.set_excluded(b, true);
        tree.remove_subtree(tree.first_child(tree.dot_entry(b).unwrap()).unwrap());
        assert!(verify_totals(&tree, root).is_empty());
        assert_eq!(tree.total_size(top), 4096 * 2 + 100);
    }

    #[test]
    fn children_are_listed_largest_first() {
        let mut tree = FileTree::new();
        let root = tree.root();
        let top = tree.insert_child(root, node("/t", EntryKind::Directory, 0)).unwrap();
        let small = tree.add_entry(top, node("small", EntryKind::Directory, 1)).unwrap().node;
        let big = tree.add_entry(top, node("big", EntryKind::Directory, 0)).unwrap().node;
        tree.add_entry(big, node("x", EntryKind::File, 500)).unwrap();
        let files = tree.add_entry(top, node("f", EntryKind::File, 20)).unwrap();
        let dot = files.new_dot_entry.unwrap();

        assert_eq!(children_by_size(&tree, top), vec![big, dot, small]);
    }
}
