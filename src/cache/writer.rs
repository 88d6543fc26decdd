//! Writing a tree to a cache file.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::escape::encode_name;
use super::reader::format_mtime;
use super::{header_line, is_gzip_path, CacheError};
use crate::tree::arena::{FileTree, NodeId, NodeKind, ReadState};

/// Write the subtree of `top` (a directory) to `path`. Returns the number of
/// entries written.
pub fn write_cache(tree: &FileTree, top: NodeId, path: &Path) -> Result<u64, CacheError> {
    if !tree.get(top).is_dir() {
        return Err(CacheError::NotADirectory {
            path: tree.node_path(top),
        });
    }

    let file = File::create(path).map_err(|e| CacheError::io(path, e))?;
    let count = if is_gzip_path(path) {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let count = write_records(tree, top, &mut encoder).map_err(|e| CacheError::io(path, e))?;
        encoder
            .finish()
            .and_then(|mut out| out.flush())
            .map_err(|e| CacheError::io(path, e))?;
        count
    } else {
        let mut out = BufWriter::new(file);
        let count = write_records(tree, top, &mut out).map_err(|e| CacheError::io(path, e))?;
        out.flush().map_err(|e| CacheError::io(path, e))?;
        count
    };

    tracing::info!("Wrote {} entries to cache file {}", count, path.display());
    Ok(count)
}

enum Frame {
    Enter(NodeId),
    Close,
}

/// Write header and records for the subtree of directory `top`.
pub fn write_records<W: Write>(tree: &FileTree, top: NodeId, out: &mut W) -> io::Result<u64> {
    writeln!(out, "{}", header_line())?;
    writeln!(out, "# Do not edit!")?;
    writeln!(out, "#")?;
    writeln!(out, "# Type name size mtime [alloc:N] [links:N] [uid:N] [gid:N] [flags]")?;
    writeln!(out)?;

    let mut count = 0;
    let mut stack = vec![Frame::Enter(top)];
    while let Some(frame) = stack.pop() {
        let dir = match frame {
            Frame::Close => {
                writeln!(out, "<")?;
                continue;
            }
            Frame::Enter(dir) => dir,
        };

        write_entry(tree, dir, dir == top, out)?;
        count += 1;

        // Plain entries first: the dot entry's files, then loose files
        let plain = tree
            .dot_entry(dir)
            .into_iter()
            .flat_map(|dot| tree.children(dot))
            .chain(tree.children(dir).filter(|&id| !tree.get(id).is_dir()));
        for id in plain {
            write_entry(tree, id, false, out)?;
            count += 1;
        }

        stack.push(Frame::Close);
        let subdirs: Vec<NodeId> = tree.children(dir).filter(|&id| tree.get(id).is_dir()).collect();
        stack.extend(subdirs.into_iter().rev().map(Frame::Enter));
    }
    Ok(count)
}

fn write_entry<W: Write>(tree: &FileTree, id: NodeId, toplevel: bool, out: &mut W) -> io::Result<()> {
    let node = tree.get(id);
    let kind = match node.kind {
        NodeKind::Directory(_) | NodeKind::DotEntry(_) => "D",
        NodeKind::Symlink => "L",
        NodeKind::File | NodeKind::Special => "F",
    };
    // The toplevel carries its absolute path so the tree can be rebuilt anywhere
    let name = if toplevel {
        encode_name(tree.node_path(id).as_os_str())
    } else {
        encode_name(node.os_name())
    };

    write!(out, "{} {} {} {}", kind, name, node.size, format_mtime(node.mtime))?;
    if node.allocated != node.size {
        write!(out, " alloc:{}", node.allocated)?;
    }
    if node.links > 1 {
        write!(out, " links:{}", node.links)?;
    }
    if node.uid != 0 {
        write!(out, " uid:{}", node.uid)?;
    }
    if node.gid != 0 {
        write!(out, " gid:{}", node.gid)?;
    }

    if node.read_error {
        write!(out, " err")?;
    }
    if node.excluded {
        write!(out, " excl")?;
    }
    if matches!(node.kind, NodeKind::Special) {
        write!(out, " special")?;
    }
    if let Some(info) = node.dir_info() {
        if info.mount_point {
            write!(out, " mount")?;
        }
        // A directory that never finished is marked so readers do not trust it
        if matches!(
            info.state,
            ReadState::Aborted | ReadState::Queued | ReadState::Reading
        ) {
            write!(out, " aborted")?;
        }
    }
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::reader::{parse_line, Record, RecordKind};
    use crate::scanner::types::{EntryKind, FileStat};
    use crate::tree::arena::FileNode;

    fn node(name: &str, kind: EntryKind, size: u64) -> FileNode {
        let mut stat = FileStat::new(kind, size);
        stat.mtime = 0x100;
        FileNode::from_stat(name, &stat)
    }

    fn written(tree: &FileTree, top: NodeId) -> Vec<String> {
        let mut out = Vec::new();
        write_records(tree, top, &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('['))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn files_come_before_subdirectories() {
        let mut tree = FileTree::new();
        let root = tree.root();
        let top = tree.insert_child(root, node("/data", EntryKind::Directory, 0)).unwrap();
        let sub = tree.add_entry(top, node("sub dir", EntryKind::Directory, 0)).unwrap().node;
        tree.add_entry(sub, node("inner", EntryKind::File, 5)).unwrap();
        tree.add_entry(top, node("a.txt", EntryKind::File, 10)).unwrap();
        tree.add_entry(top, node("ln", EntryKind::Symlink, 3)).unwrap();
        for id in [top, sub] {
            tree.set_read_state(id, ReadState::Finished);
        }

        assert_eq!(
            written(&tree, top),
            vec![
                "D /data 0 0x100",
                "F a.txt 10 0x100",
                "L ln 3 0x100",
                "D sub%20dir 0 0x100",
                "F inner 5 0x100",
                "<",
                "<",
            ]
        );
    }

    #[test]
    fn flags_and_optional_fields_are_written() {
        let mut tree = FileTree::new();
        let root = tree.root();
        let top = tree.insert_child(root, node("/t", EntryKind::Directory, 0)).unwrap();
        let mut big = node("big", EntryKind::File, 10);
        big.allocated = 4096;
        big.links = 3;
        big.excluded = true;
        tree.add_entry(top, big).unwrap();
        let broken = tree.add_entry(top, node("locked", EntryKind::Directory, 0)).unwrap().node;
        tree.mark_read_error(broken);

        let lines = written(&tree, top);
        assert_eq!(lines[0], "D /t 0 0x100 aborted");
        assert_eq!(lines[1], "F big 10 0x100 alloc:4096 links:3 excl");
        assert_eq!(lines[2], "D locked 0 0x100 err");

        let Ok(Some(Record::Entry(rec))) = parse_line(&lines[1]) else {
            panic!("unparsable line {:?}", lines[1]);
        };
        assert_eq!(rec.kind, RecordKind::File);
        assert_eq!(rec.allocated, Some(4096));
        assert!(rec.flags.excluded);
    }

    #[test]
    fn files_cannot_be_cached_alone() {
        let mut tree = FileTree::new();
        let root = tree.root();
        let top = tree.insert_child(root, node("/f", EntryKind::File, 1)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = write_cache(&tree, top, &dir.path().join("c.cache"));
        assert!(matches!(result, Err(CacheError::NotADirectory { .. })));
    }
}
