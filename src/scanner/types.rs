use std::fs::Metadata;

/// What kind of filesystem object a stat call found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// FIFOs, sockets, block and character devices
    Special,
}

/// The subset of `stat()` the tree needs for one filesystem object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub kind: EntryKind,
    /// Size in bytes
    pub size: u64,
    /// Bytes actually allocated on disk (block rounding, sparse files)
    pub allocated: u64,
    /// Modification time, seconds since the Unix epoch
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    /// Hard link count
    pub links: u64,
    /// Device the object lives on; used to detect mount points
    pub device: u64,
    pub inode: u64,
}

impl FileStat {
    /// A stat result with only the kind and size filled in.
    pub fn new(kind: EntryKind, size: u64) -> Self {
        Self {
            kind,
            size,
            allocated: size,
            mtime: 0,
            uid: 0,
            gid: 0,
            links: 1,
            device: 0,
            inode: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    #[cfg(unix)]
    pub fn from_metadata(md: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            kind: entry_kind(md),
            size: md.len(),
            // st_blocks is always in 512-byte units regardless of the fs block size
            allocated: md.blocks().saturating_mul(512),
            mtime: md.mtime(),
            uid: md.uid(),
            gid: md.gid(),
            links: md.nlink(),
            device: md.dev(),
            inode: md.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(md: &Metadata) -> Self {
        use std::time::UNIX_EPOCH;

        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Self {
            kind: entry_kind(md),
            size: md.len(),
            allocated: md.len(),
            mtime,
            uid: 0,
            gid: 0,
            links: 1,
            device: 0,
            inode: 0,
        }
    }
}

fn entry_kind(md: &Metadata) -> EntryKind {
    let ft = md.file_type();
    if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_dir() {
        EntryKind::Directory
    } else if ft.is_file() {
        EntryKind::File
    } else {
        EntryKind::Special
    }
}
