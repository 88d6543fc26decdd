use std::cell::Cell;
use std::ffi::OsStr;
use std::path::PathBuf;

use compact_str::CompactString;

use crate::scanner::types::{EntryKind, FileStat};

/// Display name of the synthetic node that groups a directory's plain files.
pub const DOT_ENTRY_NAME: &str = "<Files>";

/// Index into the arena. Uses u32 to save memory (supports up to ~4 billion nodes).
///
/// Handles stay valid until the node is deleted; a deleted node's slot may be
/// reused, so observers must drop handles when they see `DeletingChild`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a directory is in its reading lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting in the job queue
    Queued,
    Reading,
    Finished,
    /// Deliberately not read, e.g. a mount point when not crossing filesystems
    OnRequestOnly,
    Aborted,
    /// The directory could not be listed
    Error,
}

/// Aggregated statistics of a directory subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    /// Own size plus the sizes of all descendants, in bytes
    pub size: u64,
    pub allocated: u64,
    /// Files and directories below this one (dot entries are not counted)
    pub items: u64,
    /// Non-directory descendants
    pub files: u64,
    pub sub_dirs: u64,
    /// Descendant directories that could not be read
    pub error_dirs: u64,
}

impl Totals {
    fn add(&mut self, other: &Totals) {
        self.size += other.size;
        self.allocated += other.allocated;
        self.items += other.items;
        self.files += other.files;
        self.sub_dirs += other.sub_dirs;
        self.error_dirs += other.error_dirs;
    }

    fn subtract(&mut self, other: &Totals) {
        self.size = self.size.saturating_sub(other.size);
        self.allocated = self.allocated.saturating_sub(other.allocated);
        self.items = self.items.saturating_sub(other.items);
        self.files = self.files.saturating_sub(other.files);
        self.sub_dirs = self.sub_dirs.saturating_sub(other.sub_dirs);
        self.error_dirs = self.error_dirs.saturating_sub(other.error_dirs);
    }
}

/// Child list and aggregation state of a directory or dot entry.
///
/// Totals are cached and recomputed lazily: any structural change marks the
/// whole ancestor chain dirty, and the next read of a dirty node resolves it.
/// A dirty node always has dirty ancestors.
#[derive(Debug)]
pub struct DirInfo {
    first_child: Option<NodeId>,
    last_child: Option<NodeId>,
    dot_entry: Option<NodeId>,
    pub state: ReadState,
    /// Lives on another device than its parent
    pub mount_point: bool,
    totals: Cell<Totals>,
    dirty: Cell<bool>,
}

impl DirInfo {
    pub fn new(state: ReadState) -> Self {
        Self {
            first_child: None,
            last_child: None,
            dot_entry: None,
            state,
            mount_point: false,
            totals: Cell::new(Totals::default()),
            dirty: Cell::new(true),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }
}

#[derive(Debug)]
pub enum NodeKind {
    File,
    Symlink,
    Special,
    Directory(DirInfo),
    /// Synthetic child holding the plain files of its parent directory
    DotEntry(DirInfo),
}

/// A single node in the file tree, stored in a flat arena.
/// Uses sibling-list representation: each directory has a `first_child` and
/// each node a `next_sibling`.
#[derive(Debug)]
pub struct FileNode {
    /// File or directory name (the absolute path for a toplevel node),
    /// lossily converted to UTF-8 for display
    pub name: CompactString,
    /// The exact name when it is not valid UTF-8
    raw_name: Option<Box<OsStr>>,
    pub kind: NodeKind,
    /// Own size in bytes
    pub size: u64,
    pub allocated: u64,
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub links: u64,
    pub device: u64,
    pub inode: u64,
    /// Excluded nodes stay in the tree but add nothing to their ancestors' totals
    pub excluded: bool,
    /// stat() or listing failed for this node
    pub read_error: bool,
    parent: Option<NodeId>,
    next_sibling: Option<NodeId>,
}

impl FileNode {
    pub fn from_stat(name: impl Into<CompactString>, stat: &FileStat) -> Self {
        let kind = match stat.kind {
            EntryKind::File => NodeKind::File,
            EntryKind::Symlink => NodeKind::Symlink,
            EntryKind::Special => NodeKind::Special,
            EntryKind::Directory => NodeKind::Directory(DirInfo::new(ReadState::Queued)),
        };
        Self {
            name: name.into(),
            raw_name: None,
            kind,
            size: stat.size,
            allocated: stat.allocated,
            mtime: stat.mtime,
            uid: stat.uid,
            gid: stat.gid,
            links: stat.links,
            device: stat.device,
            inode: stat.inode,
            excluded: false,
            read_error: false,
            parent: None,
            next_sibling: None,
        }
    }

    /// A node named exactly as the filesystem returned `name`.
    pub fn from_os_stat(name: &OsStr, stat: &FileStat) -> Self {
        Self::from_stat(CompactString::default(), stat).with_os_name(name)
    }

    /// Placeholder for a directory entry that could not be stat()ed.
    pub fn unreadable(name: &OsStr) -> Self {
        let mut node = Self::from_os_stat(name, &FileStat::new(EntryKind::File, 0));
        node.read_error = true;
        node
    }

    pub fn with_os_name(mut self, name: &OsStr) -> Self {
        match name.to_str() {
            Some(utf8) => {
                self.name = CompactString::new(utf8);
                self.raw_name = None;
            }
            None => {
                self.name = CompactString::new(name.to_string_lossy());
                self.raw_name = Some(name.into());
            }
        }
        self
    }

    /// The name as the filesystem knows it. Paths are built from this.
    pub fn os_name(&self) -> &OsStr {
        self.raw_name
            .as_deref()
            .unwrap_or_else(|| OsStr::new(self.name.as_str()))
    }

    pub fn dot_entry() -> Self {
        let mut node = Self::from_stat(DOT_ENTRY_NAME, &FileStat::new(EntryKind::Directory, 0));
        node.kind = NodeKind::DotEntry(DirInfo::new(ReadState::Reading));
        node
    }

    pub fn dir_info(&self) -> Option<&DirInfo> {
        match &self.kind {
            NodeKind::Directory(info) | NodeKind::DotEntry(info) => Some(info),
            _ => None,
        }
    }

    fn dir_info_mut(&mut self) -> Option<&mut DirInfo> {
        match &mut self.kind {
            NodeKind::Directory(info) | NodeKind::DotEntry(info) => Some(info),
            _ => None,
        }
    }

    /// A real directory (not a dot entry).
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn is_dot_entry(&self) -> bool {
        matches!(self.kind, NodeKind::DotEntry(_))
    }

    pub fn read_state(&self) -> Option<ReadState> {
        self.dir_info().map(|info| info.state)
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn next_sibling(&self) -> Option<NodeId> {
        self.next_sibling
    }
}

/// Result of [`FileTree::add_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Added {
    pub node: NodeId,
    /// Dot entry created to hold the node, if one had to be created
    pub new_dot_entry: Option<NodeId>,
}

/// The file tree stored as a flat arena of nodes.
///
/// Slot 0 is an unnamed pseudo-root that never goes away; scanned trees hang
/// below it as toplevel nodes.
pub struct FileTree {
    slots: Vec<Option<FileNode>>,
    free: Vec<u32>,
    live: usize,
    root: NodeId,
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTree {
    /// Create a tree holding only the pseudo-root.
    pub fn new() -> Self {
        let mut root = FileNode::from_stat("", &FileStat::new(EntryKind::Directory, 0));
        root.kind = NodeKind::Directory(DirInfo::new(ReadState::Finished));

        FileTree {
            slots: vec![Some(root)],
            free: Vec::new(),
            live: 1,
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of live nodes, pseudo-root included.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the tree is empty (only the pseudo-root).
    pub fn is_empty(&self) -> bool {
        self.live <= 1
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.slots.get(id.index()), Some(Some(_)))
    }

    pub fn try_get(&self, id: NodeId) -> Option<&FileNode> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Get a node by ID.
    ///
    /// # Panics
    ///
    /// If `id` is stale, i.e. its node was deleted. Use [`FileTree::try_get`]
    /// for handles that may have outlived a `DeletingChild` notification.
    pub fn get(&self, id: NodeId) -> &FileNode {
        match self.try_get(id) {
            Some(node) => node,
            None => panic!("stale node handle {:?}", id),
        }
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut FileNode {
        match self.slots.get_mut(id.index()).and_then(Option::as_mut) {
            Some(node) => node,
            None => panic!("stale node handle {:?}", id),
        }
    }

    fn dir(&self, id: NodeId) -> Option<&DirInfo> {
        self.get(id).dir_info()
    }

    fn dir_mut(&mut self, id: NodeId) -> Option<&mut DirInfo> {
        self.get_mut(id).dir_info_mut()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).parent
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.dir(id).and_then(|info| info.first_child)
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).next_sibling
    }

    pub fn dot_entry(&self, id: NodeId) -> Option<NodeId> {
        self.dir(id).and_then(|info| info.dot_entry)
    }

    /// Iterate over the direct children of a node (not its dot entry).
    pub fn children(&self, parent: NodeId) -> ChildIter<'_> {
        ChildIter {
            tree: self,
            current: self.first_child(parent),
        }
    }

    /// The dot entry (if any) followed by the direct children.
    pub fn entries(&self, parent: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.dot_entry(parent).into_iter().chain(self.children(parent))
    }

    pub fn has_children(&self, id: NodeId) -> bool {
        self.first_child(id).is_some() || self.dot_entry(id).is_some()
    }

    /// All live node handles in arena order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| NodeId(i as u32))
    }

    pub fn read_state(&self, id: NodeId) -> Option<ReadState> {
        self.get(id).read_state()
    }

    pub(crate) fn set_read_state(&mut self, id: NodeId, state: ReadState) {
        if let Some(info) = self.dir_mut(id) {
            info.state = state;
        }
    }

    /// Flag a node as unreadable; directories also enter `ReadState::Error`.
    pub(crate) fn mark_read_error(&mut self, id: NodeId) {
        let node = self.get_mut(id);
        node.read_error = true;
        let parent = node.parent;
        if let Some(info) = node.dir_info_mut() {
            info.state = ReadState::Error;
        }
        if let Some(parent) = parent {
            self.mark_dirty(parent);
        }
    }

    fn alloc(&mut self, node: FileNode) -> NodeId {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(node);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(node));
                NodeId((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Append `node` to `parent`'s children (or install it as the dot entry).
    /// Marks the ancestor chain dirty. Returns `None` if `parent` cannot hold children.
    pub fn insert_child(&mut self, parent: NodeId, mut node: FileNode) -> Option<NodeId> {
        let is_dot = node.is_dot_entry();
        match self.dir(parent) {
            None => {
                tracing::error!("Cannot insert '{}' below non-directory {:?}", node.name, parent);
                return None;
            }
            Some(info) if is_dot && info.dot_entry.is_some() => {
                tracing::error!("{:?} already has a dot entry", parent);
                return None;
            }
            Some(_) => {}
        }

        node.parent = Some(parent);
        node.next_sibling = None;
        let id = self.alloc(node);

        if is_dot {
            if let Some(info) = self.dir_mut(parent) {
                info.dot_entry = Some(id);
            }
        } else {
            let last = self.dir(parent).and_then(|info| info.last_child);
            match last {
                Some(last) => self.get_mut(last).next_sibling = Some(id),
                None => {
                    if let Some(info) = self.dir_mut(parent) {
                        info.first_child = Some(id);
                    }
                }
            }
            if let Some(info) = self.dir_mut(parent) {
                info.last_child = Some(id);
            }
        }

        self.mark_dirty(parent);
        Some(id)
    }

    /// Add a freshly read entry to directory `dir`. Non-directories of a real
    /// directory go into its dot entry, which is created on first use.
    pub fn add_entry(&mut self, dir: NodeId, node: FileNode) -> Option<Added> {
        let wants_dot = dir != self.root && self.get(dir).is_dir() && node.dir_info().is_none();
        if !wants_dot {
            let id = self.insert_child(dir, node)?;
            return Some(Added { node: id, new_dot_entry: None });
        }

        let (dot, new_dot_entry) = match self.dot_entry(dir) {
            Some(dot) => (dot, None),
            None => {
                let dot = self.insert_child(dir, FileNode::dot_entry())?;
                (dot, Some(dot))
            }
        };
        let id = self.insert_child(dot, node)?;
        Some(Added { node: id, new_dot_entry })
    }

    /// Unlink `child` from its parent, keeping the parent's cached totals
    /// accurate by subtracting the child's contribution. The child's own
    /// storage is untouched; see [`FileTree::remove_subtree`].
    pub fn detach(&mut self, child: NodeId) {
        let Some(parent) = self.parent(child) else {
            tracing::error!("Cannot detach {:?}: it has no parent", child);
            return;
        };
        let contribution = self.contribution(child);
        let next = self.get(child).next_sibling;

        if self.dot_entry(parent) == Some(child) {
            if let Some(info) = self.dir_mut(parent) {
                info.dot_entry = None;
            }
        } else {
            let mut prev = None;
            let mut current = self.first_child(parent);
            while let Some(id) = current {
                if id == child {
                    break;
                }
                prev = Some(id);
                current = self.get(id).next_sibling;
            }
            if current.is_none() {
                tracing::error!("{:?} is not in the child list of its parent {:?}", child, parent);
                return;
            }
            match prev {
                Some(prev) => self.get_mut(prev).next_sibling = next,
                None => {
                    if let Some(info) = self.dir_mut(parent) {
                        info.first_child = next;
                    }
                }
            }
            if let Some(info) = self.dir_mut(parent) {
                if info.last_child == Some(child) {
                    info.last_child = prev;
                }
            }
        }

        let node = self.get_mut(child);
        node.parent = None;
        node.next_sibling = None;

        // Dirty ancestors are recomputed on their next read anyway, and a
        // dirty node only has dirty ancestors, so stop at the first one.
        let mut current = Some(parent);
        while let Some(id) = current {
            let node = self.get(id);
            let Some(info) = node.dir_info() else { break };
            if info.dirty.get() {
                break;
            }
            let mut totals = info.totals.get();
            totals.subtract(&contribution);
            info.totals.set(totals);
            if node.excluded {
                break;
            }
            current = node.parent;
        }
    }

    /// Free the storage of `id` and all its descendants. `id` must already be detached.
    fn release(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            stack.extend(self.entries(current));
            self.slots[current.index()] = None;
            self.free.push(current.0);
            self.live -= 1;
        }
    }

    /// Detach and destroy a whole subtree.
    pub fn remove_subtree(&mut self, id: NodeId) {
        if id == self.root {
            tracing::error!("Refusing to remove the pseudo-root");
            return;
        }
        if self.parent(id).is_none() {
            tracing::error!("Cannot remove {:?}: it is not attached", id);
            return;
        }
        self.detach(id);
        self.release(id);
    }

    /// Remove every child (and the dot entry) of `dir`, keeping `dir` itself.
    pub fn clear_children(&mut self, dir: NodeId) {
        let entries: Vec<NodeId> = self.entries(dir).collect();
        for id in entries {
            self.remove_subtree(id);
        }
    }

    /// Move all children of `dir`'s dot entry directly below `dir`.
    /// Returns the now empty dot entry.
    pub fn adopt_dot_entry_children(&mut self, dir: NodeId) -> Option<NodeId> {
        let dot = self.dot_entry(dir)?;
        let moved: Vec<NodeId> = self.children(dot).collect();
        if let Some(info) = self.dir_mut(dot) {
            info.first_child = None;
            info.last_child = None;
            info.dirty.set(true);
        }

        for id in moved {
            let node = self.get_mut(id);
            node.parent = Some(dir);
            node.next_sibling = None;
            let last = self.dir(dir).and_then(|info| info.last_child);
            match last {
                Some(last) => self.get_mut(last).next_sibling = Some(id),
                None => {
                    if let Some(info) = self.dir_mut(dir) {
                        info.first_child = Some(id);
                    }
                }
            }
            if let Some(info) = self.dir_mut(dir) {
                info.last_child = Some(id);
            }
        }

        self.mark_dirty(dir);
        Some(dot)
    }

    /// Toggle whether a subtree counts towards its ancestors' totals.
    pub fn set_excluded(&mut self, id: NodeId, excluded: bool) {
        let node = self.get_mut(id);
        if node.excluded == excluded {
            return;
        }
        node.excluded = excluded;
        if let Some(parent) = node.parent {
            self.mark_dirty(parent);
        }
    }

    /// Mark `id` and its ancestors as needing recomputation.
    pub(crate) fn mark_dirty(&self, id: NodeId) {
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.get(id);
            if let Some(info) = node.dir_info() {
                if info.dirty.get() {
                    break;
                }
                info.dirty.set(true);
            }
            current = node.parent;
        }
    }

    /// What a node adds to its parent's totals.
    fn contribution(&self, id: NodeId) -> Totals {
        let node = self.get(id);
        if node.excluded {
            return Totals::default();
        }
        match &node.kind {
            NodeKind::File | NodeKind::Symlink | NodeKind::Special => Totals {
                size: node.size,
                allocated: node.allocated,
                items: 1,
                files: 1,
                ..Totals::default()
            },
            NodeKind::Directory(_) => {
                let totals = self.totals(id);
                Totals {
                    items: totals.items + 1,
                    sub_dirs: totals.sub_dirs + 1,
                    error_dirs: totals.error_dirs + u64::from(node.read_error),
                    ..totals
                }
            }
            NodeKind::DotEntry(_) => self.totals(id),
        }
    }

    /// Recompute the cached totals of every dirty directory in the subtree of `id`.
    fn resolve(&self, id: NodeId) {
        // Pre-order collection of dirty directories; clean ones have clean subtrees.
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            order.push(current);
            for child in self.entries(current) {
                if self.dir(child).is_some_and(DirInfo::is_dirty) {
                    stack.push(child);
                }
            }
        }

        // Reverse pre-order visits children before their parents
        for &dir in order.iter().rev() {
            let node = self.get(dir);
            let mut totals = Totals {
                size: node.size,
                allocated: node.allocated,
                ..Totals::default()
            };
            for child in self.entries(dir) {
                totals.add(&self.contribution(child));
            }
            if let Some(info) = node.dir_info() {
                info.totals.set(totals);
                info.dirty.set(false);
            }
        }
    }

    /// Aggregated totals of a node; for non-directories only the own size.
    ///
    /// # Panics
    ///
    /// If `id` is stale, like [`FileTree::get`].
    pub fn totals(&self, id: NodeId) -> Totals {
        let node = self.get(id);
        match node.dir_info() {
            Some(info) => {
                if info.dirty.get() {
                    self.resolve(id);
                }
                info.totals.get()
            }
            None => Totals {
                size: node.size,
                allocated: node.allocated,
                ..Totals::default()
            },
        }
    }

    pub fn total_size(&self, id: NodeId) -> u64 {
        self.totals(id).size
    }

    pub fn total_allocated_size(&self, id: NodeId) -> u64 {
        self.totals(id).allocated
    }

    pub fn total_items(&self, id: NodeId) -> u64 {
        self.totals(id).items
    }

    pub fn total_sub_dirs(&self, id: NodeId) -> u64 {
        self.totals(id).sub_dirs
    }

    /// Filesystem path of a node, built by walking up to the toplevel.
    /// Dot entries do not add a path component.
    pub fn node_path(&self, id: NodeId) -> PathBuf {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            if id == self.root {
                break;
            }
            let node = self.get(id);
            if !node.is_dot_entry() {
                parts.push(node.os_name());
            }
            current = node.parent;
        }

        let mut path = PathBuf::new();
        for part in parts.iter().rev() {
            path.push(part);
        }
        path
    }

    /// Whether `id` is `top` or lies below it.
    pub fn is_in_subtree(&self, id: NodeId, top: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(id) = current {
            if id == top {
                return true;
            }
            current = self.try_get(id).and_then(|node| node.parent);
        }
        false
    }
}

/// Iterator over the children of a node.
pub struct ChildIter<'a> {
    tree: &'a FileTree,
    current: Option<NodeId>,
}

impl<'a> Iterator for ChildIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.current?;
        self.current = self.tree.get(id).next_sibling;
        Some(id)
    }
}
