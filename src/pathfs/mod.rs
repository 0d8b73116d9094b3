//! Translation between kernel node identifiers and backing filesystem paths.
//!
//! [`PathNodeFs`] keeps a tree of every object the kernel knows about. Each
//! operation resolves the node it targets into a path under the tree's read
//! lock, calls the [`PathFilesystem`] with no lock held, and only when that
//! call succeeds updates the tree under the write lock.

mod alias;
mod file_handle;
mod notify;
mod ops;
mod path_resolver;
mod tree;
mod types;

pub use file_handle::O_ANYWRITE;
pub use notify::Notifier;
pub use path_resolver::ResolvedPath;
pub use types::{Entry, LinkCountPolicy, NodeId, PathNodeFsOptions, ROOT_ID};

use file_handle::HandleTable;
use path_resolver::{resolve, resolve_or_enoent, resolve_path, Target};
use tree::Tree;

use fuser::{FileAttr, FileType};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Instant;

use crate::backing::{Context, PathFilesystem};
use crate::latency::LatencySink;
use crate::status::{Errno, Status};

/// The path bridge for one mount session.
pub struct PathNodeFs {
    tree: RwLock<Tree>,
    handles: HandleTable,
    options: PathNodeFsOptions,
    notifier: RwLock<Option<Arc<dyn Notifier>>>,
    latency: RwLock<Option<Arc<dyn LatencySink>>>,
}

impl PathNodeFs {
    pub fn new(backing: Arc<dyn PathFilesystem>, options: PathNodeFsOptions) -> Self {
        tracing::debug!(
            "Creating path bridge over {} (client_inodes={}, policy={})",
            backing.name(),
            options.client_inodes,
            options.link_count_policy
        );
        backing.on_mount();
        PathNodeFs {
            tree: RwLock::new(Tree::new(backing, options)),
            handles: HandleTable::new(),
            options,
            notifier: RwLock::new(None),
            latency: RwLock::new(None),
        }
    }

    pub fn root(&self) -> NodeId {
        ROOT_ID
    }

    pub fn options(&self) -> PathNodeFsOptions {
        self.options
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.notifier.write() = Some(notifier);
    }

    /// Install a sink that receives the duration of every backing call.
    pub fn set_latency_sink(&self, sink: Option<Arc<dyn LatencySink>>) {
        *self.latency.write() = sink;
    }

    /// Current backing path of `node`, relative to the root of the mount that
    /// owns it.
    pub fn path(&self, node: NodeId) -> ResolvedPath {
        let resolved = resolve_path(&self.tree.read().nodes, node);
        if self.options.debug {
            tracing::debug!("Resolved node {} to {:?}", node, resolved);
        }
        resolved
    }

    /// The node at `path`, using only what the tree already knows.
    pub fn node(&self, path: &Path) -> Option<NodeId> {
        let (node, rest) = self.last_node(path);
        rest.is_empty().then_some(node)
    }

    /// The deepest known node on `path`, and the components below it that the
    /// tree does not know.
    pub fn last_node(&self, path: &Path) -> (NodeId, Vec<OsString>) {
        let components = split_path(path);
        let tree = self.tree.read();
        let mut cur = ROOT_ID;
        for (i, component) in components.iter().enumerate() {
            match tree.nodes.child(cur, component) {
                Some(next) => cur = next,
                None => return (cur, components[i..].to_vec()),
            }
        }
        (cur, Vec::new())
    }

    /// Like [`PathNodeFs::node`], but looks up unknown components on the
    /// backing filesystem. Nodes found this way carry no kernel reference.
    pub fn lookup_node(&self, path: &Path, ctx: &Context) -> Status<NodeId> {
        let (mut cur, rest) = self.last_node(path);
        for component in rest {
            cur = self.lookup_inner(cur, &component, ctx, false)?.node;
        }
        Ok(cur)
    }

    /// Drop cached file data and attributes of `node` in the kernel.
    pub fn invalidate_content(&self, node: NodeId, offset: i64, len: i64) -> Status {
        let notifier = self.notifier.read().clone().ok_or(Errno::ENOSYS)?;
        notifier.invalidate_content(node, offset, len)
    }

    /// Drop the kernel's cached lookup of `dir/name`.
    pub fn invalidate_entry(&self, dir: NodeId, name: &OsStr) -> Status {
        let notifier = self.notifier.read().clone().ok_or(Errno::ENOSYS)?;
        notifier.invalidate_entry(dir, name)
    }

    /// Tell the kernel that `path` changed behind its back.
    ///
    /// If the path is fully known its content is invalidated, otherwise the
    /// entry for the first unknown component is.
    pub fn notify(&self, path: &Path) -> Status {
        let (node, rest) = self.last_node(path);
        match rest.first() {
            Some(name) => self.invalidate_entry(node, name),
            None => self.invalidate_content(node, 0, 0),
        }
    }

    pub fn file_notify(&self, path: &Path, offset: i64, len: i64) -> Status {
        let node = self.node(path).ok_or(Errno::ENOENT)?;
        self.invalidate_content(node, offset, len)
    }

    pub fn entry_notify(&self, dir: &Path, name: &OsStr) -> Status {
        let node = self.node(dir).ok_or(Errno::ENOENT)?;
        self.invalidate_entry(node, name)
    }

    /// Strip every node of its backing identifier and clear the alias index.
    pub fn forget_client_inodes(&self) {
        if !self.options.client_inodes {
            return;
        }
        self.tree.write().forget_client_inodes();
    }

    /// Forget all identifiers, then re-read them for every known node.
    pub fn reread_client_inodes(&self) {
        if !self.options.client_inodes {
            return;
        }
        self.forget_client_inodes();
        let ctx = Context::default();

        if let Ok(attr) = self.get_attr(ROOT_ID, None, &ctx) {
            tracing::trace!("Root identifier is now {}", attr.ino);
        }

        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut pending = vec![ROOT_ID];
        while let Some(dir) = pending.pop() {
            if !visited.insert(dir) {
                continue;
            }
            let edges: Vec<(OsString, NodeId)> = {
                let tree = self.tree.read();
                match tree.nodes.get(dir) {
                    Some(n) => n.children.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                    None => continue,
                }
            };
            for (name, child) in edges {
                let Ok(target) = self.edge_target(dir, &name, child) else {
                    continue;
                };
                match self.timed("GetAttr", &target.path, || {
                    target.backing.get_attr(&target.path, &ctx)
                }) {
                    Ok(attr) => {
                        let mut tree = self.tree.write();
                        if !tree.nodes.is_mount_root(child) {
                            tree.set_client_inode(child, attr.ino);
                            tree.register_edge(dir, &name, child);
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Could not refresh {:?}: {}", target.path, e);
                    }
                }
                pending.push(child);
            }
        }
    }

    /// Attach `backing` as a separate filesystem at `path`.
    pub fn mount(
        &self,
        path: &Path,
        backing: Arc<dyn PathFilesystem>,
        ctx: &Context,
    ) -> Status<NodeId> {
        let mut components = split_path(path);
        let name = components.pop().ok_or(Errno::EBUSY)?;
        let parent_path: std::path::PathBuf = components.iter().collect();
        let parent = self.lookup_node(&parent_path, ctx)?;

        let node = {
            let mut tree = self.tree.write();
            let is_dir = tree.nodes.get(parent).ok_or(Errno::ENOENT)?.is_dir;
            if !is_dir {
                return Err(Errno::ENOTDIR);
            }
            if let Some(existing) = tree.nodes.child(parent, &name) {
                if tree.nodes.is_mount_root(existing) {
                    return Err(Errno::EBUSY);
                }
            }
            let node = tree.nodes.alloc_mount(Arc::clone(&backing));
            tree.add_child(parent, &name, node);
            node
        };

        tracing::info!("Mounted {} at {:?} as node {}", backing.name(), path, node);
        backing.on_mount();
        let _ = self.invalidate_entry(parent, &name);
        Ok(node)
    }

    /// Detach the filesystem mounted at `path`.
    pub fn unmount(&self, path: &Path) -> Status {
        let node = self.node(path).ok_or(Errno::ENOENT)?;

        let (backing, position) = {
            let mut tree = self.tree.write();
            if node == ROOT_ID || !tree.nodes.is_mount_root(node) {
                return Err(Errno::EINVAL);
            }
            let busy = self
                .handles
                .open_nodes()
                .into_iter()
                .any(|n| tree.nodes.get(n).is_some_and(|t| t.mount == node));
            if busy {
                return Err(Errno::EBUSY);
            }
            let backing = tree
                .nodes
                .get(node)
                .map(|n| Arc::clone(&n.backing))
                .ok_or(Errno::ENOENT)?;
            (backing, tree.detach_mount(node))
        };

        tracing::info!("Unmounted {} from {:?}", backing.name(), path);
        backing.on_unmount();
        if let Some((parent, name)) = position {
            let _ = self.invalidate_entry(parent, &name);
        }
        Ok(())
    }

    /// Canonical parent of `node`; `None` for the root and deleted nodes.
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.tree.read().nodes.get(node).and_then(|n| n.parent)
    }

    /// The backing identifier currently bound to `node`; 0 when untracked.
    pub fn client_inode(&self, node: NodeId) -> Option<u64> {
        self.tree.read().nodes.get(node).map(|n| n.client_inode)
    }

    /// Every (parent, name) position under which `node` is reachable.
    pub fn aliases_of(&self, node: NodeId) -> Vec<(NodeId, OsString)> {
        self.tree.read().aliases_of(node)
    }

    pub fn is_deleted(&self, node: NodeId) -> bool {
        self.path(node).is_deleted()
    }

    pub fn lookup_count(&self, node: NodeId) -> Option<u64> {
        self.tree.read().nodes.get(node).map(|n| n.lookups)
    }

    /// Number of identifiers in the alias index.
    pub fn alias_count(&self) -> usize {
        self.tree.read().aliases.len()
    }

    /// Number of nodes currently allocated, the root included.
    pub fn node_count(&self) -> usize {
        self.tree.read().nodes.len()
    }

    /// Check the tree and alias index for structural consistency.
    pub fn verify(&self) -> Result<(), String> {
        self.tree.read().verify()
    }

    fn target(&self, node: NodeId) -> Status<Target> {
        let target = resolve_or_enoent(&self.tree.read().nodes, node)?;
        if self.options.debug {
            tracing::debug!("Resolved node {} to {:?}", node, target.path);
        }
        Ok(target)
    }

    /// Target for the not-yet-existing `parent/name`.
    fn child_target(&self, parent: NodeId, name: &OsStr) -> Status<Target> {
        let tree = self.tree.read();
        if let Some(existing) = tree.nodes.child(parent, name) {
            if tree.nodes.is_mount_root(existing) {
                return Err(Errno::EBUSY);
            }
        }
        Ok(resolve_or_enoent(&tree.nodes, parent)?.join(name))
    }

    /// Target for the known edge `parent/name -> child`. A mount root is
    /// addressed through its own filesystem.
    fn edge_target(&self, parent: NodeId, name: &OsStr, child: NodeId) -> Status<Target> {
        let tree = self.tree.read();
        if tree.nodes.is_mount_root(child) {
            return resolve(&tree.nodes, child).ok_or(Errno::ENOENT);
        }
        Ok(resolve_or_enoent(&tree.nodes, parent)?.join(name))
    }

    /// Run a backing call, reporting its duration to the latency sink.
    fn timed<T>(&self, op: &str, arg: &Path, f: impl FnOnce() -> Status<T>) -> Status<T> {
        let sink = self.latency.read().clone();
        match sink {
            None => f(),
            Some(sink) => {
                let start = Instant::now();
                let result = f();
                sink.record(op, &arg.to_string_lossy(), start.elapsed());
                result
            }
        }
    }

    /// Like `timed`, for a call made through an open handle on `node`. The
    /// node's current path stands in as the argument.
    fn timed_file<T>(&self, op: &str, node: NodeId, f: impl FnOnce() -> Status<T>) -> Status<T> {
        if self.latency.read().is_none() {
            return f();
        }
        let path = self.path(node).into_option().unwrap_or_default();
        self.timed(op, &path, f)
    }

    /// Free `node` once nothing refers to it any more, then reconsider its
    /// parent. Must be called with the tree write lock held.
    fn consider_drop(&self, tree: &mut Tree, node: NodeId) {
        let mut cur = node;
        loop {
            let Some(n) = tree.nodes.get(cur) else {
                return;
            };
            if cur == ROOT_ID
                || n.mount == cur
                || n.lookups > 0
                || !n.children.is_empty()
                || self.handles.has_open(cur)
            {
                return;
            }
            let parent = n.parent;
            tree.release(cur);
            match parent {
                Some(p) => cur = p,
                None => return,
            }
        }
    }
}

/// Backing filesystems report a link count of 0 for some files; the kernel
/// treats such a file as deleted.
pub(crate) fn fix_nlink(mut attr: FileAttr) -> FileAttr {
    if attr.nlink == 0 && attr.kind != FileType::Directory {
        attr.nlink = 1;
    }
    attr
}

fn split_path(path: &Path) -> Vec<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_os_string()),
            _ => None,
        })
        .collect()
}
