use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backing::PathFilesystem;
use crate::pathfs::types::{NodeId, NodeTable, ROOT_ID};
use crate::status::{Errno, Status};

/// Outcome of translating a node into a backing path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    /// Path relative to the root of the mount that owns the node.
    Path(PathBuf),
    /// The node is no longer reachable from the root. Only handles that are
    /// already open can still reach the object.
    Deleted,
}

impl ResolvedPath {
    pub fn is_deleted(&self) -> bool {
        matches!(self, ResolvedPath::Deleted)
    }

    pub fn into_option(self) -> Option<PathBuf> {
        match self {
            ResolvedPath::Path(p) => Some(p),
            ResolvedPath::Deleted => None,
        }
    }
}

/// A resolved path together with the filesystem that should receive it.
#[derive(Clone)]
pub(crate) struct Target {
    pub path: PathBuf,
    pub mount: NodeId,
    pub backing: Arc<dyn PathFilesystem>,
}

impl Target {
    pub fn join(mut self, name: &std::ffi::OsStr) -> Self {
        self.path.push(name);
        self
    }
}

/// Walk parent links from `id` up to the true root.
///
/// Names are collected only up to the node's mount root, so the result is
/// relative to the backing filesystem that owns the node. The walk always
/// continues to the true root: a chain that ends anywhere else means the node
/// was deleted. The caller must hold the tree lock for the whole walk.
pub(crate) fn resolve(table: &NodeTable, id: NodeId) -> Option<Target> {
    let node = table.get(id)?;
    let mount = node.mount;
    let backing = Arc::clone(&node.backing);

    let mut rev_components: Vec<&OsString> = Vec::with_capacity(10);
    let mut collecting = true;
    let mut cur = id;
    loop {
        if cur == ROOT_ID {
            break;
        }
        let n = table.get(cur)?;
        if n.mount == cur {
            collecting = false;
        }
        let parent = n.parent?;
        if collecting {
            rev_components.push(&n.name);
        }
        cur = parent;
    }

    let mut path = PathBuf::new();
    for component in rev_components.into_iter().rev() {
        path.push(component);
    }

    Some(Target {
        path,
        mount,
        backing,
    })
}

pub(crate) fn resolve_path(table: &NodeTable, id: NodeId) -> ResolvedPath {
    match resolve(table, id) {
        Some(t) => ResolvedPath::Path(t.path),
        None => ResolvedPath::Deleted,
    }
}

pub(crate) fn resolve_or_enoent(table: &NodeTable, id: NodeId) -> Status<Target> {
    resolve(table, id).ok_or(Errno::ENOENT)
}
