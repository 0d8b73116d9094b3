use fuser::{FileAttr, FUSE_ROOT_ID};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use crate::backing::PathFilesystem;

/// Kernel-visible identifier of a tree node. Doubles as the inode number
/// reported to the kernel.
pub type NodeId = u64;

/// The mount root. FUSE reserves inode 1 for it.
pub const ROOT_ID: NodeId = FUSE_ROOT_ID;

/// Name given to a node once it is no longer reachable from the root.
pub(crate) const DELETED_NAME: &str = ".deleted";

/// What to believe when the backing filesystem reports a link count of 1 for
/// an identifier that is already tracked under another name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LinkCountPolicy {
    /// Keep using the tracked alias; the stat is assumed to be racy.
    #[default]
    TrustTracked,
    /// Drop the tracked aliases and treat the object as singly linked.
    TrustBacking,
}

impl std::fmt::Display for LinkCountPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkCountPolicy::TrustTracked => write!(f, "trust-tracked"),
            LinkCountPolicy::TrustBacking => write!(f, "trust-backing"),
        }
    }
}

impl std::str::FromStr for LinkCountPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trust-tracked" => Ok(LinkCountPolicy::TrustTracked),
            "trust-backing" => Ok(LinkCountPolicy::TrustBacking),
            _ => Err(format!(
                "Invalid link_count_policy '{}'. Must be one of: trust-tracked, trust-backing",
                s
            )),
        }
    }
}

/// Behaviour switches for a [`super::PathNodeFs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathNodeFsOptions {
    /// Maintain the client inode alias index so hardlinks resolve to one node.
    pub client_inodes: bool,
    /// Log every path resolution.
    pub debug: bool,
    pub link_count_policy: LinkCountPolicy,
}

/// A node handed to the kernel together with its current attributes.
///
/// `attr.ino` is the backing filesystem's identifier; the transport replaces
/// it with `node` before replying.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub node: NodeId,
    pub attr: FileAttr,
}

#[derive(Clone)]
pub(crate) struct TreeNode {
    /// Last path segment. Meaningless for the root and for mount roots'
    /// own backing paths.
    pub name: OsString,
    /// Canonical parent. `None` for the root and for deleted nodes.
    pub parent: Option<NodeId>,
    /// Children by name. A hardlinked node may appear in several maps.
    pub children: HashMap<OsString, NodeId>,
    /// Backing filesystem identifier, 0 when untracked.
    pub client_inode: u64,
    pub is_dir: bool,
    /// Root of the mount this node belongs to; equal to its own id for mount roots.
    pub mount: NodeId,
    pub backing: Arc<dyn PathFilesystem>,
    /// Outstanding kernel references.
    pub lookups: u64,
}

impl TreeNode {
    pub fn new_root(backing: Arc<dyn PathFilesystem>, id: NodeId) -> Self {
        TreeNode {
            name: OsString::new(),
            parent: None,
            children: HashMap::new(),
            client_inode: 0,
            is_dir: true,
            mount: id,
            backing,
            lookups: 1,
        }
    }
}

impl std::fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeNode")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("children", &self.children.len())
            .field("client_inode", &self.client_inode)
            .field("is_dir", &self.is_dir)
            .field("mount", &self.mount)
            .field("backing", &self.backing.name())
            .field("lookups", &self.lookups)
            .finish()
    }
}

/// Arena owning every node of one mount session.
#[derive(Debug)]
pub(crate) struct NodeTable {
    nodes: FxHashMap<NodeId, TreeNode>,
    next_id: NodeId,
}

impl NodeTable {
    pub fn new(backing: Arc<dyn PathFilesystem>) -> Self {
        let mut nodes = FxHashMap::default();
        nodes.insert(ROOT_ID, TreeNode::new_root(backing, ROOT_ID));
        NodeTable {
            nodes,
            next_id: ROOT_ID + 1,
        }
    }

    /// Allocate a fresh, unlinked node that inherits `parent`'s mount.
    pub fn alloc_child(&mut self, parent: NodeId, is_dir: bool) -> Option<NodeId> {
        let (mount, backing) = {
            let p = self.nodes.get(&parent)?;
            (p.mount, Arc::clone(&p.backing))
        };
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.nodes.insert(
            id,
            TreeNode {
                name: OsString::new(),
                parent: None,
                children: HashMap::new(),
                client_inode: 0,
                is_dir,
                mount,
                backing,
                lookups: 0,
            },
        );
        Some(id)
    }

    /// Allocate a node that roots a separate backing filesystem.
    pub fn alloc_mount(&mut self, backing: Arc<dyn PathFilesystem>) -> NodeId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let mut node = TreeNode::new_root(backing, id);
        node.lookups = 0;
        self.nodes.insert(id, node);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        self.nodes.get_mut(&id)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<TreeNode> {
        if id == ROOT_ID {
            return None;
        }
        self.nodes.remove(&id)
    }

    pub fn child(&self, parent: NodeId, name: &OsStr) -> Option<NodeId> {
        self.nodes
            .get(&parent)
            .and_then(|p| p.children.get(name).copied())
    }

    pub fn is_mount_root(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|n| n.mount == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut TreeNode> {
        self.nodes.values_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
