use fuser::{FileAttr, FileType};
use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use crate::backing::PathFilesystem;
use crate::pathfs::alias::{AliasEntry, AliasIndex, AliasKey};
use crate::pathfs::types::{
    LinkCountPolicy, NodeId, NodeTable, PathNodeFsOptions, DELETED_NAME, ROOT_ID,
};

/// The node graph plus the alias index. Every method here assumes the caller
/// holds the mount's tree lock for writing; none of them performs I/O.
#[derive(Debug)]
pub(crate) struct Tree {
    pub nodes: NodeTable,
    pub aliases: AliasIndex,
    options: PathNodeFsOptions,
}

impl Tree {
    pub fn new(backing: Arc<dyn PathFilesystem>, options: PathNodeFsOptions) -> Self {
        Tree {
            nodes: NodeTable::new(backing),
            aliases: AliasIndex::new(),
            options,
        }
    }

    fn tracking(&self) -> bool {
        self.options.client_inodes
    }

    fn alias_key(&self, node: NodeId) -> Option<AliasKey> {
        let n = self.nodes.get(node)?;
        if n.client_inode == 0 || n.mount == node {
            return None;
        }
        Some(AliasKey {
            mount: n.mount,
            ino: n.client_inode,
        })
    }

    fn register_alias(&mut self, parent: NodeId, name: &OsStr, node: NodeId) {
        if !self.tracking() {
            return;
        }
        if let Some(key) = self.alias_key(node) {
            self.aliases.register(
                key,
                AliasEntry {
                    parent,
                    name: name.to_os_string(),
                    node,
                },
            );
        }
    }

    /// Insert `child` under `parent` and make that its canonical position.
    /// Any other node occupying the name is removed first.
    pub fn add_child(&mut self, parent: NodeId, name: &OsStr, child: NodeId) {
        self.insert_child(parent, name, child);
        if let Some(c) = self.nodes.get_mut(child) {
            c.parent = Some(parent);
            c.name = name.to_os_string();
        }
        self.register_alias(parent, name, child);
    }

    /// Make `child` reachable as `parent/name` as well, keeping its canonical
    /// position.
    pub fn attach_alias(&mut self, parent: NodeId, name: &OsStr, child: NodeId) {
        self.insert_child(parent, name, child);
        self.register_alias(parent, name, child);
    }

    fn insert_child(&mut self, parent: NodeId, name: &OsStr, child: NodeId) {
        match self.nodes.child(parent, name) {
            Some(existing) if existing == child => return,
            Some(_) => {
                self.rm_child(parent, name);
            }
            None => {}
        }
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.insert(name.to_os_string(), child);
        }
    }

    /// Remove `parent/name` from the tree.
    ///
    /// If the node survives under another alias it is relinked there (when the
    /// removed position was its canonical one); otherwise it is marked deleted.
    /// Returns the removed node.
    pub fn rm_child(&mut self, parent: NodeId, name: &OsStr) -> Option<NodeId> {
        let child = self.nodes.get_mut(parent)?.children.remove(name)?;

        if self.tracking() {
            if let Some(key) = self.alias_key(child) {
                self.aliases.remove(key, parent, name);
                let next = self
                    .aliases
                    .entries(key)
                    .iter()
                    .find(|e| e.node == child)
                    .cloned();
                if let Some(next) = next {
                    if let Some(c) = self.nodes.get_mut(child) {
                        if c.parent == Some(parent) && c.name == name {
                            c.parent = Some(next.parent);
                            c.name = next.name;
                        }
                    }
                    return Some(child);
                }
            }
        }

        let canonical = self
            .nodes
            .get(child)
            .is_some_and(|c| c.parent == Some(parent) && c.name == name);
        if !canonical {
            return Some(child);
        }
        // Positions can outlive the alias index (identifiers forgotten or
        // reset), so fall back to the children maps.
        let survivor = if self.tracking() {
            self.positions_of(child).into_iter().next()
        } else {
            None
        };
        if let Some(c) = self.nodes.get_mut(child) {
            match survivor {
                Some((p, n)) => {
                    c.parent = Some(p);
                    c.name = n;
                }
                None => {
                    c.parent = None;
                    c.name = OsString::from(DELETED_NAME);
                }
            }
        }
        Some(child)
    }

    /// Every children-map entry that points at `node`.
    fn positions_of(&self, node: NodeId) -> Vec<(NodeId, OsString)> {
        let mut found = Vec::new();
        for id in self.nodes.ids() {
            let Some(n) = self.nodes.get(id) else {
                continue;
            };
            for (name, child) in &n.children {
                if *child == node {
                    found.push((id, name.clone()));
                }
            }
        }
        found
    }

    /// Handle a changed backing identifier for an otherwise unchanged node.
    pub fn set_client_inode(&mut self, node: NodeId, ino: u64) {
        if !self.tracking() {
            return;
        }
        let Some(n) = self.nodes.get(node) else {
            return;
        };
        if n.client_inode == ino {
            return;
        }
        let learning = n.client_inode == 0;
        if let Some(old) = self.alias_key(node) {
            self.aliases.drop_node(old, node);
        }
        let position = {
            let Some(n) = self.nodes.get_mut(node) else {
                return;
            };
            n.client_inode = ino;
            n.parent.map(|p| (p, n.name.clone()))
        };
        if let Some((parent, name)) = &position {
            self.register_alias(*parent, name, node);
        }
        // A freshly learned identifier covers every name the node already
        // has; a changed one only the canonical name it was read through.
        if learning {
            for (parent, name) in self.positions_of(node) {
                if position.as_ref() != Some(&(parent, name.clone())) {
                    self.register_alias(parent, &name, node);
                }
            }
        }
    }

    /// Find the node for a freshly looked-up `parent/name`, creating it when
    /// the object is unknown.
    pub fn find_child(&mut self, parent: NodeId, name: &OsStr, attr: &FileAttr) -> Option<NodeId> {
        let is_dir = attr.kind == FileType::Directory;
        let mount = self.nodes.get(parent)?.mount;

        if self.tracking() && attr.ino != 0 {
            let key = AliasKey {
                mount,
                ino: attr.ino,
            };
            if let Some(first) = self.aliases.first(key).cloned() {
                let mut trusted = true;
                if attr.nlink == 1 && (first.parent != parent || first.name != name) {
                    tracing::warn!(
                        "Found linked inode {} for {:?}, but backing filesystem reports nlink == 1",
                        attr.ino,
                        name
                    );
                    if self.options.link_count_policy == LinkCountPolicy::TrustBacking {
                        self.forget_key(key);
                        trusted = false;
                    }
                }
                if trusted && self.nodes.get(first.node).is_some() {
                    self.attach_alias(parent, name, first.node);
                    return Some(first.node);
                }
            }
        }

        if let Some(existing) = self.nodes.child(parent, name) {
            let matches = self
                .nodes
                .get(existing)
                .is_some_and(|n| n.is_dir == is_dir && n.mount != existing);
            if matches {
                if let Some(n) = self.nodes.get_mut(existing) {
                    if n.parent.is_none() {
                        n.parent = Some(parent);
                        n.name = name.to_os_string();
                    }
                }
                self.set_client_inode(existing, attr.ino);
                self.register_edge(parent, name, existing);
                return Some(existing);
            }
        }

        let id = self.nodes.alloc_child(parent, is_dir)?;
        if self.tracking() {
            if let Some(n) = self.nodes.get_mut(id) {
                n.client_inode = attr.ino;
            }
        }
        self.add_child(parent, name, id);
        Some(id)
    }

    /// Strip the identifier from every node registered under `key`.
    fn forget_key(&mut self, key: AliasKey) {
        for e in self.aliases.drop_key(key) {
            if let Some(n) = self.nodes.get_mut(e.node) {
                n.client_inode = 0;
            }
        }
    }

    /// Drop all alias information. Identifiers are re-learned lazily.
    pub fn forget_client_inodes(&mut self) {
        self.aliases.clear();
        for n in self.nodes.values_mut() {
            n.client_inode = 0;
        }
    }

    /// Allocate a node for a successful create-style call and link it.
    pub fn create_child(&mut self, parent: NodeId, name: &OsStr, is_dir: bool) -> Option<NodeId> {
        let id = self.nodes.alloc_child(parent, is_dir)?;
        self.add_child(parent, name, id);
        Some(id)
    }

    /// Apply a successful backing rename to the tree.
    pub fn rename(
        &mut self,
        old_parent: NodeId,
        old_name: &OsStr,
        new_parent: NodeId,
        new_name: &OsStr,
    ) {
        let moving = self.nodes.child(old_parent, old_name);
        let occupant = self.nodes.child(new_parent, new_name);
        if moving.is_some() && moving == occupant {
            // Two names of one object: the backing rename is a no-op.
            return;
        }

        let ch = self.rm_child(old_parent, old_name);
        self.rm_child(new_parent, new_name);
        if let Some(ch) = ch {
            self.add_child(new_parent, new_name, ch);
        }
    }

    /// Remove `node` from every position that reaches it and free it.
    pub fn release(&mut self, node: NodeId) {
        if node == ROOT_ID {
            return;
        }
        let mut positions: Vec<(NodeId, OsString)> = Vec::new();
        match self.alias_key(node) {
            Some(key) => positions.extend(
                self.aliases
                    .drop_node(key, node)
                    .into_iter()
                    .map(|e| (e.parent, e.name)),
            ),
            None if self.tracking() => positions.extend(self.positions_of(node)),
            None => {}
        }
        if let Some(n) = self.nodes.get(node) {
            if let Some(p) = n.parent {
                positions.push((p, n.name.clone()));
            }
        }
        for (parent, name) in positions {
            if let Some(p) = self.nodes.get_mut(parent) {
                if p.children.get(&name) == Some(&node) {
                    p.children.remove(&name);
                }
            }
        }
        self.nodes.remove(node);
    }

    /// Record that `parent/name` reaches `node`, using the node's current
    /// identifier.
    pub fn register_edge(&mut self, parent: NodeId, name: &OsStr, node: NodeId) {
        if self.nodes.child(parent, name) == Some(node) {
            self.register_alias(parent, name, node);
        }
    }

    /// Unlink the mount rooted at `mount` and free every node that belongs to
    /// it. Returns the position the mount occupied.
    pub fn detach_mount(&mut self, mount: NodeId) -> Option<(NodeId, OsString)> {
        if mount == ROOT_ID || !self.nodes.is_mount_root(mount) {
            return None;
        }
        let position = {
            let n = self.nodes.get(mount)?;
            n.parent.map(|p| (p, n.name.clone()))
        };
        if let Some((parent, name)) = &position {
            if let Some(p) = self.nodes.get_mut(*parent) {
                p.children.remove(name);
            }
        }
        let owned: Vec<NodeId> = self
            .nodes
            .ids()
            .filter(|id| self.nodes.get(*id).is_some_and(|n| n.mount == mount))
            .collect();
        for id in owned {
            self.nodes.remove(id);
        }
        self.aliases.drop_mount(mount);
        position
    }

    /// Check the structural invariants. Returns a description of the first
    /// violation found.
    pub fn verify(&self) -> Result<(), String> {
        let mut edges: Vec<(NodeId, OsString, NodeId)> = Vec::new();
        for id in self.nodes.ids() {
            let Some(n) = self.nodes.get(id) else {
                continue;
            };
            for (name, child) in &n.children {
                let Some(c) = self.nodes.get(*child) else {
                    return Err(format!("{}/{:?} points at freed node {}", id, name, child));
                };
                if c.parent.is_none() {
                    return Err(format!(
                        "{}/{:?} reaches node {}, which is marked deleted",
                        id, name, child
                    ));
                }
                edges.push((id, name.clone(), *child));
            }
            if let Some(p) = n.parent {
                if self.nodes.child(p, &n.name) != Some(id) {
                    return Err(format!(
                        "node {} claims parent {} as {:?}, but the parent disagrees",
                        id, p, n.name
                    ));
                }
            }
        }

        if !self.tracking() {
            return Ok(());
        }
        for (parent, name, child) in &edges {
            let Some(key) = self.alias_key(*child) else {
                continue;
            };
            let registered = self
                .aliases
                .entries(key)
                .iter()
                .any(|e| e.parent == *parent && e.name == *name && e.node == *child);
            if !registered {
                return Err(format!(
                    "edge {}/{:?} -> {} missing from alias index",
                    parent, name, child
                ));
            }
        }
        for (key, entries) in self.aliases.iter() {
            for e in entries {
                if self.nodes.child(e.parent, &e.name) != Some(e.node) {
                    return Err(format!(
                        "alias {:?} of inode {} is stale",
                        (e.parent, &e.name),
                        key.ino
                    ));
                }
            }
        }
        Ok(())
    }

    /// Every (parent, name) position that currently resolves to `node`.
    pub fn aliases_of(&self, node: NodeId) -> Vec<(NodeId, OsString)> {
        if let Some(key) = self.alias_key(node) {
            let entries = self.aliases.entries(key);
            if !entries.is_empty() {
                return entries
                    .iter()
                    .filter(|e| e.node == node)
                    .map(|e| (e.parent, e.name.clone()))
                    .collect();
            }
        }
        self.nodes
            .get(node)
            .and_then(|n| n.parent.map(|p| (p, n.name.clone())))
            .into_iter()
            .collect()
    }
}
