use fxhash::FxHashMap;
use std::ffi::{OsStr, OsString};

use crate::pathfs::types::NodeId;

/// Identifies one backing object: its identifier is only unique within the
/// mount that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AliasKey {
    pub mount: NodeId,
    pub ino: u64,
}

/// A position under which a node is reachable: `parent.children[name] == node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AliasEntry {
    pub parent: NodeId,
    pub name: OsString,
    pub node: NodeId,
}

/// Maps backing identifiers to every tree position known to reach that
/// object. Entries are kept in registration order.
#[derive(Debug, Default)]
pub(crate) struct AliasIndex {
    map: FxHashMap<AliasKey, Vec<AliasEntry>>,
}

impl AliasIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a position. Registering the same position twice is a no-op.
    pub fn register(&mut self, key: AliasKey, entry: AliasEntry) {
        let entries = self.map.entry(key).or_default();
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    pub fn first(&self, key: AliasKey) -> Option<&AliasEntry> {
        self.map.get(&key).and_then(|v| v.first())
    }

    pub fn entries(&self, key: AliasKey) -> &[AliasEntry] {
        self.map.get(&key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Remove the position `(parent, name)`.
    ///
    /// Returns the first surviving entry, or `None` once no alias is left, in
    /// which case the key is dropped.
    pub fn remove(&mut self, key: AliasKey, parent: NodeId, name: &OsStr) -> Option<AliasEntry> {
        let entries = self.map.get_mut(&key)?;
        if let Some(idx) = entries
            .iter()
            .position(|e| e.parent == parent && e.name == name)
        {
            entries.remove(idx);
        }
        match entries.first() {
            Some(first) => Some(first.clone()),
            None => {
                self.map.remove(&key);
                None
            }
        }
    }

    pub fn drop_key(&mut self, key: AliasKey) -> Vec<AliasEntry> {
        self.map.remove(&key).unwrap_or_default()
    }

    /// Drop every entry belonging to `node` under `key`.
    pub fn drop_node(&mut self, key: AliasKey, node: NodeId) -> Vec<AliasEntry> {
        let Some(entries) = self.map.get_mut(&key) else {
            return Vec::new();
        };
        let (dropped, kept): (Vec<_>, Vec<_>) = entries.drain(..).partition(|e| e.node == node);
        if kept.is_empty() {
            self.map.remove(&key);
        } else {
            *entries = kept;
        }
        dropped
    }

    /// Drop every key reported by the given mount.
    pub fn drop_mount(&mut self, mount: NodeId) {
        self.map.retain(|k, _| k.mount != mount);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AliasKey, &Vec<AliasEntry>)> {
        self.map.iter()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
