use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::backing::BackingFile;
use crate::pathfs::types::NodeId;

/// Open flags that make a handle usable for attribute mutation.
pub const O_ANYWRITE: i32 =
    libc::O_WRONLY | libc::O_RDWR | libc::O_APPEND | libc::O_CREAT | libc::O_TRUNC;

#[derive(Clone)]
pub(crate) struct OpenFile {
    pub node: NodeId,
    pub flags: i32,
    pub file: Arc<dyn BackingFile>,
}

#[derive(Default)]
struct HandleMaps {
    files: FxHashMap<u64, OpenFile>,
    by_node: FxHashMap<NodeId, Vec<u64>>,
}

/// Kernel file handles and the backing files they stand for.
///
/// Kept apart from the tree lock: handle traffic never blocks path resolution.
pub(crate) struct HandleTable {
    maps: RwLock<HandleMaps>,
    next_fh: Mutex<u64>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            maps: RwLock::new(HandleMaps::default()),
            next_fh: Mutex::new(1),
        }
    }

    pub fn insert(&self, node: NodeId, flags: i32, file: Box<dyn BackingFile>) -> u64 {
        let fh = {
            let mut next = self.next_fh.lock();
            let fh = *next;
            *next += 1;
            fh
        };
        let mut maps = self.maps.write();
        maps.files.insert(
            fh,
            OpenFile {
                node,
                flags,
                file: Arc::from(file),
            },
        );
        maps.by_node.entry(node).or_default().push(fh);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<OpenFile> {
        self.maps.read().files.get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<OpenFile> {
        let mut maps = self.maps.write();
        let open = maps.files.remove(&fh)?;
        if let Some(list) = maps.by_node.get_mut(&open.node) {
            list.retain(|h| *h != fh);
            if list.is_empty() {
                maps.by_node.remove(&open.node);
            }
        }
        Some(open)
    }

    /// Open handles of `node` whose flags intersect `mask`. A zero mask
    /// matches every handle.
    pub fn for_node(&self, node: NodeId, mask: i32) -> Vec<(u64, OpenFile)> {
        let maps = self.maps.read();
        let Some(list) = maps.by_node.get(&node) else {
            return Vec::new();
        };
        list.iter()
            .filter_map(|fh| maps.files.get(fh).map(|f| (*fh, f.clone())))
            .filter(|(_, f)| mask == 0 || f.flags & mask != 0)
            .collect()
    }

    pub fn has_open(&self, node: NodeId) -> bool {
        self.maps.read().by_node.contains_key(&node)
    }

    pub fn open_nodes(&self) -> Vec<NodeId> {
        self.maps.read().by_node.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.maps.read().files.len()
    }
}
