use fuser::{FileAttr, FileType};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::file_handle::O_ANYWRITE;
use super::path_resolver::{resolve_or_enoent, Target};
use super::{fix_nlink, Entry, NodeId, PathNodeFs, ROOT_ID};
use crate::backing::{BackingFile, Context, DirEntry, StatFs};
use crate::status::{Errno, Status};

impl PathNodeFs {
    /// Find `name` in `parent` and hand the node to the kernel.
    pub fn lookup(&self, parent: NodeId, name: &OsStr, ctx: &Context) -> Status<Entry> {
        tracing::trace!("lookup(parent={}, name={:?})", parent, name);
        self.lookup_inner(parent, name, ctx, true)
    }

    pub(crate) fn lookup_inner(
        &self,
        parent: NodeId,
        name: &OsStr,
        ctx: &Context,
        count: bool,
    ) -> Status<Entry> {
        let (target, mounted) = {
            let tree = self.tree.read();
            let parent_target = resolve_or_enoent(&tree.nodes, parent)?;
            match tree.nodes.child(parent, name) {
                Some(child) if tree.nodes.is_mount_root(child) => {
                    let backing = tree
                        .nodes
                        .get(child)
                        .map(|n| Arc::clone(&n.backing))
                        .ok_or(Errno::ENOENT)?;
                    let target = Target {
                        path: PathBuf::new(),
                        mount: child,
                        backing,
                    };
                    (target, Some(child))
                }
                _ => (parent_target.join(name), None),
            }
        };

        let attr = self.timed("GetAttr", &target.path, || {
            target.backing.get_attr(&target.path, ctx)
        })?;
        let attr = fix_nlink(attr);

        let mut tree = self.tree.write();
        let node = match mounted {
            Some(m) => m,
            None => tree.find_child(parent, name, &attr).ok_or(Errno::ENOENT)?,
        };
        if count {
            if let Some(n) = tree.nodes.get_mut(node) {
                n.lookups += 1;
            }
        }
        Ok(Entry { node, attr })
    }

    /// Drop `n` kernel references to `node`.
    pub fn forget(&self, node: NodeId, n: u64) {
        let mut tree = self.tree.write();
        if let Some(t) = tree.nodes.get_mut(node) {
            t.lookups = t.lookups.saturating_sub(n);
        }
        self.consider_drop(&mut tree, node);
    }

    /// Current attributes of `node`.
    ///
    /// An open handle is asked first; the path is used when there is none or
    /// the handle cannot answer. Only attributes read through the path update
    /// the node's backing identifier.
    pub fn get_attr(&self, node: NodeId, fh: Option<u64>, ctx: &Context) -> Status<FileAttr> {
        let file = match fh.and_then(|fh| self.handles.get(fh)) {
            Some(open) if open.node == node => Some(open.file),
            _ => self
                .handles
                .for_node(node, 0)
                .into_iter()
                .next()
                .map(|(_, open)| open.file),
        };
        if let Some(file) = file {
            match self.timed_file("GetAttr", node, || file.get_attr()) {
                Ok(attr) => return Ok(fix_nlink(attr)),
                Err(e) if e.is_handle_fallback() => {}
                Err(e) => return Err(e),
            }
        }

        let target = self.target(node)?;
        let attr = self.timed("GetAttr", &target.path, || {
            target.backing.get_attr(&target.path, ctx)
        })?;
        if node != target.mount {
            self.tree.write().set_client_inode(node, attr.ino);
        }
        Ok(fix_nlink(attr))
    }

    pub fn chmod(&self, node: NodeId, fh: Option<u64>, mode: u32, ctx: &Context) -> Status {
        self.mutate_attr(
            node,
            fh,
            "Chmod",
            |f| f.chmod(mode),
            |t| t.backing.chmod(&t.path, mode, ctx),
        )
    }

    pub fn chown(
        &self,
        node: NodeId,
        fh: Option<u64>,
        uid: Option<u32>,
        gid: Option<u32>,
        ctx: &Context,
    ) -> Status {
        self.mutate_attr(
            node,
            fh,
            "Chown",
            |f| f.chown(uid, gid),
            |t| t.backing.chown(&t.path, uid, gid, ctx),
        )
    }

    pub fn truncate(&self, node: NodeId, fh: Option<u64>, size: u64, ctx: &Context) -> Status {
        self.mutate_attr(
            node,
            fh,
            "Truncate",
            |f| f.truncate(size),
            |t| t.backing.truncate(&t.path, size, ctx),
        )
    }

    pub fn utimens(
        &self,
        node: NodeId,
        fh: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        ctx: &Context,
    ) -> Status {
        self.mutate_attr(
            node,
            fh,
            "Utimens",
            |f| f.utimens(atime, mtime),
            |t| t.backing.utimens(&t.path, atime, mtime, ctx),
        )
    }

    /// Apply an attribute change through an open handle, falling back to the
    /// path when there is none or the last one reports `ENOSYS`/`EBADF`.
    ///
    /// The handle the kernel passed is tried first, whatever its open mode;
    /// after it come the node's writable handles.
    fn mutate_attr(
        &self,
        node: NodeId,
        fh: Option<u64>,
        op: &str,
        on_file: impl Fn(&dyn BackingFile) -> Status,
        on_path: impl FnOnce(&Target) -> Status,
    ) -> Status {
        let explicit = fh
            .and_then(|fh| self.handles.get(fh).map(|open| (fh, open)))
            .filter(|(_, open)| open.node == node);
        let mut files: Vec<_> = explicit.into_iter().collect();
        files.extend(
            self.handles
                .for_node(node, O_ANYWRITE)
                .into_iter()
                .filter(|(h, _)| Some(*h) != fh),
        );
        let mut last = None;
        for (_, open) in &files {
            match self.timed_file(op, node, || on_file(open.file.as_ref())) {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        match last {
            Some(e) if !e.is_handle_fallback() => Err(e),
            _ => {
                let target = self.target(node)?;
                self.timed(op, &target.path, || on_path(&target))
            }
        }
    }

    pub fn read_link(&self, node: NodeId, ctx: &Context) -> Status<PathBuf> {
        let t = self.target(node)?;
        self.timed("Readlink", &t.path, || t.backing.read_link(&t.path, ctx))
    }

    pub fn access(&self, node: NodeId, mask: i32, ctx: &Context) -> Status {
        let t = self.target(node)?;
        self.timed("Access", &t.path, || t.backing.access(&t.path, mask, ctx))
    }

    pub fn read_dir(&self, node: NodeId, ctx: &Context) -> Status<Vec<DirEntry>> {
        let t = self.target(node)?;
        self.timed("OpenDir", &t.path, || t.backing.read_dir(&t.path, ctx))
    }

    pub fn stat_fs(&self, node: NodeId) -> Status<StatFs> {
        let t = self.target(node)?;
        self.timed("StatFs", &t.path, || t.backing.stat_fs(&t.path))
    }

    pub fn get_xattr(&self, node: NodeId, name: &OsStr, ctx: &Context) -> Status<Vec<u8>> {
        let t = self.target(node)?;
        self.timed("GetXAttr", &t.path, || t.backing.get_xattr(&t.path, name, ctx))
    }

    pub fn list_xattr(&self, node: NodeId, ctx: &Context) -> Status<Vec<OsString>> {
        let t = self.target(node)?;
        self.timed("ListXAttr", &t.path, || t.backing.list_xattr(&t.path, ctx))
    }

    pub fn set_xattr(
        &self,
        node: NodeId,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        ctx: &Context,
    ) -> Status {
        let t = self.target(node)?;
        self.timed("SetXAttr", &t.path, || {
            t.backing.set_xattr(&t.path, name, value, flags, ctx)
        })
    }

    pub fn remove_xattr(&self, node: NodeId, name: &OsStr, ctx: &Context) -> Status {
        let t = self.target(node)?;
        self.timed("RemoveXAttr", &t.path, || {
            t.backing.remove_xattr(&t.path, name, ctx)
        })
    }

    pub fn mknod(
        &self,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        ctx: &Context,
    ) -> Status<Entry> {
        let t = self.child_target(parent, name)?;
        self.timed("Mknod", &t.path, || t.backing.mknod(&t.path, mode, rdev, ctx))?;
        self.link_new_child(parent, name, &t, ctx)
    }

    pub fn mkdir(&self, parent: NodeId, name: &OsStr, mode: u32, ctx: &Context) -> Status<Entry> {
        let t = self.child_target(parent, name)?;
        self.timed("Mkdir", &t.path, || t.backing.mkdir(&t.path, mode, ctx))?;
        self.link_new_child(parent, name, &t, ctx)
    }

    pub fn symlink(
        &self,
        parent: NodeId,
        name: &OsStr,
        link_target: &Path,
        ctx: &Context,
    ) -> Status<Entry> {
        let t = self.child_target(parent, name)?;
        self.timed("Symlink", &t.path, || {
            t.backing.symlink(link_target, &t.path, ctx)
        })?;
        self.link_new_child(parent, name, &t, ctx)
    }

    /// Create and open a regular file. Returns the new entry and its handle.
    pub fn create(
        &self,
        parent: NodeId,
        name: &OsStr,
        flags: i32,
        mode: u32,
        ctx: &Context,
    ) -> Status<(Entry, u64)> {
        let t = self.child_target(parent, name)?;
        let file = self.timed("Create", &t.path, || {
            t.backing.create(&t.path, flags, mode, ctx)
        })?;
        let entry = match self.link_new_child(parent, name, &t, ctx) {
            Ok(entry) => entry,
            Err(e) => {
                file.release();
                return Err(e);
            }
        };
        let fh = self.handles.insert(entry.node, flags, file);
        Ok((entry, fh))
    }

    /// Read the attributes of a freshly created object and put a node for it
    /// in the tree.
    fn link_new_child(
        &self,
        parent: NodeId,
        name: &OsStr,
        t: &Target,
        ctx: &Context,
    ) -> Status<Entry> {
        let attr = self.timed("GetAttr", &t.path, || t.backing.get_attr(&t.path, ctx))?;
        let attr = fix_nlink(attr);
        let is_dir = attr.kind == FileType::Directory;

        let mut tree = self.tree.write();
        let node = tree
            .create_child(parent, name, is_dir)
            .ok_or(Errno::ENOENT)?;
        tree.set_client_inode(node, attr.ino);
        if let Some(n) = tree.nodes.get_mut(node) {
            n.lookups += 1;
        }
        Ok(Entry { node, attr })
    }

    pub fn unlink(&self, parent: NodeId, name: &OsStr, ctx: &Context) -> Status {
        let t = self.child_target(parent, name)?;
        self.timed("Unlink", &t.path, || t.backing.unlink(&t.path, ctx))?;
        self.remove_child(parent, name);
        Ok(())
    }

    pub fn rmdir(&self, parent: NodeId, name: &OsStr, ctx: &Context) -> Status {
        let t = self.child_target(parent, name)?;
        self.timed("Rmdir", &t.path, || t.backing.rmdir(&t.path, ctx))?;
        self.remove_child(parent, name);
        Ok(())
    }

    fn remove_child(&self, parent: NodeId, name: &OsStr) {
        let mut tree = self.tree.write();
        if let Some(node) = tree.rm_child(parent, name) {
            self.consider_drop(&mut tree, node);
        }
    }

    pub fn rename(
        &self,
        old_parent: NodeId,
        old_name: &OsStr,
        new_parent: NodeId,
        new_name: &OsStr,
        ctx: &Context,
    ) -> Status {
        let old = self.child_target(old_parent, old_name)?;
        let new = self.child_target(new_parent, new_name)?;
        if old.mount != new.mount {
            return Err(Errno::EXDEV);
        }
        self.timed("Rename", &old.path, || {
            old.backing.rename(&old.path, &new.path, ctx)
        })?;

        let mut tree = self.tree.write();
        let moving = tree.nodes.child(old_parent, old_name);
        let occupant = tree.nodes.child(new_parent, new_name);
        tree.rename(old_parent, old_name, new_parent, new_name);
        if let Some(occupant) = occupant.filter(|o| Some(*o) != moving) {
            self.consider_drop(&mut tree, occupant);
        }
        Ok(())
    }

    /// Create a hardlink to `node` at `new_parent/new_name`.
    ///
    /// Only supported when backing identifiers are tracked: without them the
    /// new name could not be recognised as the same object.
    pub fn link(
        &self,
        node: NodeId,
        new_parent: NodeId,
        new_name: &OsStr,
        ctx: &Context,
    ) -> Status<Entry> {
        if !self.options.client_inodes {
            return Err(Errno::ENOSYS);
        }
        let old = self.target(node)?;
        let new = self.child_target(new_parent, new_name)?;
        if old.mount != new.mount {
            return Err(Errno::EXDEV);
        }
        self.timed("Link", &old.path, || {
            old.backing.link(&old.path, &new.path, ctx)
        })?;

        let attr = self.timed("GetAttr", &new.path, || {
            new.backing.get_attr(&new.path, ctx)
        })?;
        let attr = fix_nlink(attr);

        if self.client_inode(node) == Some(0) {
            if let Ok(old_attr) = self.timed("GetAttr", &old.path, || {
                old.backing.get_attr(&old.path, ctx)
            }) {
                self.tree.write().set_client_inode(node, old_attr.ino);
            }
        }

        let mut tree = self.tree.write();
        let linked = tree
            .find_child(new_parent, new_name, &attr)
            .ok_or(Errno::ENOENT)?;
        if linked != node {
            tracing::debug!(
                "Link of node {} produced a distinct object (inode {})",
                node,
                attr.ino
            );
        }
        if let Some(n) = tree.nodes.get_mut(linked) {
            n.lookups += 1;
        }
        Ok(Entry { node: linked, attr })
    }

    pub fn open(&self, node: NodeId, flags: i32, ctx: &Context) -> Status<u64> {
        let t = self.target(node)?;
        let file = self.timed("Open", &t.path, || t.backing.open(&t.path, flags, ctx))?;
        Ok(self.handles.insert(node, flags, file))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Status<Vec<u8>> {
        let open = self.handles.get(fh).ok_or(Errno::EBADF)?;
        self.timed_file("Read", open.node, || open.file.read(offset, size))
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Status<u32> {
        let open = self.handles.get(fh).ok_or(Errno::EBADF)?;
        self.timed_file("Write", open.node, || open.file.write(offset, data))
    }

    pub fn flush(&self, fh: u64) -> Status {
        let open = self.handles.get(fh).ok_or(Errno::EBADF)?;
        self.timed_file("Flush", open.node, || open.file.flush())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Status {
        let open = self.handles.get(fh).ok_or(Errno::EBADF)?;
        self.timed_file("Fsync", open.node, || open.file.fsync(datasync))
    }

    /// Close a handle. The node is freed if it was the last thing keeping a
    /// forgotten node alive.
    pub fn release(&self, fh: u64) -> Status {
        let open = self.handles.remove(fh).ok_or(Errno::EBADF)?;
        open.file.release();
        if open.node != ROOT_ID {
            let mut tree = self.tree.write();
            self.consider_drop(&mut tree, open.node);
        }
        Ok(())
    }

    /// Open handles on the node at `path` whose open flags intersect `mask`,
    /// as `(fh, flags)` pairs. A zero mask lists every handle.
    pub fn all_files(&self, path: &Path, mask: i32) -> Vec<(u64, i32)> {
        let Some(node) = self.node(path) else {
            return Vec::new();
        };
        self.handles
            .for_node(node, mask)
            .into_iter()
            .map(|(fh, open)| (fh, open.flags))
            .collect()
    }
}
