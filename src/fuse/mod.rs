//! Kernel transport: serves a [`PathNodeFs`] through `fuser`.

mod mount;

pub use mount::{mount_fuse, FuseMountOptions};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::backing::Context;
use crate::pathfs::{Entry, NodeId, Notifier, PathNodeFs, ROOT_ID};
use crate::status::{Errno, Status};

/// Inode reported in directory listings for entries the tree has not seen.
const UNKNOWN_INO: u64 = 0xffff_ffff;

fn context(req: &Request<'_>) -> Context {
    Context {
        uid: req.uid(),
        gid: req.gid(),
        pid: req.pid(),
    }
}

fn system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Serves a [`PathNodeFs`] to the kernel. Node ids are used as inode numbers.
pub struct FuseAdapter {
    fs: Arc<PathNodeFs>,
    ttl: Duration,
    dirs: HashMap<u64, Vec<(u64, FileType, OsString)>>,
    next_dh: u64,
}

impl FuseAdapter {
    pub fn new(fs: Arc<PathNodeFs>, ttl: Duration) -> Self {
        FuseAdapter {
            fs,
            ttl,
            dirs: HashMap::new(),
            next_dh: 1,
        }
    }

    fn attr_for(node: NodeId, mut attr: FileAttr) -> FileAttr {
        attr.ino = node;
        attr
    }

    fn reply_entry(&self, result: Status<Entry>, reply: ReplyEntry) {
        match result {
            Ok(entry) => reply.entry(&self.ttl, &Self::attr_for(entry.node, entry.attr), 0),
            Err(e) => reply.error(e.code()),
        }
    }

    fn reply_xattr(data: Vec<u8>, size: u32, reply: ReplyXattr) {
        if size == 0 {
            reply.size(data.len() as u32);
        } else if size >= data.len() as u32 {
            reply.data(&data);
        } else {
            reply.error(libc::ERANGE);
        }
    }
}

impl Filesystem for FuseAdapter {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("pathbridge FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("pathbridge FUSE filesystem destroyed");
    }

    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.fs.lookup(parent, name, &context(req));
        self.reply_entry(result, reply);
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.get_attr(ino, fh, &context(req)) {
            Ok(attr) => reply.attr(&self.ttl, &Self::attr_for(ino, attr)),
            Err(e) => reply.error(e.code()),
        }
    }

    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ctx = context(req);
        let result = (|| -> Status {
            if let Some(mode) = mode {
                self.fs.chmod(ino, fh, mode, &ctx)?;
            }
            if uid.is_some() || gid.is_some() {
                self.fs.chown(ino, fh, uid, gid, &ctx)?;
            }
            if let Some(size) = size {
                self.fs.truncate(ino, fh, size, &ctx)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.fs.utimens(
                    ino,
                    fh,
                    atime.map(system_time),
                    mtime.map(system_time),
                    &ctx,
                )?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            reply.error(e.code());
            return;
        }
        match self.fs.get_attr(ino, fh, &ctx) {
            Ok(attr) => reply.attr(&self.ttl, &Self::attr_for(ino, attr)),
            Err(e) => reply.error(e.code()),
        }
    }

    fn readlink(&mut self, req: &Request, ino: u64, reply: ReplyData) {
        match self.fs.read_link(ino, &context(req)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.code()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self
            .fs
            .mknod(parent, name, mode & !umask, rdev, &context(req));
        self.reply_entry(result, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.fs.mkdir(parent, name, mode & !umask, &context(req));
        self.reply_entry(result, reply);
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.unlink(parent, name, &context(req)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.rmdir(parent, name, &context(req)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.fs.symlink(parent, link_name, target, &context(req));
        self.reply_entry(result, reply);
    }

    fn rename(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self
            .fs
            .rename(parent, name, newparent, newname, &context(req))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn link(
        &mut self,
        req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.fs.link(ino, newparent, newname, &context(req));
        self.reply_entry(result, reply);
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        match self.fs.open(ino, flags, &context(req)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.code()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.read(fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.code()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.write(fh, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.code()),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn opendir(&mut self, req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let entries = match self.fs.read_dir(ino, &context(req)) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.code());
                return;
            }
        };
        let parent = if ino == ROOT_ID {
            ROOT_ID
        } else {
            self.fs.parent(ino).unwrap_or(ino)
        };

        let mut listing = Vec::with_capacity(entries.len() + 2);
        listing.push((ino, FileType::Directory, OsString::from(".")));
        listing.push((parent, FileType::Directory, OsString::from("..")));
        let mut entries = entries;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        listing.extend(
            entries
                .into_iter()
                .map(|e| (UNKNOWN_INO, e.kind, e.name)),
        );

        let dh = self.next_dh;
        self.next_dh = self.next_dh.wrapping_add(1);
        self.dirs.insert(dh, listing);
        reply.opened(dh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::trace!("readdir(ino={}, offset={})", ino, offset);
        let Some(listing) = self.dirs.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        for (idx, (child_ino, kind, name)) in
            listing.iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(*child_ino, (idx + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dirs.remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        match self.fs.stat_fs(ino) {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(e) => reply.error(e.code()),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        match self.fs.set_xattr(ino, name, value, flags, &context(req)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn getxattr(&mut self, req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        match self.fs.get_xattr(ino, name, &context(req)) {
            Ok(value) => Self::reply_xattr(value, size, reply),
            Err(e) => reply.error(e.code()),
        }
    }

    fn listxattr(&mut self, req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        match self.fs.list_xattr(ino, &context(req)) {
            Ok(names) => {
                let mut data = Vec::new();
                for name in names {
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                }
                Self::reply_xattr(data, size, reply);
            }
            Err(e) => reply.error(e.code()),
        }
    }

    fn removexattr(&mut self, req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.remove_xattr(ino, name, &context(req)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.fs.access(ino, mask, &context(req)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self
            .fs
            .create(parent, name, flags, mode & !umask, &context(req))
        {
            Ok((entry, fh)) => reply.created(
                &self.ttl,
                &Self::attr_for(entry.node, entry.attr),
                0,
                fh,
                0,
            ),
            Err(e) => reply.error(e.code()),
        }
    }
}

/// Sends invalidations to the kernel over the session channel.
pub struct KernelNotifier {
    notifier: fuser::Notifier,
}

impl KernelNotifier {
    pub fn new(notifier: fuser::Notifier) -> Self {
        KernelNotifier { notifier }
    }
}

impl Notifier for KernelNotifier {
    fn invalidate_content(&self, node: NodeId, offset: i64, len: i64) -> Status {
        self.notifier
            .inval_inode(node, offset, len)
            .map_err(Errno::from)
    }

    fn invalidate_entry(&self, dir: NodeId, name: &OsStr) -> Status {
        self.notifier.inval_entry(dir, name).map_err(Errno::from)
    }
}
