//! Call surface of a path-addressed backing filesystem.
//!
//! The bridge translates kernel node identifiers into paths relative to the
//! mount root and hands them to an implementation of [`PathFilesystem`].
//! Every method has a default that reports `ENOSYS`, so an implementation only
//! needs to provide what it supports.

use fuser::{FileAttr, FileType};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::status::{Errno, Status};

/// Identity of the process that issued a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileType,
}

/// Filesystem statistics, as reported by `statfs(2)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// A file opened on the backing filesystem.
///
/// Attribute methods are tried before their path-based counterparts; returning
/// `ENOSYS` or `EBADF` makes the bridge fall back to the path.
pub trait BackingFile: Send + Sync {
    fn read(&self, offset: u64, size: u32) -> Status<Vec<u8>>;

    fn write(&self, offset: u64, data: &[u8]) -> Status<u32>;

    fn flush(&self) -> Status {
        Ok(())
    }

    fn fsync(&self, _datasync: bool) -> Status {
        Err(Errno::ENOSYS)
    }

    /// Called once when the last reference to the handle is released.
    fn release(&self) {}

    fn get_attr(&self) -> Status<FileAttr> {
        Err(Errno::ENOSYS)
    }

    fn chmod(&self, _mode: u32) -> Status {
        Err(Errno::ENOSYS)
    }

    fn chown(&self, _uid: Option<u32>, _gid: Option<u32>) -> Status {
        Err(Errno::ENOSYS)
    }

    fn truncate(&self, _size: u64) -> Status {
        Err(Errno::ENOSYS)
    }

    fn utimens(&self, _atime: Option<SystemTime>, _mtime: Option<SystemTime>) -> Status {
        Err(Errno::ENOSYS)
    }
}

/// A filesystem that only understands paths.
///
/// Paths are relative to the root of the mount the implementation is attached
/// to; the mount root itself is the empty path. `FileAttr::ino` carries the
/// implementation's own object identifier (0 if it has none) and is used only
/// to recognise hardlinks.
#[allow(unused_variables)]
pub trait PathFilesystem: Send + Sync {
    /// Human readable name used in log messages.
    fn name(&self) -> String {
        "PathFilesystem".to_string()
    }

    fn on_mount(&self) {}

    fn on_unmount(&self) {}

    fn get_attr(&self, path: &Path, ctx: &Context) -> Status<FileAttr>;

    fn read_dir(&self, path: &Path, ctx: &Context) -> Status<Vec<DirEntry>> {
        Err(Errno::ENOSYS)
    }

    fn read_link(&self, path: &Path, ctx: &Context) -> Status<PathBuf> {
        Err(Errno::ENOSYS)
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u32, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn mkdir(&self, path: &Path, mode: u32, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn unlink(&self, path: &Path, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, path: &Path, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn symlink(&self, target: &Path, path: &Path, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn rename(&self, old_path: &Path, new_path: &Path, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn link(&self, old_path: &Path, new_path: &Path, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn chmod(&self, path: &Path, mode: u32, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn truncate(&self, path: &Path, size: u64, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        ctx: &Context,
    ) -> Status {
        Err(Errno::ENOSYS)
    }

    fn access(&self, path: &Path, mask: i32, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn open(&self, path: &Path, flags: i32, ctx: &Context) -> Status<Box<dyn BackingFile>> {
        Err(Errno::ENOSYS)
    }

    fn create(
        &self,
        path: &Path,
        flags: i32,
        mode: u32,
        ctx: &Context,
    ) -> Status<Box<dyn BackingFile>> {
        Err(Errno::ENOSYS)
    }

    fn get_xattr(&self, path: &Path, name: &OsStr, ctx: &Context) -> Status<Vec<u8>> {
        Err(Errno::ENOSYS)
    }

    fn list_xattr(&self, path: &Path, ctx: &Context) -> Status<Vec<OsString>> {
        Err(Errno::ENOSYS)
    }

    fn set_xattr(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        ctx: &Context,
    ) -> Status {
        Err(Errno::ENOSYS)
    }

    fn remove_xattr(&self, path: &Path, name: &OsStr, ctx: &Context) -> Status {
        Err(Errno::ENOSYS)
    }

    fn stat_fs(&self, path: &Path) -> Status<StatFs> {
        Err(Errno::ENOSYS)
    }
}
