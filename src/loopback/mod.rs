//! A [`PathFilesystem`] that serves a directory of the host filesystem.

mod convert;
mod file;

pub use file::LoopbackFile;

use convert::{metadata_to_fileattr, metadata_to_filetype, std_filetype_to_fuser};

use fuser::FileAttr;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::backing::{BackingFile, Context, DirEntry, PathFilesystem, StatFs};
use crate::status::{Errno, Status};

/// Mirrors `root` on the host. Paths handed in are relative to `root`.
#[derive(Debug, Clone)]
pub struct LoopbackFs {
    root: PathBuf,
}

impl LoopbackFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LoopbackFs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

fn c_path(path: &Path) -> Status<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

fn check_rc(rc: libc::c_int) -> Status {
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// `None` leaves the timestamp unchanged.
pub(crate) fn to_timespec(t: Option<SystemTime>) -> libc::timespec {
    match t.and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
        Some(d) => libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

fn open_options(flags: i32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    if flags & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    opts
}

impl PathFilesystem for LoopbackFs {
    fn name(&self) -> String {
        format!("LoopbackFs({})", self.root.display())
    }

    fn get_attr(&self, path: &Path, _ctx: &Context) -> Status<FileAttr> {
        let meta = fs::symlink_metadata(self.full_path(path))?;
        Ok(metadata_to_fileattr(&meta))
    }

    fn read_dir(&self, path: &Path, _ctx: &Context) -> Status<Vec<DirEntry>> {
        let dir = self.full_path(path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let kind = match entry.file_type().ok().and_then(std_filetype_to_fuser) {
                Some(kind) => kind,
                None => match entry.metadata() {
                    Ok(meta) => metadata_to_filetype(&meta),
                    Err(e) => {
                        tracing::debug!("Skipping {:?}: {}", entry.path(), e);
                        continue;
                    }
                },
            };
            entries.push(DirEntry {
                name: entry.file_name(),
                kind,
            });
        }
        Ok(entries)
    }

    fn read_link(&self, path: &Path, _ctx: &Context) -> Status<PathBuf> {
        Ok(fs::read_link(self.full_path(path))?)
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u32, _ctx: &Context) -> Status {
        let c = c_path(&self.full_path(path))?;
        // SAFETY: `c` is a valid NUL-terminated path that outlives the call.
        check_rc(unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
    }

    fn mkdir(&self, path: &Path, mode: u32, _ctx: &Context) -> Status {
        DirBuilder::new()
            .mode(mode)
            .create(self.full_path(path))
            .map_err(Errno::from)
    }

    fn unlink(&self, path: &Path, _ctx: &Context) -> Status {
        fs::remove_file(self.full_path(path)).map_err(Errno::from)
    }

    fn rmdir(&self, path: &Path, _ctx: &Context) -> Status {
        fs::remove_dir(self.full_path(path)).map_err(Errno::from)
    }

    fn symlink(&self, target: &Path, path: &Path, _ctx: &Context) -> Status {
        std::os::unix::fs::symlink(target, self.full_path(path)).map_err(Errno::from)
    }

    fn rename(&self, old_path: &Path, new_path: &Path, _ctx: &Context) -> Status {
        fs::rename(self.full_path(old_path), self.full_path(new_path)).map_err(Errno::from)
    }

    fn link(&self, old_path: &Path, new_path: &Path, _ctx: &Context) -> Status {
        fs::hard_link(self.full_path(old_path), self.full_path(new_path)).map_err(Errno::from)
    }

    fn chmod(&self, path: &Path, mode: u32, _ctx: &Context) -> Status {
        fs::set_permissions(self.full_path(path), Permissions::from_mode(mode))
            .map_err(Errno::from)
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>, _ctx: &Context) -> Status {
        std::os::unix::fs::lchown(self.full_path(path), uid, gid).map_err(Errno::from)
    }

    fn truncate(&self, path: &Path, size: u64, _ctx: &Context) -> Status {
        let file = OpenOptions::new().write(true).open(self.full_path(path))?;
        file.set_len(size).map_err(Errno::from)
    }

    fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        _ctx: &Context,
    ) -> Status {
        let c = c_path(&self.full_path(path))?;
        let times = [to_timespec(atime), to_timespec(mtime)];
        // SAFETY: `c` and `times` outlive the call.
        check_rc(unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        })
    }

    fn access(&self, path: &Path, mask: i32, _ctx: &Context) -> Status {
        let c = c_path(&self.full_path(path))?;
        // SAFETY: `c` is a valid NUL-terminated path that outlives the call.
        check_rc(unsafe { libc::access(c.as_ptr(), mask) })
    }

    fn open(&self, path: &Path, flags: i32, _ctx: &Context) -> Status<Box<dyn BackingFile>> {
        let file = open_options(flags).open(self.full_path(path))?;
        Ok(Box::new(LoopbackFile::new(file)))
    }

    fn create(
        &self,
        path: &Path,
        flags: i32,
        mode: u32,
        _ctx: &Context,
    ) -> Status<Box<dyn BackingFile>> {
        let mut opts = open_options(flags);
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            opts.write(true);
        }
        if flags & libc::O_EXCL != 0 {
            opts.create_new(true);
        } else {
            opts.create(true);
        }
        let file = opts.mode(mode).open(self.full_path(path))?;
        Ok(Box::new(LoopbackFile::new(file)))
    }

    fn get_xattr(&self, path: &Path, name: &OsStr, _ctx: &Context) -> Status<Vec<u8>> {
        match xattr::get(self.full_path(path), name)? {
            Some(value) => Ok(value),
            None => Err(Errno::ENOATTR),
        }
    }

    fn list_xattr(&self, path: &Path, _ctx: &Context) -> Status<Vec<OsString>> {
        Ok(xattr::list(self.full_path(path))?.collect())
    }

    fn set_xattr(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _ctx: &Context,
    ) -> Status {
        let full = self.full_path(path);
        if flags & (libc::XATTR_CREATE | libc::XATTR_REPLACE) != 0 {
            let exists = xattr::get(&full, name)?.is_some();
            if flags & libc::XATTR_CREATE != 0 && exists {
                return Err(Errno::EEXIST);
            }
            if flags & libc::XATTR_REPLACE != 0 && !exists {
                return Err(Errno::ENOATTR);
            }
        }
        xattr::set(full, name, value).map_err(Errno::from)
    }

    fn remove_xattr(&self, path: &Path, name: &OsStr, _ctx: &Context) -> Status {
        xattr::remove(self.full_path(path), name).map_err(Errno::from)
    }

    fn stat_fs(&self, path: &Path) -> Status<StatFs> {
        let c = c_path(&self.full_path(path))?;
        // SAFETY: statvfs is plain old data; an all-zero value is valid.
        let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: `c` and `buf` outlive the call.
        check_rc(unsafe { libc::statvfs(c.as_ptr(), &mut buf) })?;
        Ok(StatFs {
            blocks: buf.f_blocks as u64,
            bfree: buf.f_bfree as u64,
            bavail: buf.f_bavail as u64,
            files: buf.f_files as u64,
            ffree: buf.f_ffree as u64,
            bsize: buf.f_bsize as u32,
            namelen: buf.f_namemax as u32,
            frsize: buf.f_frsize as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_path_of_root_is_root() {
        let fs = LoopbackFs::new("/srv/data");
        assert_eq!(fs.full_path(Path::new("")), PathBuf::from("/srv/data"));
        assert_eq!(fs.full_path(Path::new("a/b")), PathBuf::from("/srv/data/a/b"));
    }

    #[test]
    fn test_omitted_time() {
        assert_eq!(to_timespec(None).tv_nsec, libc::UTIME_OMIT);
        let t = to_timespec(Some(UNIX_EPOCH + std::time::Duration::new(7, 9)));
        assert_eq!(t.tv_sec, 7);
        assert_eq!(t.tv_nsec, 9);
    }
}
