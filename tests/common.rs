use fuser::{FileAttr, FileType};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use pathbridge::backing::{BackingFile, Context, DirEntry, PathFilesystem, StatFs};
use pathbridge::pathfs::{NodeId, Notifier, PathNodeFs, PathNodeFsOptions};
use pathbridge::status::{Errno, Status};

pub const ROOT_INO: u64 = 1;

#[allow(dead_code)]
pub fn ctx() -> Context {
    Context::default()
}

#[allow(dead_code)]
pub fn tracked() -> PathNodeFsOptions {
    PathNodeFsOptions {
        client_inodes: true,
        ..Default::default()
    }
}

/// How open handles of a [`MemoryFs`] answer attribute calls.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleAttrs {
    Supported,
    Enosys,
    Ebadf,
    Eperm,
}

#[derive(Debug, Clone)]
struct Inode {
    kind: FileType,
    perm: u16,
    uid: u32,
    gid: u32,
    data: Vec<u8>,
    nlink: u32,
    mtime: SystemTime,
    target: Option<PathBuf>,
    xattrs: BTreeMap<OsString, Vec<u8>>,
}

impl Inode {
    fn new(kind: FileType, perm: u16) -> Self {
        Inode {
            kind,
            perm,
            uid: 0,
            gid: 0,
            data: Vec::new(),
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            mtime: UNIX_EPOCH,
            target: None,
            xattrs: BTreeMap::new(),
        }
    }
}

struct State {
    next_ino: u64,
    inodes: HashMap<u64, Inode>,
    entries: BTreeMap<PathBuf, u64>,
    failures: HashMap<String, Errno>,
    calls: Vec<(String, PathBuf)>,
    report_ino: bool,
    zero_nlink: bool,
    handle_attrs: HandleAttrs,
}

impl State {
    fn attr(&self, ino: u64) -> Status<FileAttr> {
        let inode = self.inodes.get(&ino).ok_or(Errno::ENOENT)?;
        Ok(FileAttr {
            ino: if self.report_ino { ino } else { 0 },
            size: inode.data.len() as u64,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: inode.mtime,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: inode.kind,
            perm: inode.perm,
            nlink: if self.zero_nlink { 0 } else { inode.nlink },
            uid: inode.uid,
            gid: inode.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        })
    }

    fn lookup(&self, path: &Path) -> Status<u64> {
        self.entries.get(path).copied().ok_or(Errno::ENOENT)
    }

    fn inode_mut(&mut self, path: &Path) -> Status<&mut Inode> {
        let ino = self.lookup(path)?;
        self.inodes.get_mut(&ino).ok_or(Errno::ENOENT)
    }

    fn check_new(&self, path: &Path) -> Status {
        let parent = path.parent().ok_or(Errno::EEXIST)?;
        let pino = self.lookup(parent)?;
        if self.inodes[&pino].kind != FileType::Directory {
            return Err(Errno::ENOTDIR);
        }
        if self.entries.contains_key(path) {
            return Err(Errno::EEXIST);
        }
        Ok(())
    }

    fn insert(&mut self, path: &Path, inode: Inode) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, inode);
        self.entries.insert(path.to_path_buf(), ino);
        ino
    }

    fn drop_link(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.nlink = inode.nlink.saturating_sub(1);
        }
    }

    fn is_empty_dir(&self, path: &Path) -> bool {
        !self.entries.keys().any(|p| p.parent() == Some(path))
    }
}

/// In-memory path filesystem with hardlinks, failure injection and a call log.
#[derive(Clone)]
pub struct MemoryFs {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl MemoryFs {
    pub fn new() -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(ROOT_INO, Inode::new(FileType::Directory, 0o755));
        let mut entries = BTreeMap::new();
        entries.insert(PathBuf::new(), ROOT_INO);
        MemoryFs {
            state: Arc::new(Mutex::new(State {
                next_ino: ROOT_INO + 1,
                inodes,
                entries,
                failures: HashMap::new(),
                calls: Vec::new(),
                report_ino: true,
                zero_nlink: false,
                handle_attrs: HandleAttrs::Supported,
            })),
        }
    }

    /// Report 0 as every object's identifier.
    pub fn without_inodes(self) -> Self {
        self.state.lock().report_ino = false;
        self
    }

    /// Report a link count of 0 for everything.
    pub fn with_zero_nlink(self) -> Self {
        self.state.lock().zero_nlink = true;
        self
    }

    pub fn set_handle_attrs(&self, mode: HandleAttrs) {
        self.state.lock().handle_attrs = mode;
    }

    /// Make every subsequent `op` call fail with `errno`.
    pub fn fail(&self, op: &str, errno: Errno) {
        self.state.lock().failures.insert(op.to_string(), errno);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn calls(&self, op: &str) -> Vec<PathBuf> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(o, _)| o == op)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn add_dir(&self, path: &str) -> u64 {
        let mut state = self.state.lock();
        state.insert(Path::new(path), Inode::new(FileType::Directory, 0o755))
    }

    pub fn add_file(&self, path: &str, data: &[u8]) -> u64 {
        let mut state = self.state.lock();
        let mut inode = Inode::new(FileType::RegularFile, 0o644);
        inode.data = data.to_vec();
        state.insert(Path::new(path), inode)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().entries.contains_key(Path::new(path))
    }

    pub fn ino_of(&self, path: &str) -> Option<u64> {
        self.state.lock().entries.get(Path::new(path)).copied()
    }

    pub fn nlink_of(&self, path: &str) -> Option<u32> {
        let state = self.state.lock();
        let ino = state.entries.get(Path::new(path))?;
        state.inodes.get(ino).map(|i| i.nlink)
    }

    pub fn perm_of(&self, path: &str) -> Option<u16> {
        let state = self.state.lock();
        let ino = state.entries.get(Path::new(path))?;
        state.inodes.get(ino).map(|i| i.perm)
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let ino = state.entries.get(Path::new(path))?;
        state.inodes.get(ino).map(|i| i.data.clone())
    }

    /// Rename without going through the bridge.
    pub fn rename_behind(&self, old: &str, new: &str) {
        self.do_rename(Path::new(old), Path::new(new))
            .expect("rename_behind");
    }

    /// Give the object at `path` a fresh identifier, as if it had been
    /// replaced behind the bridge's back.
    pub fn replace_behind(&self, path: &str) -> u64 {
        let mut state = self.state.lock();
        let old = state.entries[Path::new(path)];
        let inode = state.inodes[&old].clone();
        state.drop_link(old);
        state.insert(Path::new(path), inode)
    }

    fn record(&self, op: &str, path: &Path) -> Status {
        let mut state = self.state.lock();
        state.calls.push((op.to_string(), path.to_path_buf()));
        match state.failures.get(op) {
            Some(errno) => Err(*errno),
            None => Ok(()),
        }
    }

    fn do_rename(&self, old: &Path, new: &Path) -> Status {
        let mut state = self.state.lock();
        let ino = state.lookup(old)?;
        if new != old && new.starts_with(old) {
            return Err(Errno::EINVAL);
        }
        state.check_new(new).or_else(|e| {
            if e == Errno::EEXIST {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        if let Some(existing) = state.entries.get(new).copied() {
            if existing == ino {
                return Ok(());
            }
            if state.inodes[&existing].kind == FileType::Directory {
                if state.inodes[&ino].kind != FileType::Directory {
                    return Err(Errno::EISDIR);
                }
                if !state.is_empty_dir(new) {
                    return Err(Errno::ENOTEMPTY);
                }
            }
            state.entries.remove(new);
            state.drop_link(existing);
        }

        let moved: Vec<(PathBuf, u64)> = state
            .entries
            .iter()
            .filter(|(p, _)| p.starts_with(old))
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (p, i) in moved {
            state.entries.remove(&p);
            let rest = p.strip_prefix(old).unwrap_or(Path::new("")).to_path_buf();
            let target = if rest.as_os_str().is_empty() {
                new.to_path_buf()
            } else {
                new.join(rest)
            };
            state.entries.insert(target, i);
        }
        Ok(())
    }
}

impl PathFilesystem for MemoryFs {
    fn name(&self) -> String {
        "MemoryFs".to_string()
    }

    fn get_attr(&self, path: &Path, _ctx: &Context) -> Status<FileAttr> {
        self.record("get_attr", path)?;
        let state = self.state.lock();
        let ino = state.lookup(path)?;
        state.attr(ino)
    }

    fn read_dir(&self, path: &Path, _ctx: &Context) -> Status<Vec<DirEntry>> {
        self.record("read_dir", path)?;
        let state = self.state.lock();
        let ino = state.lookup(path)?;
        if state.inodes[&ino].kind != FileType::Directory {
            return Err(Errno::ENOTDIR);
        }
        Ok(state
            .entries
            .iter()
            .filter(|(p, _)| !p.as_os_str().is_empty() && p.parent() == Some(path))
            .filter_map(|(p, i)| {
                Some(DirEntry {
                    name: p.file_name()?.to_os_string(),
                    kind: state.inodes[i].kind,
                })
            })
            .collect())
    }

    fn read_link(&self, path: &Path, _ctx: &Context) -> Status<PathBuf> {
        self.record("read_link", path)?;
        let mut state = self.state.lock();
        state.inode_mut(path)?.target.clone().ok_or(Errno::EINVAL)
    }

    fn mknod(&self, path: &Path, mode: u32, _rdev: u32, _ctx: &Context) -> Status {
        self.record("mknod", path)?;
        let mut state = self.state.lock();
        state.check_new(path)?;
        state.insert(path, Inode::new(FileType::RegularFile, (mode & 0o7777) as u16));
        Ok(())
    }

    fn mkdir(&self, path: &Path, mode: u32, _ctx: &Context) -> Status {
        self.record("mkdir", path)?;
        let mut state = self.state.lock();
        state.check_new(path)?;
        state.insert(path, Inode::new(FileType::Directory, (mode & 0o7777) as u16));
        Ok(())
    }

    fn unlink(&self, path: &Path, _ctx: &Context) -> Status {
        self.record("unlink", path)?;
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        if state.inodes[&ino].kind == FileType::Directory {
            return Err(Errno::EISDIR);
        }
        state.entries.remove(path);
        state.drop_link(ino);
        Ok(())
    }

    fn rmdir(&self, path: &Path, _ctx: &Context) -> Status {
        self.record("rmdir", path)?;
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        if state.inodes[&ino].kind != FileType::Directory {
            return Err(Errno::ENOTDIR);
        }
        if !state.is_empty_dir(path) {
            return Err(Errno::ENOTEMPTY);
        }
        state.entries.remove(path);
        Ok(())
    }

    fn symlink(&self, target: &Path, path: &Path, _ctx: &Context) -> Status {
        self.record("symlink", path)?;
        let mut state = self.state.lock();
        state.check_new(path)?;
        let mut inode = Inode::new(FileType::Symlink, 0o777);
        inode.target = Some(target.to_path_buf());
        state.insert(path, inode);
        Ok(())
    }

    fn rename(&self, old_path: &Path, new_path: &Path, _ctx: &Context) -> Status {
        self.record("rename", old_path)?;
        self.do_rename(old_path, new_path)
    }

    fn link(&self, old_path: &Path, new_path: &Path, _ctx: &Context) -> Status {
        self.record("link", new_path)?;
        let mut state = self.state.lock();
        let ino = state.lookup(old_path)?;
        if state.inodes[&ino].kind == FileType::Directory {
            return Err(Errno::EPERM);
        }
        state.check_new(new_path)?;
        state.entries.insert(new_path.to_path_buf(), ino);
        if let Some(inode) = state.inodes.get_mut(&ino) {
            inode.nlink += 1;
        }
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32, _ctx: &Context) -> Status {
        self.record("chmod", path)?;
        self.state.lock().inode_mut(path)?.perm = (mode & 0o7777) as u16;
        Ok(())
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>, _ctx: &Context) -> Status {
        self.record("chown", path)?;
        let mut state = self.state.lock();
        let inode = state.inode_mut(path)?;
        if let Some(uid) = uid {
            inode.uid = uid;
        }
        if let Some(gid) = gid {
            inode.gid = gid;
        }
        Ok(())
    }

    fn truncate(&self, path: &Path, size: u64, _ctx: &Context) -> Status {
        self.record("truncate", path)?;
        self.state.lock().inode_mut(path)?.data.resize(size as usize, 0);
        Ok(())
    }

    fn utimens(
        &self,
        path: &Path,
        _atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        _ctx: &Context,
    ) -> Status {
        self.record("utimens", path)?;
        if let Some(mtime) = mtime {
            self.state.lock().inode_mut(path)?.mtime = mtime;
        }
        Ok(())
    }

    fn access(&self, path: &Path, _mask: i32, _ctx: &Context) -> Status {
        self.record("access", path)?;
        self.state.lock().lookup(path).map(|_| ())
    }

    fn open(&self, path: &Path, _flags: i32, _ctx: &Context) -> Status<Box<dyn BackingFile>> {
        self.record("open", path)?;
        let state = self.state.lock();
        let ino = state.lookup(path)?;
        if state.inodes[&ino].kind == FileType::Directory {
            return Err(Errno::EISDIR);
        }
        Ok(Box::new(MemoryFile {
            state: Arc::clone(&self.state),
            ino,
        }))
    }

    fn create(
        &self,
        path: &Path,
        _flags: i32,
        mode: u32,
        _ctx: &Context,
    ) -> Status<Box<dyn BackingFile>> {
        self.record("create", path)?;
        let mut state = self.state.lock();
        state.check_new(path)?;
        let ino = state.insert(path, Inode::new(FileType::RegularFile, (mode & 0o7777) as u16));
        Ok(Box::new(MemoryFile {
            state: Arc::clone(&self.state),
            ino,
        }))
    }

    fn get_xattr(&self, path: &Path, name: &OsStr, _ctx: &Context) -> Status<Vec<u8>> {
        self.record("get_xattr", path)?;
        let mut state = self.state.lock();
        state
            .inode_mut(path)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or(Errno::ENOATTR)
    }

    fn list_xattr(&self, path: &Path, _ctx: &Context) -> Status<Vec<OsString>> {
        self.record("list_xattr", path)?;
        let mut state = self.state.lock();
        Ok(state.inode_mut(path)?.xattrs.keys().cloned().collect())
    }

    fn set_xattr(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _ctx: &Context,
    ) -> Status {
        self.record("set_xattr", path)?;
        let mut state = self.state.lock();
        state
            .inode_mut(path)?
            .xattrs
            .insert(name.to_os_string(), value.to_vec());
        Ok(())
    }

    fn remove_xattr(&self, path: &Path, name: &OsStr, _ctx: &Context) -> Status {
        self.record("remove_xattr", path)?;
        let mut state = self.state.lock();
        state
            .inode_mut(path)?
            .xattrs
            .remove(name)
            .map(|_| ())
            .ok_or(Errno::ENOATTR)
    }

    fn stat_fs(&self, path: &Path) -> Status<StatFs> {
        self.record("stat_fs", path)?;
        let state = self.state.lock();
        Ok(StatFs {
            blocks: 1024,
            bfree: 512,
            bavail: 512,
            files: state.inodes.len() as u64,
            ffree: 1000,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }
}

/// Open handle of a [`MemoryFs`] object. Keeps working after every name of
/// the object is gone.
pub struct MemoryFile {
    state: Arc<Mutex<State>>,
    ino: u64,
}

impl MemoryFile {
    fn attr_call(&self, op: &str) -> Status {
        let mut state = self.state.lock();
        state.calls.push((format!("file.{}", op), PathBuf::new()));
        match state.handle_attrs {
            HandleAttrs::Supported => Ok(()),
            HandleAttrs::Enosys => Err(Errno::ENOSYS),
            HandleAttrs::Ebadf => Err(Errno::EBADF),
            HandleAttrs::Eperm => Err(Errno::EPERM),
        }
    }
}

impl BackingFile for MemoryFile {
    fn read(&self, offset: u64, size: u32) -> Status<Vec<u8>> {
        let state = self.state.lock();
        let inode = state.inodes.get(&self.ino).ok_or(Errno::EBADF)?;
        let start = (offset as usize).min(inode.data.len());
        let end = (start + size as usize).min(inode.data.len());
        Ok(inode.data[start..end].to_vec())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Status<u32> {
        let mut state = self.state.lock();
        let inode = state.inodes.get_mut(&self.ino).ok_or(Errno::EBADF)?;
        let end = offset as usize + data.len();
        if inode.data.len() < end {
            inode.data.resize(end, 0);
        }
        inode.data[offset as usize..end].copy_from_slice(data);
        Ok(data.len() as u32)
    }

    fn fsync(&self, _datasync: bool) -> Status {
        Ok(())
    }

    fn get_attr(&self) -> Status<FileAttr> {
        self.attr_call("get_attr")?;
        self.state.lock().attr(self.ino)
    }

    fn chmod(&self, mode: u32) -> Status {
        self.attr_call("chmod")?;
        let mut state = self.state.lock();
        let inode = state.inodes.get_mut(&self.ino).ok_or(Errno::EBADF)?;
        inode.perm = (mode & 0o7777) as u16;
        Ok(())
    }

    fn truncate(&self, size: u64) -> Status {
        self.attr_call("truncate")?;
        let mut state = self.state.lock();
        let inode = state.inodes.get_mut(&self.ino).ok_or(Errno::EBADF)?;
        inode.data.resize(size as usize, 0);
        Ok(())
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Content { node: NodeId, offset: i64, len: i64 },
    Entry { dir: NodeId, name: OsString },
}

/// Notifier that remembers what it was asked to invalidate.
#[derive(Default)]
pub struct RecordingNotifier {
    pub seen: Mutex<Vec<Notification>>,
}

#[allow(dead_code)]
impl RecordingNotifier {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.seen.lock())
    }
}

impl Notifier for RecordingNotifier {
    fn invalidate_content(&self, node: NodeId, offset: i64, len: i64) -> Status {
        self.seen
            .lock()
            .push(Notification::Content { node, offset, len });
        Ok(())
    }

    fn invalidate_entry(&self, dir: NodeId, name: &OsStr) -> Status {
        self.seen.lock().push(Notification::Entry {
            dir,
            name: name.to_os_string(),
        });
        Ok(())
    }
}

/// A bridge over a fresh [`MemoryFs`].
#[allow(dead_code)]
pub fn bridge(options: PathNodeFsOptions) -> (Arc<PathNodeFs>, MemoryFs) {
    let backing = MemoryFs::new();
    let fs = Arc::new(PathNodeFs::new(Arc::new(backing.clone()), options));
    (fs, backing)
}

#[allow(dead_code)]
pub fn name(s: &str) -> &OsStr {
    OsStr::new(s)
}

/// Points the config directory at a temporary location for the lifetime of
/// the value.
#[allow(dead_code)]
pub struct TestConfigContext {
    pub temp_dir: tempfile::TempDir,
    pub config_dir: PathBuf,
}

#[allow(dead_code)]
impl TestConfigContext {
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("config");
        std::env::set_var(
            "PATHBRIDGE_CONFIG_DIR",
            config_dir.to_string_lossy().to_string(),
        );
        TestConfigContext {
            temp_dir,
            config_dir,
        }
    }
}

impl Drop for TestConfigContext {
    fn drop(&mut self) {
        std::env::remove_var("PATHBRIDGE_CONFIG_DIR");
    }
}
