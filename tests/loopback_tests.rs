use pathbridge::pathfs::{PathNodeFs, PathNodeFsOptions, ResolvedPath, ROOT_ID};
use pathbridge::{Context, Errno, LoopbackFs};
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn setup(client_inodes: bool) -> (TempDir, PathNodeFs) {
    let dir = TempDir::new().unwrap();
    let fs = PathNodeFs::new(
        Arc::new(LoopbackFs::new(dir.path())),
        PathNodeFsOptions {
            client_inodes,
            ..Default::default()
        },
    );
    (dir, fs)
}

fn ctx() -> Context {
    Context::default()
}

/// Test that files created through the bridge land in the backing directory.
#[test]
fn test_create_write_read() {
    let (dir, fs) = setup(false);

    let sub = fs.mkdir(ROOT_ID, OsStr::new("sub"), 0o755, &ctx()).unwrap();
    let (entry, fh) = fs
        .create(sub.node, OsStr::new("file.txt"), libc::O_RDWR, 0o644, &ctx())
        .unwrap();
    fs.write(fh, 0, b"hello world").unwrap();
    fs.flush(fh).unwrap();
    fs.fsync(fh, false).unwrap();

    assert_eq!(fs.read(fh, 6, 5).unwrap(), b"world".to_vec());
    fs.release(fh).unwrap();

    let on_disk = fs::read(dir.path().join("sub/file.txt")).unwrap();
    assert_eq!(on_disk, b"hello world");
    let attr = fs.get_attr(entry.node, None, &ctx()).unwrap();
    assert_eq!(attr.size, 11);
}

/// Test that rename through the bridge moves the host file and the node.
#[test]
fn test_rename_moves_host_file() {
    let (dir, fs) = setup(false);
    fs::create_dir(dir.path().join("a")).unwrap();
    fs::write(dir.path().join("a/f"), b"data").unwrap();

    let a = fs.lookup(ROOT_ID, OsStr::new("a"), &ctx()).unwrap();
    let f = fs.lookup(a.node, OsStr::new("f"), &ctx()).unwrap();

    fs.rename(ROOT_ID, OsStr::new("a"), ROOT_ID, OsStr::new("b"), &ctx())
        .unwrap();

    assert!(dir.path().join("b/f").exists());
    assert_eq!(fs.path(f.node), ResolvedPath::Path(PathBuf::from("b/f")));
    assert_eq!(fs.get_attr(f.node, None, &ctx()).unwrap().size, 4);
}

/// Test that host hardlinks resolve to one node when identifiers are tracked.
#[test]
fn test_host_hardlinks_share_node() {
    let (dir, fs) = setup(true);
    fs::write(dir.path().join("one"), b"x").unwrap();
    fs::hard_link(dir.path().join("one"), dir.path().join("two")).unwrap();

    let one = fs.lookup(ROOT_ID, OsStr::new("one"), &ctx()).unwrap();
    let two = fs.lookup(ROOT_ID, OsStr::new("two"), &ctx()).unwrap();

    assert_eq!(one.node, two.node);
    let host_ino = fs::metadata(dir.path().join("one")).unwrap().ino();
    assert_eq!(fs.client_inode(one.node), Some(host_ino));
    fs.verify().unwrap();
}

/// Test link followed by unlink of the original name on the host.
#[test]
fn test_link_then_unlink_on_host() {
    let (dir, fs) = setup(true);
    fs::write(dir.path().join("orig"), b"x").unwrap();
    let orig = fs.lookup(ROOT_ID, OsStr::new("orig"), &ctx()).unwrap();

    let linked = fs
        .link(orig.node, ROOT_ID, OsStr::new("copy"), &ctx())
        .unwrap();
    assert_eq!(linked.node, orig.node);
    assert_eq!(linked.attr.nlink, 2);

    fs.unlink(ROOT_ID, OsStr::new("orig"), &ctx()).unwrap();

    assert!(!dir.path().join("orig").exists());
    assert_eq!(
        fs.path(orig.node),
        ResolvedPath::Path(PathBuf::from("copy"))
    );
    assert_eq!(fs.get_attr(orig.node, None, &ctx()).unwrap().nlink, 1);
    fs.verify().unwrap();
}

/// Test directory, symlink and listing operations against the host.
#[test]
fn test_directory_and_symlink_operations() {
    let (dir, fs) = setup(false);

    let d = fs.mkdir(ROOT_ID, OsStr::new("d"), 0o755, &ctx()).unwrap();
    let link = fs
        .symlink(d.node, OsStr::new("ln"), Path::new("../target"), &ctx())
        .unwrap();
    fs.mknod(d.node, OsStr::new("node"), libc::S_IFREG | 0o644, 0, &ctx())
        .unwrap();

    assert_eq!(
        fs.read_link(link.node, &ctx()).unwrap(),
        PathBuf::from("../target")
    );
    let mut names: Vec<_> = fs
        .read_dir(d.node, &ctx())
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["ln", "node"]);

    assert_eq!(
        fs.rmdir(ROOT_ID, OsStr::new("d"), &ctx()).unwrap_err(),
        Errno::ENOTEMPTY
    );
    fs.unlink(d.node, OsStr::new("ln"), &ctx()).unwrap();
    fs.unlink(d.node, OsStr::new("node"), &ctx()).unwrap();
    fs.rmdir(ROOT_ID, OsStr::new("d"), &ctx()).unwrap();
    assert!(!dir.path().join("d").exists());
}

/// Test attribute changes through an open handle and through the path.
#[test]
fn test_attribute_changes() {
    let (dir, fs) = setup(false);
    let host = dir.path().join("f");
    fs::write(&host, b"0123456789").unwrap();
    let f = fs.lookup(ROOT_ID, OsStr::new("f"), &ctx()).unwrap();

    fs.chmod(f.node, None, 0o600, &ctx()).unwrap();
    assert_eq!(fs::metadata(&host).unwrap().permissions().mode() & 0o777, 0o600);

    let fh = fs.open(f.node, libc::O_WRONLY, &ctx()).unwrap();
    fs.truncate(f.node, None, 3, &ctx()).unwrap();
    fs.chmod(f.node, None, 0o640, &ctx()).unwrap();
    fs.release(fh).unwrap();

    let meta = fs::metadata(&host).unwrap();
    assert_eq!(meta.len(), 3);
    assert_eq!(meta.permissions().mode() & 0o777, 0o640);
}

/// Test access, statfs and a missing name.
#[test]
fn test_passthroughs() {
    let (_dir, fs) = setup(false);

    fs.access(ROOT_ID, libc::F_OK, &ctx()).unwrap();
    assert!(fs.stat_fs(ROOT_ID).unwrap().bsize > 0);
    assert_eq!(
        fs.lookup(ROOT_ID, OsStr::new("missing"), &ctx()).unwrap_err(),
        Errno::ENOENT
    );
}

/// Test that the create and replace flags of setxattr are honoured.
#[test]
fn test_set_xattr_flags() {
    let (dir, fs) = setup(false);
    fs::write(dir.path().join("f"), b"").unwrap();
    let f = fs.lookup(ROOT_ID, OsStr::new("f"), &ctx()).unwrap();
    let attr = OsStr::new("user.pathbridge");

    match fs.set_xattr(f.node, attr, b"one", 0, &ctx()) {
        Err(e) if e.0 == libc::EOPNOTSUPP => return,
        other => other.unwrap(),
    }

    assert_eq!(
        fs.set_xattr(f.node, attr, b"two", libc::XATTR_CREATE, &ctx())
            .unwrap_err(),
        Errno::EEXIST
    );
    fs.set_xattr(f.node, attr, b"two", libc::XATTR_REPLACE, &ctx())
        .unwrap();
    assert_eq!(fs.get_xattr(f.node, attr, &ctx()).unwrap(), b"two".to_vec());

    let missing = OsStr::new("user.missing");
    assert_eq!(
        fs.set_xattr(f.node, missing, b"x", libc::XATTR_REPLACE, &ctx())
            .unwrap_err(),
        Errno::ENOATTR
    );
    fs.set_xattr(f.node, missing, b"x", libc::XATTR_CREATE, &ctx())
        .unwrap();
}
