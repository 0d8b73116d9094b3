use fuser::FileAttr;
use parking_lot::Mutex;
use std::fs::{File, Permissions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::time::SystemTime;

use super::convert::metadata_to_fileattr;
use super::to_timespec;
use crate::backing::BackingFile;
use crate::status::{Errno, Status};

/// A host file opened through [`super::LoopbackFs`].
#[derive(Debug)]
pub struct LoopbackFile {
    file: Mutex<File>,
}

impl LoopbackFile {
    pub fn new(file: File) -> Self {
        LoopbackFile {
            file: Mutex::new(file),
        }
    }
}

impl BackingFile for LoopbackFile {
    fn read(&self, offset: u64, size: u32) -> Status<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(|e| {
            tracing::error!("read: seek failed - {}", e);
            Errno::from(e)
        })?;
        let mut buf = Vec::with_capacity(size as usize);
        (&mut *file)
            .take(u64::from(size))
            .read_to_end(&mut buf)
            .map_err(|e| {
                tracing::error!("read: read failed - {}", e);
                Errno::from(e)
            })?;
        Ok(buf)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Status<u32> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(|e| {
            tracing::error!("write: seek failed - {}", e);
            Errno::from(e)
        })?;
        file.write_all(data).map_err(|e| {
            tracing::error!("write: write failed - {}", e);
            Errno::from(e)
        })?;
        Ok(data.len() as u32)
    }

    fn flush(&self) -> Status {
        self.file.lock().flush().map_err(Errno::from)
    }

    fn fsync(&self, datasync: bool) -> Status {
        let file = self.file.lock();
        let result = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        result.map_err(Errno::from)
    }

    fn get_attr(&self) -> Status<FileAttr> {
        let meta = self.file.lock().metadata()?;
        Ok(metadata_to_fileattr(&meta))
    }

    fn chmod(&self, mode: u32) -> Status {
        self.file
            .lock()
            .set_permissions(Permissions::from_mode(mode))
            .map_err(Errno::from)
    }

    fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Status {
        std::os::unix::fs::fchown(&*self.file.lock(), uid, gid).map_err(Errno::from)
    }

    fn truncate(&self, size: u64) -> Status {
        self.file.lock().set_len(size).map_err(Errno::from)
    }

    fn utimens(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Status {
        let times = [to_timespec(atime), to_timespec(mtime)];
        let file = self.file.lock();
        // SAFETY: the descriptor stays open while the lock is held and `times`
        // outlives the call.
        let rc = unsafe { libc::futimens(file.as_raw_fd(), times.as_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}
