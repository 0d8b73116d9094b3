use std::ffi::OsStr;

use crate::pathfs::types::NodeId;
use crate::status::Status;

/// Outbound cache invalidation towards the kernel.
pub trait Notifier: Send + Sync {
    /// Drop cached data of `node` in `[offset, offset + len)`. A negative
    /// offset invalidates attributes only; a zero length means "to the end".
    fn invalidate_content(&self, node: NodeId, offset: i64, len: i64) -> Status;

    /// Drop the cached lookup of `name` in directory `dir`.
    fn invalidate_entry(&self, dir: NodeId, name: &OsStr) -> Status;
}
