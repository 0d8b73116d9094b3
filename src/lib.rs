pub mod backing;
pub mod config;
pub mod error;
pub mod fuse;
pub mod latency;
pub mod loopback;
pub mod pathfs;
pub mod status;

pub use backing::{BackingFile, Context, DirEntry, PathFilesystem, StatFs};
pub use config::load_config;
pub use config::save_config;
pub use config::Config;
pub use error::{BridgeError, Result};
pub use latency::{LatencyMap, LatencySink};
pub use loopback::LoopbackFs;
pub use pathfs::{
    Entry, LinkCountPolicy, NodeId, Notifier, PathNodeFs, PathNodeFsOptions, ResolvedPath,
};
pub use status::{Errno, Status};
