use pathbridge::config::load_config;
use pathbridge::error::{BridgeError, Result};
use pathbridge::fuse::mount_fuse;
use pathbridge::latency::{LatencyMap, LatencySink};
use pathbridge::loopback::LoopbackFs;
use pathbridge::pathfs::PathNodeFs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cli::validate_mount_paths;

pub fn run_mount(
    source: &Path,
    mountpoint: &Path,
    client_inodes: bool,
    debug: bool,
    latency_report: Option<PathBuf>,
) -> Result<()> {
    let (source, mountpoint) = validate_mount_paths(source, mountpoint)?;

    let config = load_config()?;
    let mut options = config.pathfs_options();
    options.client_inodes |= client_inodes;
    options.debug |= debug;

    let fs = Arc::new(PathNodeFs::new(Arc::new(LoopbackFs::new(&source)), options));

    let latencies = latency_report.as_ref().map(|_| Arc::new(LatencyMap::new()));
    if let Some(map) = &latencies {
        fs.set_latency_sink(Some(Arc::clone(map) as Arc<dyn LatencySink>));
    }

    println!(
        "Serving {} at {} (unmount to stop)",
        source.display(),
        mountpoint.display()
    );
    mount_fuse(Arc::clone(&fs), &mountpoint, &config.fuse_mount_options())?;

    if let (Some(path), Some(map)) = (latency_report, latencies) {
        std::fs::write(&path, map.to_json()?).map_err(|e| {
            BridgeError::Config(format!(
                "Failed to write latency report {}: {}",
                path.display(),
                e
            ))
        })?;
        println!("Latency report written to {}", path.display());
    }

    Ok(())
}
