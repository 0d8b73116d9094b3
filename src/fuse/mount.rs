use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::fuse::{FuseAdapter, KernelNotifier};
use crate::pathfs::PathNodeFs;

/// Kernel-facing mount settings.
#[derive(Debug, Clone)]
pub struct FuseMountOptions {
    pub fs_name: String,
    pub allow_other: bool,
    pub auto_unmount: bool,
    /// Attribute and entry cache timeout handed to the kernel.
    pub attr_ttl: Duration,
}

impl Default for FuseMountOptions {
    fn default() -> Self {
        FuseMountOptions {
            fs_name: "pathbridge".to_string(),
            allow_other: false,
            auto_unmount: true,
            attr_ttl: Duration::from_secs(1),
        }
    }
}

impl FuseMountOptions {
    fn mount_options(&self) -> Vec<fuser::MountOption> {
        let mut options = vec![fuser::MountOption::FSName(self.fs_name.clone())];
        if self.auto_unmount {
            options.push(fuser::MountOption::AutoUnmount);
        }
        if self.allow_other {
            options.push(fuser::MountOption::AllowOther);
        }
        options
    }
}

/// Mount `fs` at `mount_point` and serve requests until the filesystem is
/// unmounted.
///
/// The kernel notifier is installed on `fs` before the first request is
/// served.
pub fn mount_fuse(
    fs: Arc<PathNodeFs>,
    mount_point: &Path,
    options: &FuseMountOptions,
) -> Result<()> {
    fs::create_dir_all(mount_point).map_err(|e| {
        BridgeError::Config(format!(
            "Failed to create mount directory {}: {}",
            mount_point.display(),
            e
        ))
    })?;

    let adapter = FuseAdapter::new(Arc::clone(&fs), options.attr_ttl);
    let mount_options = options.mount_options();

    tracing::info!("Mounting FUSE filesystem at {}", mount_point.display());

    let mut session = fuser::Session::new(adapter, mount_point, &mount_options)
        .map_err(|e| BridgeError::Fuse(format!("FUSE mount failed: {}", e)))?;
    fs.set_notifier(Arc::new(KernelNotifier::new(session.notifier())));

    session
        .run()
        .map_err(|e| BridgeError::Fuse(format!("FUSE session failed: {}", e)))?;

    tracing::info!("FUSE filesystem unmounted");
    Ok(())
}
