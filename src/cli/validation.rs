use pathbridge::error::{BridgeError, Result};
use std::path::{Path, PathBuf};

/// Check the directories handed to `mount` and return them canonicalized.
pub fn validate_mount_paths(source: &Path, mountpoint: &Path) -> Result<(PathBuf, PathBuf)> {
    if !source.is_dir() {
        return Err(BridgeError::NotADirectory(source.to_path_buf()));
    }
    if !mountpoint.is_dir() {
        return Err(BridgeError::NotADirectory(mountpoint.to_path_buf()));
    }

    let source = source.canonicalize()?;
    let mountpoint = mountpoint.canonicalize()?;

    if source == mountpoint {
        return Err(BridgeError::InvalidMount(
            "Source and mount point must be different directories".to_string(),
        ));
    }

    if mountpoint.starts_with(&source) {
        return Err(BridgeError::InvalidMount(format!(
            "Mount point {} must not be inside the source directory {}",
            mountpoint.display(),
            source.display()
        )));
    }

    Ok((source, mountpoint))
}
