use crate::error::{BridgeError, Result};
use crate::fuse::FuseMountOptions;
use crate::pathfs::{LinkCountPolicy, PathNodeFsOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_inodes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_count_policy: Option<LinkCountPolicy>,
}

impl BridgeConfig {
    pub fn get_client_inodes(&self) -> bool {
        self.client_inodes.unwrap_or(false)
    }

    pub fn get_debug(&self) -> bool {
        self.debug.unwrap_or(false)
    }

    pub fn get_link_count_policy(&self) -> LinkCountPolicy {
        self.link_count_policy.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FuseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_other: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_unmount: Option<bool>,
}

impl FuseConfig {
    pub fn get_attr_ttl_secs(&self) -> u64 {
        self.attr_ttl_secs
            .unwrap_or_else(super::default_attr_ttl_secs)
    }

    pub fn get_fs_name(&self) -> String {
        self.fs_name.clone().unwrap_or_else(super::default_fs_name)
    }

    pub fn get_allow_other(&self) -> bool {
        self.allow_other.unwrap_or(false)
    }

    pub fn get_auto_unmount(&self) -> bool {
        self.auto_unmount
            .unwrap_or_else(super::default_auto_unmount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub fuse: FuseConfig,
}

impl Config {
    pub fn pathfs_options(&self) -> PathNodeFsOptions {
        PathNodeFsOptions {
            client_inodes: self.bridge.get_client_inodes(),
            debug: self.bridge.get_debug(),
            link_count_policy: self.bridge.get_link_count_policy(),
        }
    }

    pub fn fuse_mount_options(&self) -> FuseMountOptions {
        FuseMountOptions {
            fs_name: self.fuse.get_fs_name(),
            allow_other: self.fuse.get_allow_other(),
            auto_unmount: self.fuse.get_auto_unmount(),
            attr_ttl: Duration::from_secs(self.fuse.get_attr_ttl_secs()),
        }
    }
}

pub fn validate_config(config: &Config) -> Result<()> {
    if let Some(name) = &config.fuse.fs_name {
        if name.trim().is_empty() {
            return Err(BridgeError::Config(
                "fuse.fs_name must not be empty".to_string(),
            ));
        }
    }

    if config.fuse.get_attr_ttl_secs() > 3600 {
        tracing::warn!(
            "fuse.attr_ttl_secs ({}) is above one hour. \
             External changes to the source directory will go unnoticed for that long.",
            config.fuse.get_attr_ttl_secs()
        );
    }

    Ok(())
}
