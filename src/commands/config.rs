use crate::cli::ConfigAction;
use pathbridge::config::{get_config_path, load_config, save_config, Config};
use pathbridge::error::Result;

pub fn handle_config_command(action: Option<ConfigAction>) -> Result<()> {
    match action {
        Some(ConfigAction::Path) => {
            let config_path = get_config_path()?;
            println!("Config location: {}", config_path.display());
        }
        Some(ConfigAction::Init) => {
            let config_path = get_config_path()?;
            if config_path.exists() {
                println!("Config already exists at {}", config_path.display());
            } else {
                save_config(&Config::default())?;
                println!("Created default config at {}", config_path.display());
            }
        }
        None | Some(ConfigAction::Show) => {
            let config_path = get_config_path()?;
            let config = load_config()?;
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!(
                    "Config file: {} (not present, using defaults)",
                    config_path.display()
                );
            }
            println!();
            println!("Current configuration:");
            println!("  Bridge:");
            println!("    client_inodes: {}", config.bridge.get_client_inodes());
            println!("    debug: {}", config.bridge.get_debug());
            println!(
                "    link_count_policy: {}",
                config.bridge.get_link_count_policy()
            );
            println!("  FUSE:");
            println!("    attr_ttl_secs: {}", config.fuse.get_attr_ttl_secs());
            println!("    fs_name: {}", config.fuse.get_fs_name());
            println!("    allow_other: {}", config.fuse.get_allow_other());
            println!("    auto_unmount: {}", config.fuse.get_auto_unmount());
        }
    }
    Ok(())
}
