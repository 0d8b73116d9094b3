pub mod config;
pub mod mount;

pub use config::handle_config_command;
pub use mount::run_mount;
