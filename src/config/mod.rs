pub mod paths;
pub mod persistence;
pub mod schema;

pub use paths::*;
pub use persistence::*;
pub use schema::*;

fn default_attr_ttl_secs() -> u64 {
    1
}

fn default_fs_name() -> String {
    "pathbridge".to_string()
}

fn default_auto_unmount() -> bool {
    true
}
