use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pathbridge")]
#[command(about = "Serve a directory through a path-translating FUSE bridge")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Mount a directory and serve it until unmounted")]
    Mount {
        #[arg(help = "Directory to expose")]
        source: PathBuf,
        #[arg(help = "Where to mount it")]
        mountpoint: PathBuf,
        #[arg(long, help = "Track backing inode numbers so hardlinks share one node")]
        client_inodes: bool,
        #[arg(long, help = "Log every path resolution")]
        debug: bool,
        #[arg(long, value_name = "FILE", help = "Write per-operation latencies as JSON on exit")]
        latency_report: Option<PathBuf>,
    },
    #[command(about = "Manage configuration")]
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    #[command(about = "Show current configuration values")]
    Show,
    #[command(about = "Show config file path")]
    Path,
    #[command(about = "Write a default config file if none exists")]
    Init,
}
