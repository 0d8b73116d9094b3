use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> pathbridge::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("PATHBRIDGE_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Mount {
            source,
            mountpoint,
            client_inodes,
            debug,
            latency_report,
        } => commands::run_mount(&source, &mountpoint, client_inodes, debug, latency_report),
        Commands::Config { action } => commands::handle_config_command(action),
    }
}
