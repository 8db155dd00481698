//! Mount a remote drive directory as a local filesystem.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info};

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "Mount a remote drive directory as a local filesystem.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        env = "DRIVEFS_CONFIG",
        help = "Optional path to a drivefs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the drive and serve it until interrupted.
    Mount {
        /// Directory to mount on. Created if missing; must be empty if present.
        mount_point: PathBuf,

        /// Reject every modification with EROFS.
        #[arg(long)]
        read_only: bool,

        /// Let other users access the mount (needs `user_allow_other` in /etc/fuse.conf).
        #[arg(long)]
        allow_other: bool,
    },

    /// Load and validate the configuration, then exit.
    CheckConfig,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln until tracing is initialized.
    let mut config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    config.apply_env(|key| std::env::var(key).ok());

    if let Command::Mount {
        read_only,
        allow_other,
        ..
    } = &args.command
    {
        config.mount.read_only |= *read_only;
        config.mount.allow_other |= *allow_other;
    }

    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    if let Err(e) = Trc::default().init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    match args.command {
        Command::CheckConfig => {
            info!(directory_id = %config.api.directory_id, "Configuration is valid.");
        }
        Command::Mount { mount_point, .. } => {
            debug!(config = ?config, "Starting with configuration...");
            if let Err(e) = daemon::spawn(config, mount_point) {
                error!("drivefs failed: {e}");
                std::process::exit(1);
            }
        }
    }
}
