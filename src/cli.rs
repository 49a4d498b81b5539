use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "duofs")]
#[command(about = "Mount two directory trees as one, with whiteout-based deletion")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Mount a union of two branch directories")]
    Mount {
        #[arg(long, help = "Primary branch directory (creation and whiteout priority)")]
        primary: PathBuf,

        #[arg(long, help = "Secondary branch directory")]
        secondary: PathBuf,

        #[arg(help = "Where to mount the merged view")]
        mountpoint: PathBuf,

        #[arg(long, help = "Allow other users to access the mount")]
        allow_other: bool,

        #[arg(long, help = "Attribute cache TTL in seconds")]
        ttl: Option<u64>,
    },
    #[command(about = "Unmount duofs mounts")]
    Cleanup {
        #[arg(help = "Mount point(s) to unmount")]
        mountpoints: Vec<PathBuf>,

        #[arg(long, help = "Find and unmount stale duofs mounts")]
        stale: bool,
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
}
