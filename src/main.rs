use clap::Parser;
use std::path::PathBuf;

mod cli;

use cli::{Args, Commands, ConfigAction};
use duofs::error::Result;
use duofs::union::{self, MountOptions, SuperBlock, UnionFs};

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => {
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("DUOFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Mount {
            primary,
            secondary,
            mountpoint,
            allow_other,
            ttl,
        } => mount(primary, secondary, mountpoint, allow_other, ttl).await,
        Commands::Cleanup { mountpoints, stale } => {
            if stale {
                union::cleanup_stale_mounts();
            }
            let mut code = 0;
            for mountpoint in mountpoints {
                match union::unmount_fuse(&mountpoint) {
                    Ok(true) => println!("Unmounted {}", mountpoint.display()),
                    Ok(false) => {
                        eprintln!("Failed to unmount {} (not mounted?)", mountpoint.display());
                        code = 1;
                    }
                    Err(e) => {
                        eprintln!("Failed to unmount {}: {}", mountpoint.display(), e);
                        code = 1;
                    }
                }
            }
            Ok(code)
        }
        Commands::Config { action } => {
            match action.unwrap_or(ConfigAction::Show) {
                ConfigAction::Show => {
                    let config = duofs::load_config()?;
                    println!(
                        "{}",
                        toml::to_string_pretty(&config)
                            .map_err(|e| duofs::DuofsError::Config(e.to_string()))?
                    );
                }
                ConfigAction::Path => {
                    println!("{}", duofs::get_config_path()?.display());
                }
            }
            Ok(0)
        }
    }
}

async fn mount(
    primary: PathBuf,
    secondary: PathBuf,
    mountpoint: PathBuf,
    allow_other: bool,
    ttl: Option<u64>,
) -> Result<i32> {
    let config = duofs::load_config()?;

    // validation happens before anything is constructed; a bad branch fails
    // the mount with a descriptive error
    let sb = SuperBlock::assemble(&primary, &secondary)?;
    std::fs::create_dir_all(&mountpoint)?;

    let fs = UnionFs::new(sb, ttl.unwrap_or_else(|| config.mount.get_ttl_secs()))?;
    let opts = MountOptions {
        allow_other: allow_other || config.mount.get_allow_other(),
        auto_unmount: config.mount.get_auto_unmount(),
    };

    union::mount_fuse(fs, &mountpoint, &opts)?;
    println!(
        "duofs mounted at {} (press ctrl-c to unmount)",
        mountpoint.display()
    );

    tokio::signal::ctrl_c().await?;

    match union::unmount_fuse(&mountpoint) {
        Ok(true) => tracing::info!("Unmounted {}", mountpoint.display()),
        Ok(false) => tracing::warn!(
            "Could not unmount {} (may already be unmounted)",
            mountpoint.display()
        ),
        Err(e) => tracing::warn!("Unmount of {} failed: {}", mountpoint.display(), e),
    }
    Ok(0)
}
