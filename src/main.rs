mod cli;

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Command};
use log::info;
use simplefs_fuse::{create_image, mkfs, vfs, FileDisk, MkfsOptions, MountConfig, SimpleFs, ROOTINO};

fn open(image: &std::path::Path) -> io::Result<SimpleFs> {
    let disk = FileDisk::open(image)?;
    Ok(SimpleFs::mount(Arc::new(disk))?)
}

fn main() -> io::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Mkfs {
            image,
            capacity,
            create,
        } => {
            let opts = MkfsOptions { capacity };
            if create {
                create_image(&image, &opts)?;
            } else {
                mkfs(&FileDisk::open(&image)?, &opts)?;
            }
            info!("{} formatted", image.display());
        }
        Command::Mount {
            image,
            mountpoint,
            auto_unmount,
            read_only,
        } => {
            let config = MountConfig {
                auto_unmount,
                read_only,
            };
            vfs::mount(open(&image)?, mountpoint, &config)?;
        }
        Command::Fsck { image, repair } => {
            let fs = open(&image)?;
            let report = if repair { fs.repair()? } else { fs.check()? };
            print!("{report}");
            if !report.is_clean() && !repair {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Ls { image } => {
            let fs = open(&image)?;
            for entry in fs.readdir(ROOTINO, 0)? {
                let size = fs.inode(entry.ino)?.size();
                println!("{:>4} {:?} {:>6} {}", entry.ino, entry.kind, size, entry.name);
            }
            let stats = fs.statfs()?;
            println!(
                "{} of {} objects, {} of {} blocks free",
                stats.objects, stats.capacity, stats.free_blocks, stats.total_blocks
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}
