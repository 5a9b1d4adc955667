use clap::{Parser, Subcommand};
use simplefs_fuse::MAX_OBJECTS;
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "simplefs images: format, check and mount through FUSE")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Format an image
    Mkfs {
        image: PathBuf,

        /// Objects the image can hold, root directory included
        #[arg(long, short, default_value_t = MAX_OBJECTS)]
        capacity: u64,

        /// Create the image file, or truncate it, sized for the capacity
        #[arg(long)]
        create: bool,
    },

    /// Mount an image through FUSE
    Mount {
        image: PathBuf,
        mountpoint: PathBuf,

        /// Unmount when the process exits
        #[arg(long)]
        auto_unmount: bool,

        #[arg(long)]
        read_only: bool,
    },

    /// Check an image for orphans, dangling records and bad counters
    Fsck {
        image: PathBuf,

        /// Fix what was found
        #[arg(long)]
        repair: bool,
    },

    /// List the root directory of an image
    Ls { image: PathBuf },
}
