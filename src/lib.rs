pub mod bitmap;
pub mod blk_dev; // raw block devices
pub mod buf; // block store
pub mod common;
pub mod dir; // directory caches
pub mod disk; // on-disk records
pub mod error;
pub mod fs; // superblock manager
pub mod fsck;
pub mod inode; // inode store
pub mod mkfs;
pub mod simplefs;
pub mod sleeplock;
pub mod vfs; // FUSE front end

pub use blk_dev::{BlockDevice, FileDisk, MemDisk};
pub use common::*;
pub use error::{FsError, Result};
pub use fs::FsStats;
pub use fsck::CheckReport;
pub use inode::{FileKind, Inode};
pub use mkfs::{create_image, mkfs, MkfsOptions};
pub use simplefs::{DirEntry, File, ReadDir, SimpleFs};
pub use vfs::{MountConfig, SimpleFuse};
