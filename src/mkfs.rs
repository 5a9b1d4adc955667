//! Formatting of a fresh image.

use super::*;
use blk_dev::{BlockDevice, FileDisk};
use disk::{DInode, SuperBlock};

use log::info;
use std::fs::OpenOptions;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MkfsOptions {
    /// Number of objects, root directory included, the image can hold.
    pub capacity: u64,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            capacity: MAX_OBJECTS,
        }
    }
}

/// Lay down an empty filesystem holding only the root directory.
pub fn mkfs(dev: &dyn BlockDevice, opts: &MkfsOptions) -> Result<()> {
    if opts.capacity < 2 || opts.capacity > MAX_OBJECTS {
        return Err(FsError::InvalidArgument(format!(
            "capacity must be between 2 and {MAX_OBJECTS}, got {}",
            opts.capacity
        )));
    }
    let nblocks = fs_blocks(opts.capacity);
    if dev.num_blocks() < nblocks {
        return Err(FsError::OutOfSpace);
    }

    let zero = [0u8; BSIZE];
    for bno in 0..nblocks {
        dev.write_block(bno, &zero)?;
    }

    let mut block = [0u8; BSIZE];
    bincode::serialize_into(&mut block[..], &SuperBlock::new(opts.capacity))?;
    dev.write_block(SUPERBLOCK_BLOCK, &block)?;

    let root = DInode::new(S_IFDIR | 0o755, ROOTINO, ROOTDIR_DATABLOCK, 0);
    let mut block = [0u8; BSIZE];
    bincode::serialize_into(&mut block[DInode::offset(ROOTINO)..], &root)?;
    dev.write_block(INODESTORE_BLOCK, &block)?;

    dev.flush()?;
    info!(
        "formatted simplefs: {} blocks of {} bytes, room for {} objects",
        nblocks, BSIZE, opts.capacity
    );
    Ok(())
}

/// Create (or truncate) an image file sized for `opts` and format it.
pub fn create_image(path: impl AsRef<Path>, opts: &MkfsOptions) -> Result<FileDisk> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(fs_blocks(opts.capacity) * BSIZE as u64)?;
    let disk = FileDisk::new(file)?;
    mkfs(&disk, opts)?;
    Ok(disk)
}
