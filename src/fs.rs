//! Superblock manager: free block map, live object counter and the
//! in-memory inode number map. Everything here sits behind the
//! superblock lock, the innermost of the three filesystem locks.

use super::*;
use bitmap::Bitmap;
use buf::BufCache;
use disk::{DInode, SuperBlock};
use sleeplock::{SleepGuard, SleepLock};

use log::{debug, error, info};

pub struct SbInfo {
    pub sb: SuperBlock,
    /// inode numbers in use, rebuilt from the inode store at mount
    pub imap: Bitmap,
}

impl SbInfo {
    /// Lowest inode number not in use.
    pub fn first_free_ino(&self) -> Option<u64> {
        self.imap
            .first_clear(ROOTINO as usize + 1..self.sb.capacity as usize + 1)
            .map(|ino| ino as u64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub capacity: u64,
    pub objects: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
}

pub fn readsb(bcache: &BufCache) -> Result<SuperBlock> {
    let buf = bcache.bread(SUPERBLOCK_BLOCK)?;
    let sb: SuperBlock = buf.get(0)?;
    bcache.brelse(buf)?;
    Ok(sb)
}

/// Write the superblock through to disk.
pub fn writesb(bcache: &BufCache, sb: &SuperBlock) -> Result<()> {
    let mut buf = bcache.bread(SUPERBLOCK_BLOCK)?;
    buf.put(0, sb)?;
    bcache.bwrite(&mut buf)?;
    bcache.brelse(buf)
}

/// Mark every inode number present in the inode store.
fn fill_imap(bcache: &BufCache) -> Result<Bitmap> {
    let mut imap = Bitmap::default();
    // 0 is never a valid inode number, 1 is the root
    imap.set(0);
    imap.set(ROOTINO as usize);

    let buf = bcache.bread(INODESTORE_BLOCK)?;
    for slot in 0..IPB {
        let dinode: DInode = buf.get(slot * INODE_SIZE)?;
        if dinode.inode_no == 0 {
            continue;
        }
        if dinode.inode_no as usize >= BITMAP_BITS {
            return Err(FsError::Corrupt(format!(
                "inode number {} in slot {slot} is out of range",
                dinode.inode_no
            )));
        }
        imap.set(dinode.inode_no as usize);
    }
    bcache.brelse(buf)?;
    Ok(imap)
}

pub struct SuperManager {
    bcache: BufCache,
    info: SleepLock<SbInfo>,
}

impl SuperManager {
    /// Read and check the superblock, then rebuild the inode map.
    pub fn load(bcache: BufCache) -> Result<Self> {
        let sb = readsb(&bcache)?;
        info!("magic number on disk is {:#x}", sb.magic);
        sb.validate()?;
        if bcache.num_blocks() < fs_blocks(sb.capacity) {
            return Err(FsError::Corrupt(format!(
                "device holds {} blocks, capacity {} needs {}",
                bcache.num_blocks(),
                sb.capacity,
                fs_blocks(sb.capacity)
            )));
        }
        info!(
            "simplefs version {} with block size {} detected, {} of {} objects in use",
            sb.version, sb.block_size, sb.inodes_count, sb.capacity
        );

        let imap = fill_imap(&bcache)?;
        debug!("first free inode number {:?}", imap.first_clear(2..BITMAP_BITS));
        Ok(Self {
            bcache,
            info: SleepLock::new("superblock", SbInfo { sb, imap }),
        })
    }

    pub fn lock(&self) -> Result<SleepGuard<'_, SbInfo>> {
        self.info.lock()
    }

    pub fn interrupt(&self) {
        self.info.interrupt();
    }

    /// Persist the superblock held by `info`.
    pub fn sync(&self, info: &SbInfo) -> Result<()> {
        writesb(&self.bcache, &info.sb)
    }

    pub fn object_count(&self) -> Result<u64> {
        Ok(self.lock()?.sb.inodes_count)
    }

    pub fn capacity(&self) -> Result<u64> {
        Ok(self.lock()?.sb.capacity)
    }

    /// Lowest inode number not in use. It is only reserved once the inode is inserted.
    pub fn free_ino(&self) -> Result<u64> {
        self.lock()?.first_free_ino().ok_or_else(|| {
            error!("no free inode number left");
            FsError::OutOfSpace
        })
    }

    /// Take the lowest free data block, persist the map and hand back a zeroed block.
    pub fn alloc_block(&self) -> Result<u64> {
        let bno = {
            let mut info = self.lock()?;
            let range = info.sb.data_blocks();
            let bno = info
                .sb
                .free_blocks
                .first_clear(range.start as usize..range.end as usize)
                .ok_or_else(|| {
                    error!("no more free blocks available");
                    FsError::OutOfSpace
                })?;
            info.sb.free_blocks.set(bno);
            if let Err(e) = self.sync(&info) {
                info.sb.free_blocks.clear(bno);
                return Err(e);
            }
            bno as u64
        };
        debug!("allocated block {bno}");

        let mut buf = self.bcache.bread(bno)?;
        buf.zero();
        self.bcache.bwrite(&mut buf)?;
        self.bcache.brelse(buf)?;
        Ok(bno)
    }

    pub fn free_block(&self, bno: u64) -> Result<()> {
        let mut info = self.lock()?;
        if !info.sb.data_blocks().contains(&bno) {
            return Err(FsError::InvalidArgument(format!(
                "block {bno} is not a data block"
            )));
        }
        if !info.sb.free_blocks.test(bno as usize) {
            error!("freeing free block {bno}");
            return Err(FsError::Corrupt(format!("block {bno} is already free")));
        }
        info.sb.free_blocks.clear(bno as usize);
        if let Err(e) = self.sync(&info) {
            info.sb.free_blocks.set(bno as usize);
            return Err(e);
        }
        debug!("freed block {bno}");
        Ok(())
    }

    pub fn stats(&self) -> Result<FsStats> {
        let info = self.lock()?;
        let total_blocks = fs_blocks(info.sb.capacity);
        // nothing past the last block is ever marked
        let busy = info.sb.free_blocks.count_ones() as u64;
        Ok(FsStats {
            capacity: info.sb.capacity,
            objects: info.sb.inodes_count,
            total_blocks,
            free_blocks: total_blocks - busy,
        })
    }
}
