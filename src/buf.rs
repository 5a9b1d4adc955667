//! Block store. A typical use is:
//!   buf = bcache.bread(...)
//!   modify buf.data[] / buf.put(...)
//!   bcache.bwrite(&mut buf)
//!   bcache.brelse(buf)
//!
//! A [`Buffer`] is a private copy of the block, borrowed for a single
//! operation and never kept across operations. Two callers rewriting the
//! same block lose one of the updates, so every read-modify-write runs under
//! the lock that owns the block: directory blocks under the directory lock,
//! file blocks under the file data lock, the inode store under the inode
//! lock and the superblock under the superblock lock.

use super::*;
use blk_dev::BlockDevice;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub struct Buffer {
    pub blockno: u64,
    pub data: Box<[u8; BSIZE]>,
    dirty: bool,
}

impl Buffer {
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[cfg(test)]
    fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Decode a fixed-size record stored at `offset`.
    pub fn get<T: DeserializeOwned>(&self, offset: usize) -> Result<T> {
        Ok(bincode::deserialize(&self.data[offset..])?)
    }

    /// Encode `value` at `offset` and mark the buffer dirty.
    pub fn put<T: Serialize>(&mut self, offset: usize, value: &T) -> Result<()> {
        let size = bincode::serialized_size(value)? as usize;
        if offset + size > BSIZE {
            return Err(FsError::Corrupt(format!(
                "record of {size} bytes at offset {offset} crosses block {}",
                self.blockno
            )));
        }
        bincode::serialize_into(&mut self.data[offset..offset + size], value)?;
        self.dirty = true;
        Ok(())
    }

    pub fn zero(&mut self) {
        self.data.fill(0);
        self.dirty = true;
    }
}

#[derive(Clone)]
pub struct BufCache {
    dev: Arc<dyn BlockDevice>,
}

impl BufCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self { dev }
    }

    pub fn num_blocks(&self) -> u64 {
        self.dev.num_blocks()
    }

    pub fn bread(&self, blockno: u64) -> Result<Buffer> {
        let mut data = Box::new([0u8; BSIZE]);
        self.dev.read_block(blockno, data.as_mut_slice())?;
        Ok(Buffer {
            blockno,
            data,
            dirty: false,
        })
    }

    /// Write the buffer through to the device and wait for it.
    pub fn bwrite(&self, buf: &mut Buffer) -> Result<()> {
        self.dev.write_block(buf.blockno, buf.data.as_slice())?;
        self.dev.flush()?;
        buf.dirty = false;
        Ok(())
    }

    /// End of the borrow. A buffer still dirty here is written back first.
    pub fn brelse(&self, mut buf: Buffer) -> Result<()> {
        if buf.dirty {
            warn!("block {} released dirty, writing back", buf.blockno);
            self.bwrite(&mut buf)?;
        }
        debug!("brelse block {}", buf.blockno);
        Ok(())
    }
}
