use super::*;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Raw access to a device made of `BSIZE` blocks.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, blockno: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_block(&self, blockno: u64, buf: &[u8]) -> io::Result<()>;
    /// Push written blocks down to stable storage.
    fn flush(&self) -> io::Result<()>;
    fn num_blocks(&self) -> u64;
}

fn out_of_range(blockno: u64, nblocks: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("block {blockno} is past the end of the device ({nblocks} blocks)"),
    )
}

/// A disk image on the host filesystem.
#[derive(Debug)]
pub struct FileDisk {
    file: Mutex<File>,
    nblocks: u64,
}

impl FileDisk {
    pub fn new(file: File) -> io::Result<Self> {
        let nblocks = file.metadata()?.len() / BSIZE as u64;
        Ok(Self {
            file: Mutex::new(file),
            nblocks,
        })
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Self::new(file)
    }
}

impl BlockDevice for FileDisk {
    fn read_block(&self, blockno: u64, buf: &mut [u8]) -> io::Result<()> {
        if blockno >= self.nblocks {
            return Err(out_of_range(blockno, self.nblocks));
        }
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(blockno * BSIZE as u64))?;
        file.read_exact(&mut buf[..BSIZE])
    }

    fn write_block(&self, blockno: u64, buf: &[u8]) -> io::Result<()> {
        if blockno >= self.nblocks {
            return Err(out_of_range(blockno, self.nblocks));
        }
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(blockno * BSIZE as u64))?;
        file.write_all(&buf[..BSIZE])
    }

    fn flush(&self) -> io::Result<()> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sync_data()
    }

    fn num_blocks(&self) -> u64 {
        self.nblocks
    }
}

/// RAM-backed device. Writes can be made to fail to exercise error paths.
#[derive(Debug)]
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    nblocks: u64,
    fail_writes: AtomicBool,
    /// block whose writes fail, `u64::MAX` for none
    fail_block: AtomicU64,
}

impl MemDisk {
    pub fn new(nblocks: u64) -> Self {
        Self {
            data: Mutex::new(vec![0; nblocks as usize * BSIZE]),
            nblocks,
            fail_writes: AtomicBool::new(false),
            fail_block: AtomicU64::new(u64::MAX),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make writes to one block fail while every other block still works.
    pub fn set_fail_block(&self, blockno: Option<u64>) {
        self.fail_block
            .store(blockno.unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Copy of one block, bypassing the filesystem.
    pub fn block(&self, blockno: u64) -> Vec<u8> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = blockno as usize * BSIZE;
        data[start..start + BSIZE].to_vec()
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, blockno: u64, buf: &mut [u8]) -> io::Result<()> {
        if blockno >= self.nblocks {
            return Err(out_of_range(blockno, self.nblocks));
        }
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = blockno as usize * BSIZE;
        buf[..BSIZE].copy_from_slice(&data[start..start + BSIZE]);
        Ok(())
    }

    fn write_block(&self, blockno: u64, buf: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst)
            || self.fail_block.load(Ordering::SeqCst) == blockno
        {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        if blockno >= self.nblocks {
            return Err(out_of_range(blockno, self.nblocks));
        }
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = blockno as usize * BSIZE;
        data[start..start + BSIZE].copy_from_slice(&buf[..BSIZE]);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn num_blocks(&self) -> u64 {
        self.nblocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_disk_read_back() {
        let disk = MemDisk::new(4);
        let buf = [7u8; BSIZE];
        disk.write_block(3, &buf).unwrap();
        let mut out = [0u8; BSIZE];
        disk.read_block(3, &mut out).unwrap();
        assert_eq!(out, buf);
        assert!(disk.read_block(4, &mut out).is_err());
    }

    #[test]
    fn injected_write_failure() {
        let disk = MemDisk::new(1);
        disk.set_fail_writes(true);
        assert!(disk.write_block(0, &[0u8; BSIZE]).is_err());
        disk.set_fail_writes(false);
        assert!(disk.write_block(0, &[0u8; BSIZE]).is_ok());
    }

    #[test]
    fn injected_failure_on_one_block() {
        let disk = MemDisk::new(2);
        disk.set_fail_block(Some(1));
        assert!(disk.write_block(1, &[0u8; BSIZE]).is_err());
        assert!(disk.write_block(0, &[0u8; BSIZE]).is_ok());
        disk.set_fail_block(None);
        assert!(disk.write_block(1, &[0u8; BSIZE]).is_ok());
    }

    #[test]
    fn file_disk_sizes_from_file() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(3 * BSIZE as u64).unwrap();
        let disk = FileDisk::new(file).unwrap();
        assert_eq!(disk.num_blocks(), 3);
        disk.write_block(2, &[1u8; BSIZE]).unwrap();
        let mut out = [0u8; BSIZE];
        disk.read_block(2, &mut out).unwrap();
        assert_eq!(out[BSIZE - 1], 1);
        assert!(disk.read_block(3, &mut out).is_err());
    }
}
