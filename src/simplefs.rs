//! A mounted filesystem instance.
//!
//! [`SimpleFs`] owns the block store, the superblock manager, the inode
//! store and the directory caches. Creation and deletion are serialized by
//! the directory-children lock, file contents by the file data lock. Locks
//! are always taken in the order directory-children, file data, inode,
//! superblock.

use super::*;
use blk_dev::BlockDevice;
use buf::BufCache;
use dir::DirCacheTable;
use disk::{check_name, DirRecord};
use fs::{FsStats, SuperManager};
use inode::{FileKind, Inode, InodeBody, InodeStore};
use sleeplock::SleepLock;

use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

/// One used record of a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileKind,
    /// slot of the record inside the directory block
    pub index: usize,
}

/// Listing of a directory, in ascending entry index order.
pub struct ReadDir {
    entries: std::vec::IntoIter<DirEntry>,
}

impl Iterator for ReadDir {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        self.entries.next()
    }
}

pub struct SimpleFs {
    pub(crate) bcache: BufCache,
    pub(crate) sbm: SuperManager,
    pub(crate) istore: InodeStore,
    pub(crate) dirs: SleepLock<DirCacheTable>,
    /// held while a data block of a regular file is read or rewritten
    pub(crate) data: SleepLock<()>,
}

impl SimpleFs {
    /// Check the superblock of `dev` and bring the filesystem up.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Self> {
        let bcache = BufCache::new(dev);
        let sbm = SuperManager::load(bcache.clone())?;
        let istore = InodeStore::new(bcache.clone());
        let root = istore.find(ROOTINO)?.ok_or_else(|| {
            FsError::Corrupt("root inode missing from the inode store".into())
        })?;
        if !root.is_dir() || root.data_block != ROOTDIR_DATABLOCK {
            return Err(FsError::Corrupt(format!("bad root inode {root:?}")));
        }
        info!("simplefs mounted, root has {} children", root.children());
        Ok(Self {
            bcache,
            sbm,
            istore,
            dirs: SleepLock::new("directory children", DirCacheTable::default()),
            data: SleepLock::new("file data", ()),
        })
    }

    pub fn root(&self) -> Result<Inode> {
        self.istore.get(ROOTINO)
    }

    /// Current record of inode `ino`.
    pub fn inode(&self, ino: u64) -> Result<Inode> {
        self.istore.get(ino)
    }

    fn dir_inode(&self, ino: u64) -> Result<Inode> {
        let inode = self.istore.get(ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory(ino));
        }
        Ok(inode)
    }

    fn file_inode(&self, ino: u64) -> Result<Inode> {
        let inode = self.istore.get(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory(ino));
        }
        Ok(inode)
    }

    /// Create a directory or regular file called `name` under `parent`.
    pub fn create(&self, parent: u64, name: &str, mode: u32) -> Result<Inode> {
        if FileKind::from_mode(mode).is_none() {
            return Err(FsError::InvalidArgument(format!(
                "cannot create objects of mode {mode:#o}"
            )));
        }
        check_name(name)?;

        let mut dirs = self.dirs.lock()?;
        if self.sbm.object_count()? >= self.sbm.capacity()? {
            warn!("object limit reached, cannot create {name}");
            return Err(FsError::OutOfSpace);
        }
        let mut parent = self.dir_inode(parent)?;
        let cache = dirs.get_or_build(&self.bcache, &parent)?;
        if cache.lookup(name).is_some() {
            return Err(FsError::Exists(name.to_owned()));
        }
        let index = cache.free_slot().ok_or_else(|| {
            warn!("directory {} has no free record", parent.ino);
            FsError::OutOfSpace
        })?;

        let ino = self.sbm.free_ino()?;
        let bno = self.sbm.alloc_block()?;
        let inode = Inode::new(ino, mode, bno)?;
        if let Err(e) = self.istore.insert(&self.sbm, &inode) {
            // nothing refers to the block yet
            if let Err(undo) = self.sbm.free_block(bno) {
                warn!("could not give back block {bno}: {undo}");
            }
            return Err(e);
        }

        let record = DirRecord::new(name, ino)?;
        let mut buf = self.bcache.bread(parent.data_block)?;
        buf.put(DirRecord::offset(index), &record)?;
        self.bcache.bwrite(&mut buf)?;
        self.bcache.brelse(buf)?;
        cache.insert_used(index, record);

        parent.body = InodeBody::Dir {
            children: parent.children() + 1,
        };
        self.istore.save(&self.sbm, &parent)?;
        info!(
            "created {name} as inode {ino} (block {bno}) in directory {}",
            parent.ino
        );
        Ok(inode)
    }

    pub fn mkdir(&self, parent: u64, name: &str, perm: u32) -> Result<Inode> {
        self.create(parent, name, S_IFDIR | (perm & 0o7777))
    }

    pub fn create_file(&self, parent: u64, name: &str, perm: u32) -> Result<Inode> {
        self.create(parent, name, S_IFREG | (perm & 0o7777))
    }

    /// Unlink `name` from `parent` and free its inode and data block.
    /// A directory must be empty.
    pub fn delete(&self, parent: u64, name: &str) -> Result<()> {
        self.remove_entry(parent, name, None)
    }

    /// Like [`SimpleFs::delete`], but `name` must be a regular file.
    pub fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        self.remove_entry(parent, name, Some(FileKind::File))
    }

    /// Like [`SimpleFs::delete`], but `name` must be a directory.
    pub fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        self.remove_entry(parent, name, Some(FileKind::Directory))
    }

    fn remove_entry(&self, parent: u64, name: &str, expect: Option<FileKind>) -> Result<()> {
        let mut dirs = self.dirs.lock()?;
        // no write may still be in flight on the block about to be freed
        let _data = self.data.lock()?;
        let mut parent = self.dir_inode(parent)?;
        let cache = dirs.get_or_build(&self.bcache, &parent)?;
        let (index, ino) = cache
            .lookup(name)
            .map(|(index, record)| (index, record.inode_no))
            .ok_or_else(|| FsError::NotFound(name.to_owned()))?;
        let target = self.istore.get(ino)?;
        match (expect, target.kind()) {
            (Some(FileKind::File), FileKind::Directory) => {
                return Err(FsError::IsADirectory(ino))
            }
            (Some(FileKind::Directory), FileKind::File) => {
                return Err(FsError::NotADirectory(ino))
            }
            _ => {}
        }
        if target.is_dir() && target.children() > 0 {
            return Err(FsError::NotEmpty(name.to_owned()));
        }

        let mut buf = self.bcache.bread(parent.data_block)?;
        buf.put(DirRecord::offset(index), &DirRecord::default())?;
        self.bcache.bwrite(&mut buf)?;
        self.bcache.brelse(buf)?;
        cache.release(index);

        parent.body = InodeBody::Dir {
            children: parent.children().saturating_sub(1),
        };
        self.istore.save(&self.sbm, &parent)?;
        self.istore.remove(&self.sbm, &target)?;
        self.sbm.free_block(target.data_block)?;
        if target.is_dir() {
            dirs.release(target.ino);
        }
        info!("deleted {name} (inode {ino}) from directory {}", parent.ino);
        Ok(())
    }

    /// Inode named `name` in `parent`, `None` when there is no such entry.
    pub fn lookup(&self, parent: u64, name: &str) -> Result<Option<Inode>> {
        let mut dirs = self.dirs.lock()?;
        let parent = self.dir_inode(parent)?;
        let cache = dirs.get_or_build(&self.bcache, &parent)?;
        let Some((_, record)) = cache.lookup(name) else {
            return Ok(None);
        };
        let ino = record.inode_no;
        let found = self.istore.find(ino)?;
        if found.is_none() {
            warn!("{name} in directory {} points at missing inode {ino}", parent.ino);
        }
        Ok(found)
    }

    /// Entries of `dir` starting at cursor `pos`. The whole listing is
    /// produced at cursor 0, any other cursor yields nothing.
    pub fn readdir(&self, dir: u64, pos: u64) -> Result<ReadDir> {
        let mut dirs = self.dirs.lock()?;
        let dir = self.dir_inode(dir)?;
        let cache = dirs.get_or_build(&self.bcache, &dir)?;
        let mut entries = Vec::new();
        if pos == 0 {
            let kinds: HashMap<u64, FileKind> = self
                .istore
                .live_inodes()?
                .iter()
                .map(|inode| (inode.ino, inode.kind()))
                .collect();
            for (index, record) in cache.used() {
                let Some(&kind) = kinds.get(&record.inode_no) else {
                    warn!(
                        "skipping {} in directory {}, inode {} is gone",
                        record.name(),
                        dir.ino,
                        record.inode_no
                    );
                    continue;
                };
                entries.push(DirEntry {
                    name: record.name().to_owned(),
                    ino: record.inode_no,
                    kind,
                    index,
                });
            }
        }
        debug!("listing directory {} from {pos}: {} entries", dir.ino, entries.len());
        Ok(ReadDir {
            entries: entries.into_iter(),
        })
    }

    /// `(name, inode number)` pairs of `dir`.
    pub fn list(&self, dir: u64) -> Result<Vec<(String, u64)>> {
        Ok(self.readdir(dir, 0)?.map(|e| (e.name, e.ino)).collect())
    }

    /// The directory handle of `dir` went away, forget its cache.
    pub fn release_dir(&self, dir: u64) -> Result<bool> {
        Ok(self.dirs.lock()?.release(dir))
    }

    /// Copy bytes `[offset, offset + buf.len())` of a file, cut at its size.
    pub fn read_at(&self, ino: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _data = self.data.lock()?;
        let inode = self.file_inode(ino)?;
        let size = inode.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let start = offset as usize;
        let end = (offset + buf.len() as u64).min(size) as usize;
        let block = self.bcache.bread(inode.data_block)?;
        buf[..end - start].copy_from_slice(&block.data[start..end]);
        self.bcache.brelse(block)?;
        Ok(end - start)
    }

    /// Store `data` at `offset`, cut at the end of the file's block. The size
    /// becomes the end of the write.
    pub fn write_at(&self, ino: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let _data = self.data.lock()?;
        let mut inode = self.file_inode(ino)?;
        if offset >= BSIZE as u64 {
            return Err(FsError::FileTooLarge(offset));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let start = offset as usize;
        let end = (start + data.len()).min(BSIZE);
        let old_size = inode.size() as usize;

        let mut buf = self.bcache.bread(inode.data_block)?;
        if start > old_size {
            // a gap past the old end reads back as zeroes
            buf.data[old_size..start].fill(0);
        }
        buf.data[start..end].copy_from_slice(&data[..end - start]);
        buf.mark_dirty();
        self.bcache.bwrite(&mut buf)?;
        self.bcache.brelse(buf)?;

        inode.body = InodeBody::File { size: end as u64 };
        self.istore.save(&self.sbm, &inode)?;
        debug!("wrote {} bytes at {offset} to inode {ino}", end - start);
        Ok(end - start)
    }

    /// Set the size of a file. Growing fills the new tail with zeroes.
    pub fn truncate(&self, ino: u64, size: u64) -> Result<Inode> {
        let _data = self.data.lock()?;
        let mut inode = self.file_inode(ino)?;
        if size > BSIZE as u64 {
            return Err(FsError::FileTooLarge(size));
        }
        let old_size = inode.size();
        if size > old_size {
            let mut buf = self.bcache.bread(inode.data_block)?;
            buf.data[old_size as usize..size as usize].fill(0);
            buf.mark_dirty();
            self.bcache.bwrite(&mut buf)?;
            self.bcache.brelse(buf)?;
        }
        inode.body = InodeBody::File { size };
        self.istore.save(&self.sbm, &inode)?;
        Ok(inode)
    }

    /// Handle on a regular file with its own position.
    pub fn open(&self, ino: u64) -> Result<File<'_>> {
        self.file_inode(ino)?;
        Ok(File {
            fs: self,
            ino,
            pos: 0,
        })
    }

    pub fn statfs(&self) -> Result<FsStats> {
        self.sbm.stats()
    }

    /// Wake every thread waiting for one of the filesystem locks with
    /// [`FsError::Interrupted`].
    pub fn interrupt(&self) {
        self.dirs.interrupt();
        self.data.interrupt();
        self.istore.interrupt();
        self.sbm.interrupt();
    }
}

impl Drop for SimpleFs {
    fn drop(&mut self) {
        info!("simplefs unmounted");
    }
}

/// An open regular file.
pub struct File<'a> {
    fs: &'a SimpleFs,
    ino: u64,
    pos: u64,
}

impl File<'_> {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.fs.inode(self.ino)?.size())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl io::Read for File<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.fs.read_at(self.ino, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl io::Write for File<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.fs.write_at(self.ino, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for File<'_> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(off) => Some(off),
            io::SeekFrom::End(delta) => self.len()?.checked_add_signed(delta),
            io::SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        self.pos = target.ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        Ok(self.pos)
    }
}
