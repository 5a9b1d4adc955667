use super::*;
use buf::{BufCache, Buffer};
use disk::DInode;
use fs::SuperManager;
use sleeplock::SleepLock;

use libc::{getgid, getuid};
use log::{debug, error, warn};
use std::time::UNIX_EPOCH;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    File,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFDIR => Some(FileKind::Directory),
            S_IFREG => Some(FileKind::File),
            _ => None,
        }
    }
}

impl From<FileKind> for fuser::FileType {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::File => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
        }
    }
}

/// What the last word of an inode record means depends on its type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeBody {
    Dir { children: u64 },
    File { size: u64 },
}

/// Transient copy of an on-disk inode. Changes reach the disk only through
/// [`InodeStore::save`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inode {
    pub ino: u64,
    /// type and permission bits, permissions are stored but never enforced
    pub mode: u32,
    pub data_block: u64,
    pub body: InodeBody,
}

impl Inode {
    /// A fresh, empty object. Only directories and regular files exist here.
    pub fn new(ino: u64, mode: u32, data_block: u64) -> Result<Self> {
        let body = match FileKind::from_mode(mode) {
            Some(FileKind::Directory) => InodeBody::Dir { children: 0 },
            Some(FileKind::File) => InodeBody::File { size: 0 },
            None => {
                return Err(FsError::InvalidArgument(format!(
                    "mode {mode:#o} is neither a file nor a directory"
                )))
            }
        };
        Ok(Self {
            ino,
            mode,
            data_block,
            body,
        })
    }

    pub fn kind(&self) -> FileKind {
        match self.body {
            InodeBody::Dir { .. } => FileKind::Directory,
            InodeBody::File { .. } => FileKind::File,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// Byte size of a file; directories always report one block.
    pub fn size(&self) -> u64 {
        match self.body {
            InodeBody::Dir { .. } => BSIZE as u64,
            InodeBody::File { size } => size,
        }
    }

    pub fn children(&self) -> u64 {
        match self.body {
            InodeBody::Dir { children } => children,
            InodeBody::File { .. } => 0,
        }
    }
}

impl TryFrom<&DInode> for Inode {
    type Error = FsError;

    fn try_from(dinode: &DInode) -> Result<Self> {
        let body = match FileKind::from_mode(dinode.mode) {
            Some(FileKind::Directory) => InodeBody::Dir {
                children: dinode.size_or_children,
            },
            Some(FileKind::File) => InodeBody::File {
                size: dinode.size_or_children,
            },
            None => {
                return Err(FsError::Corrupt(format!(
                    "inode {} has unknown mode {:#o}",
                    dinode.inode_no, dinode.mode
                )))
            }
        };
        Ok(Self {
            ino: dinode.inode_no,
            mode: dinode.mode,
            data_block: dinode.data_block_number,
            body,
        })
    }
}

impl From<&Inode> for DInode {
    fn from(inode: &Inode) -> Self {
        let word = match inode.body {
            InodeBody::Dir { children } => children,
            InodeBody::File { size } => size,
        };
        DInode::new(inode.mode, inode.ino, inode.data_block, word)
    }
}

impl From<&Inode> for fuser::FileAttr {
    fn from(value: &Inode) -> Self {
        let uid = unsafe { getuid() };
        let gid = unsafe { getgid() };
        fuser::FileAttr {
            ino: value.ino,
            size: value.size(),
            // 512-byte units, every object owns exactly one block
            blocks: (BSIZE / 512) as u64,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: value.kind().into(),
            perm: (value.mode & 0o7777) as u16,
            nlink: if value.is_dir() { 2 } else { 1 },
            uid,
            gid,
            rdev: 0,
            blksize: BSIZE as u32,
            flags: 0,
        }
    }
}

fn check_ino(ino: u64) -> Result<()> {
    if ino == 0 || ino as usize > IPB {
        return Err(FsError::InvalidArgument(format!("bad inode number {ino}")));
    }
    Ok(())
}

/// Slot of `ino` in the inode store. Bounded linear scan over every slot a
/// block holds, the way records were located since the first format.
fn search(buf: &Buffer, ino: u64) -> Result<Option<usize>> {
    if ino == 0 {
        return Ok(None);
    }
    for slot in 0..IPB {
        let dinode: DInode = buf.get(slot * INODE_SIZE)?;
        if dinode.inode_no == ino {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

/// The inode store block. Mutations take the inode lock for the whole
/// operation and the superblock lock inside it, never the other way round.
pub struct InodeStore {
    bcache: BufCache,
    lock: SleepLock<()>,
}

impl InodeStore {
    pub fn new(bcache: BufCache) -> Self {
        Self {
            bcache,
            lock: SleepLock::new("inode", ()),
        }
    }

    pub fn interrupt(&self) {
        self.lock.interrupt();
    }

    /// Write a new inode into its slot, count it and mark its number used.
    pub fn insert(&self, sbm: &SuperManager, inode: &Inode) -> Result<()> {
        check_ino(inode.ino)?;
        let _guard = self.lock.lock()?;
        let mut buf = self.bcache.bread(INODESTORE_BLOCK)?;
        let offset = DInode::offset(inode.ino);
        let old: DInode = buf.get(offset)?;
        if old.inode_no != 0 {
            error!("inode slot {} already holds inode {}", inode.ino, old.inode_no);
            return Err(FsError::Corrupt(format!("inode {} already in use", inode.ino)));
        }
        let mut info = sbm.lock()?;
        buf.put(offset, &DInode::from(inode))?;
        self.bcache.bwrite(&mut buf)?;

        info.sb.inodes_count += 1;
        info.imap.set(inode.ino as usize);
        if let Err(e) = sbm.sync(&info) {
            info.sb.inodes_count -= 1;
            info.imap.clear(inode.ino as usize);
            drop(info);
            self.restore(buf, offset, &old);
            return Err(e);
        }
        drop(info);

        self.bcache.brelse(buf)?;
        debug!("inode {} added", inode.ino);
        Ok(())
    }

    /// Zero the slot of `inode`, uncount it and release its number.
    pub fn remove(&self, sbm: &SuperManager, inode: &Inode) -> Result<()> {
        check_ino(inode.ino)?;
        let _guard = self.lock.lock()?;
        let mut buf = self.bcache.bread(INODESTORE_BLOCK)?;
        let offset = DInode::offset(inode.ino);
        let old: DInode = buf.get(offset)?;
        if old.inode_no != inode.ino {
            error!("inode {} is not in the store", inode.ino);
            return Err(FsError::NotFound(format!("inode {}", inode.ino)));
        }
        let mut info = sbm.lock()?;
        buf.put(offset, &DInode::default())?;
        self.bcache.bwrite(&mut buf)?;

        let count = info.sb.inodes_count;
        info.sb.inodes_count = count.saturating_sub(1);
        info.imap.clear(inode.ino as usize);
        if let Err(e) = sbm.sync(&info) {
            info.sb.inodes_count = count;
            info.imap.set(inode.ino as usize);
            drop(info);
            self.restore(buf, offset, &old);
            return Err(e);
        }
        drop(info);

        self.bcache.brelse(buf)?;
        debug!("inode {} deleted", inode.ino);
        Ok(())
    }

    /// Put `old` back into its slot after the superblock could not follow.
    fn restore(&self, mut buf: Buffer, offset: usize, old: &DInode) {
        let res = buf.put(offset, old).and_then(|_| self.bcache.bwrite(&mut buf));
        if let Err(e) = res {
            warn!("inode slot at offset {offset} left inconsistent: {e}");
        }
    }

    pub fn find(&self, ino: u64) -> Result<Option<Inode>> {
        let _guard = self.lock.lock()?;
        let buf = self.bcache.bread(INODESTORE_BLOCK)?;
        let found = match search(&buf, ino)? {
            Some(slot) => Some(Inode::try_from(&buf.get::<DInode>(slot * INODE_SIZE)?)?),
            None => None,
        };
        self.bcache.brelse(buf)?;
        Ok(found)
    }

    /// Like [`InodeStore::find`] but a missing inode is an error.
    pub fn get(&self, ino: u64) -> Result<Inode> {
        self.find(ino)?
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    /// Overwrite the record of an inode that is already in the store.
    pub fn save(&self, sbm: &SuperManager, inode: &Inode) -> Result<()> {
        let _guard = self.lock.lock()?;
        let mut buf = self.bcache.bread(INODESTORE_BLOCK)?;
        let _info = sbm.lock()?;
        let Some(slot) = search(&buf, inode.ino)? else {
            error!("inode {} could not be saved, it is not in the store", inode.ino);
            return Err(FsError::NotFound(format!("inode {}", inode.ino)));
        };
        buf.put(slot * INODE_SIZE, &DInode::from(inode))?;
        self.bcache.bwrite(&mut buf)?;
        self.bcache.brelse(buf)?;
        debug!("inode {} updated", inode.ino);
        Ok(())
    }

    /// Every inode currently in the store, in slot order.
    pub fn live_inodes(&self) -> Result<Vec<Inode>> {
        let _guard = self.lock.lock()?;
        let buf = self.bcache.bread(INODESTORE_BLOCK)?;
        let mut live = Vec::new();
        for slot in 0..IPB {
            let dinode: DInode = buf.get(slot * INODE_SIZE)?;
            if dinode.inode_no != 0 {
                live.push(Inode::try_from(&dinode)?);
            }
        }
        self.bcache.brelse(buf)?;
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blk_dev::MemDisk;
    use fs::readsb;
    use mkfs::{mkfs, MkfsOptions};
    use std::sync::Arc;

    fn store() -> (Arc<MemDisk>, SuperManager, InodeStore) {
        let disk = Arc::new(MemDisk::new(fs_blocks(16)));
        mkfs(disk.as_ref(), &MkfsOptions { capacity: 16 }).unwrap();
        let bcache = BufCache::new(disk.clone());
        let sbm = SuperManager::load(bcache.clone()).unwrap();
        (disk, sbm, InodeStore::new(bcache))
    }

    #[test]
    fn root_is_found() {
        let (_, _, istore) = store();
        let root = istore.get(ROOTINO).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.data_block, ROOTDIR_DATABLOCK);
        assert_eq!(root.children(), 0);
        assert!(istore.find(5).unwrap().is_none());
        assert!(istore.find(0).unwrap().is_none());
    }

    #[test]
    fn insert_counts_and_persists() {
        let (disk, sbm, istore) = store();
        let inode = Inode::new(2, S_IFREG | 0o644, 3).unwrap();
        istore.insert(&sbm, &inode).unwrap();

        assert_eq!(istore.get(2).unwrap(), inode);
        assert_eq!(sbm.object_count().unwrap(), 2);
        assert_eq!(sbm.free_ino().unwrap(), 3);
        assert_eq!(readsb(&BufCache::new(disk)).unwrap().inodes_count, 2);
    }

    #[test]
    fn remove_zeroes_slot() {
        let (disk, sbm, istore) = store();
        let inode = Inode::new(2, S_IFDIR | 0o755, 3).unwrap();
        istore.insert(&sbm, &inode).unwrap();
        istore.remove(&sbm, &inode).unwrap();

        assert!(istore.find(2).unwrap().is_none());
        assert_eq!(sbm.object_count().unwrap(), 1);
        assert_eq!(sbm.free_ino().unwrap(), 2);
        let block = disk.block(INODESTORE_BLOCK);
        assert!(block[INODE_SIZE..2 * INODE_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn failed_slot_write_leaves_counters_alone() {
        let (disk, sbm, istore) = store();
        let inode = Inode::new(2, S_IFREG | 0o644, 3).unwrap();
        disk.set_fail_block(Some(INODESTORE_BLOCK));
        assert!(matches!(istore.insert(&sbm, &inode), Err(FsError::Io(_))));
        assert_eq!(sbm.object_count().unwrap(), 1);
        assert_eq!(sbm.free_ino().unwrap(), 2);
        assert!(istore.find(2).unwrap().is_none());

        disk.set_fail_block(None);
        istore.insert(&sbm, &inode).unwrap();
        disk.set_fail_block(Some(INODESTORE_BLOCK));
        assert!(matches!(istore.remove(&sbm, &inode), Err(FsError::Io(_))));
        assert_eq!(sbm.object_count().unwrap(), 2);
        assert_eq!(sbm.free_ino().unwrap(), 3);
        assert_eq!(istore.get(2).unwrap(), inode);
    }

    #[test]
    fn failed_superblock_sync_restores_slot() {
        let (disk, sbm, istore) = store();
        let inode = Inode::new(2, S_IFREG | 0o644, 3).unwrap();
        disk.set_fail_block(Some(SUPERBLOCK_BLOCK));
        assert!(matches!(istore.insert(&sbm, &inode), Err(FsError::Io(_))));
        assert_eq!(sbm.object_count().unwrap(), 1);
        assert_eq!(sbm.free_ino().unwrap(), 2);
        assert!(istore.find(2).unwrap().is_none());

        disk.set_fail_block(None);
        istore.insert(&sbm, &inode).unwrap();
        disk.set_fail_block(Some(SUPERBLOCK_BLOCK));
        assert!(matches!(istore.remove(&sbm, &inode), Err(FsError::Io(_))));
        assert_eq!(sbm.object_count().unwrap(), 2);
        assert_eq!(istore.get(2).unwrap(), inode);

        disk.set_fail_block(None);
        istore.remove(&sbm, &inode).unwrap();
        assert_eq!(readsb(&BufCache::new(disk)).unwrap().inodes_count, 1);
    }

    #[test]
    fn save_requires_existing_inode() {
        let (_, sbm, istore) = store();
        let mut inode = Inode::new(4, S_IFREG | 0o644, 3).unwrap();
        assert!(matches!(istore.save(&sbm, &inode), Err(FsError::NotFound(_))));

        istore.insert(&sbm, &inode).unwrap();
        inode.body = InodeBody::File { size: 42 };
        istore.save(&sbm, &inode).unwrap();
        assert_eq!(istore.get(4).unwrap().size(), 42);
        // save does not count
        assert_eq!(sbm.object_count().unwrap(), 2);
    }

    #[test]
    fn double_insert_is_rejected() {
        let (_, sbm, istore) = store();
        let inode = Inode::new(2, S_IFREG | 0o644, 3).unwrap();
        istore.insert(&sbm, &inode).unwrap();
        assert!(matches!(istore.insert(&sbm, &inode), Err(FsError::Corrupt(_))));
        assert_eq!(sbm.object_count().unwrap(), 2);
    }

    #[test]
    fn only_files_and_directories() {
        assert!(matches!(
            Inode::new(2, 0o020644, 3),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn live_inodes_in_slot_order() {
        let (_, sbm, istore) = store();
        for ino in [3, 2] {
            istore
                .insert(&sbm, &Inode::new(ino, S_IFREG | 0o644, ino + 1).unwrap())
                .unwrap();
        }
        let inos: Vec<u64> = istore.live_inodes().unwrap().iter().map(|i| i.ino).collect();
        assert_eq!(inos, vec![1, 2, 3]);
    }
}
