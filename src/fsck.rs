//! Offline-style consistency check and repair.
//!
//! Create persists the inode before linking it and nothing is rolled back
//! after a failed step, so an interrupted operation can leave an orphan
//! inode or a dangling record behind. The check walks the tree from the
//! root and compares it with the inode store and the superblock.

use super::*;
use bitmap::Bitmap;
use disk::DirRecord;
use inode::{Inode, InodeBody};
use simplefs::SimpleFs;

use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dangling {
    pub dir: u64,
    pub index: usize,
    pub name: String,
    pub ino: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// live inodes no directory record leads to
    pub orphan_inodes: Vec<u64>,
    /// records naming an inode that is not in the store
    pub dangling: Vec<Dangling>,
    /// busy data blocks no reachable inode owns
    pub leaked_blocks: Vec<u64>,
    /// blocks owned by a reachable inode but marked free
    pub unmarked_blocks: Vec<u64>,
    /// `(recorded, actual)` live object count
    pub count_mismatch: Option<(u64, u64)>,
    /// `(directory, recorded, actual)` child counts
    pub children_mismatch: Vec<(u64, u64, u64)>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        *self == CheckReport::default()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return writeln!(f, "clean");
        }
        for ino in &self.orphan_inodes {
            writeln!(f, "orphan inode {ino}")?;
        }
        for d in &self.dangling {
            writeln!(
                f,
                "directory {} slot {}: {} points at missing inode {}",
                d.dir, d.index, d.name, d.ino
            )?;
        }
        for bno in &self.leaked_blocks {
            writeln!(f, "block {bno} is busy but unused")?;
        }
        for bno in &self.unmarked_blocks {
            writeln!(f, "block {bno} is in use but marked free")?;
        }
        if let Some((recorded, actual)) = self.count_mismatch {
            writeln!(f, "superblock counts {recorded} objects, store holds {actual}")?;
        }
        for (dir, recorded, actual) in &self.children_mismatch {
            writeln!(f, "directory {dir} counts {recorded} children, has {actual}")?;
        }
        Ok(())
    }
}

/// What the walk from the root found.
struct Scan {
    report: CheckReport,
    live: BTreeMap<u64, Inode>,
    reachable: BTreeSet<u64>,
    /// actual child count of every reachable directory
    children: BTreeMap<u64, u64>,
}

impl SimpleFs {
    fn scan(&self) -> Result<Scan> {
        let sb = self.sbm.lock()?.sb.clone();
        let live: BTreeMap<u64, Inode> = self
            .istore
            .live_inodes()?
            .into_iter()
            .map(|inode| (inode.ino, inode))
            .collect();
        let mut report = CheckReport::default();
        let mut reachable = BTreeSet::from([ROOTINO]);
        let mut children = BTreeMap::new();

        let mut queue = VecDeque::from([ROOTINO]);
        while let Some(dir_ino) = queue.pop_front() {
            let Some(dir) = live.get(&dir_ino) else {
                continue;
            };
            let buf = self.bcache.bread(dir.data_block)?;
            let mut count = 0;
            for index in 0..DPB {
                let record: DirRecord = buf.get(DirRecord::offset(index))?;
                if record.is_free() {
                    continue;
                }
                let Some(target) = live.get(&record.inode_no) else {
                    report.dangling.push(Dangling {
                        dir: dir_ino,
                        index,
                        name: record.name().to_owned(),
                        ino: record.inode_no,
                    });
                    continue;
                };
                count += 1;
                if reachable.insert(target.ino) && target.is_dir() {
                    queue.push_back(target.ino);
                }
            }
            self.bcache.brelse(buf)?;
            if count != dir.children() {
                report
                    .children_mismatch
                    .push((dir_ino, dir.children(), count));
            }
            children.insert(dir_ino, count);
        }

        report.orphan_inodes = live
            .keys()
            .filter(|ino| !reachable.contains(ino))
            .copied()
            .collect();

        let owned: BTreeSet<u64> = reachable
            .iter()
            .filter_map(|ino| live.get(ino))
            .map(|inode| inode.data_block)
            .collect();
        for bno in sb.data_blocks() {
            let busy = sb.free_blocks.test(bno as usize);
            match (busy, owned.contains(&bno)) {
                (true, false) => report.leaked_blocks.push(bno),
                (false, true) => report.unmarked_blocks.push(bno),
                _ => {}
            }
        }

        let actual = live.len() as u64;
        if sb.inodes_count != actual {
            report.count_mismatch = Some((sb.inodes_count, actual));
        }
        Ok(Scan {
            report,
            live,
            reachable,
            children,
        })
    }

    /// Compare the tree with the inode store and the superblock.
    pub fn check(&self) -> Result<CheckReport> {
        let _dirs = self.dirs.lock()?;
        Ok(self.scan()?.report)
    }

    /// Fix everything [`SimpleFs::check`] reports and return what was found.
    /// Orphans are deleted, dangling records cleared and every counter and
    /// map rebuilt from the reachable tree.
    pub fn repair(&self) -> Result<CheckReport> {
        let mut dirs = self.dirs.lock()?;
        let _data = self.data.lock()?;
        let scan = self.scan()?;
        if scan.report.is_clean() {
            return Ok(scan.report);
        }
        warn!("repairing filesystem:\n{}", scan.report);

        for d in &scan.report.dangling {
            let Some(dir) = scan.live.get(&d.dir) else {
                continue;
            };
            let mut buf = self.bcache.bread(dir.data_block)?;
            buf.put(DirRecord::offset(d.index), &DirRecord::default())?;
            self.bcache.bwrite(&mut buf)?;
            self.bcache.brelse(buf)?;
        }

        for ino in &scan.report.orphan_inodes {
            if let Some(orphan) = scan.live.get(ino) {
                self.istore.remove(&self.sbm, orphan)?;
            }
        }

        for &(dir_ino, _, actual) in &scan.report.children_mismatch {
            if let Some(dir) = scan.live.get(&dir_ino) {
                let mut fixed = dir.clone();
                fixed.body = InodeBody::Dir { children: actual };
                self.istore.save(&self.sbm, &fixed)?;
            }
        }

        let mut info = self.sbm.lock()?;
        let mut free_blocks = Bitmap::default();
        let mut imap = Bitmap::default();
        for bno in [SUPERBLOCK_BLOCK, INODESTORE_BLOCK, ROOTDIR_DATABLOCK] {
            free_blocks.set(bno as usize);
        }
        imap.set(0);
        for inode in scan.reachable.iter().filter_map(|ino| scan.live.get(ino)) {
            imap.set(inode.ino as usize);
            if info.sb.data_blocks().contains(&inode.data_block) {
                free_blocks.set(inode.data_block as usize);
            }
        }
        info.sb.free_blocks = free_blocks;
        info.sb.inodes_count = scan.reachable.len() as u64;
        info.imap = imap;
        self.sbm.sync(&info)?;
        drop(info);

        dirs.clear();
        info!(
            "repair done, {} objects in {} directories",
            scan.reachable.len(),
            scan.children.len()
        );
        Ok(scan.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blk_dev::{BlockDevice, MemDisk};
    use mkfs::{mkfs, MkfsOptions};
    use std::sync::Arc;

    fn mounted() -> (Arc<MemDisk>, SimpleFs) {
        let disk = Arc::new(MemDisk::new(fs_blocks(16)));
        mkfs(disk.as_ref(), &MkfsOptions { capacity: 16 }).unwrap();
        let fs = SimpleFs::mount(disk.clone()).unwrap();
        (disk, fs)
    }

    fn put_record(disk: &MemDisk, bno: u64, index: usize, record: &DirRecord) {
        let mut block = disk.block(bno);
        bincode::serialize_into(&mut block[DirRecord::offset(index)..], record).unwrap();
        disk.write_block(bno, &block).unwrap();
    }

    #[test]
    fn fresh_and_busy_images_are_clean() {
        let (_, fs) = mounted();
        assert!(fs.check().unwrap().is_clean());
        let d = fs.mkdir(ROOTINO, "d", 0o755).unwrap();
        fs.create_file(d.ino, "f", 0o644).unwrap();
        fs.create_file(ROOTINO, "g", 0o644).unwrap();
        fs.delete(ROOTINO, "g").unwrap();
        let report = fs.check().unwrap();
        assert!(report.is_clean(), "{report}");
    }

    #[test]
    fn unlinked_inode_is_an_orphan() {
        let (_, fs) = mounted();
        let bno = fs.sbm.alloc_block().unwrap();
        let stray = Inode::new(2, S_IFREG | 0o644, bno).unwrap();
        fs.istore.insert(&fs.sbm, &stray).unwrap();

        let report = fs.check().unwrap();
        assert_eq!(report.orphan_inodes, vec![2]);
        assert_eq!(report.leaked_blocks, vec![bno]);
        assert_eq!(report.count_mismatch, None);

        assert_eq!(fs.repair().unwrap(), report);
        assert!(fs.check().unwrap().is_clean());
        assert_eq!(fs.statfs().unwrap().objects, 1);
        assert_eq!(fs.create_file(ROOTINO, "a", 0o644).unwrap().ino, 2);
    }

    #[test]
    fn record_without_inode_is_dangling() {
        let (disk, fs) = mounted();
        put_record(&disk, ROOTDIR_DATABLOCK, 4, &DirRecord::new("ghost", 9).unwrap());

        let report = fs.check().unwrap();
        assert_eq!(
            report.dangling,
            vec![Dangling {
                dir: ROOTINO,
                index: 4,
                name: "ghost".into(),
                ino: 9,
            }]
        );
        fs.repair().unwrap();
        assert!(fs.check().unwrap().is_clean());
        assert!(fs.list(ROOTINO).unwrap().is_empty());
    }

    #[test]
    fn counters_are_rebuilt() {
        let (_, fs) = mounted();
        fs.create_file(ROOTINO, "a", 0o644).unwrap();
        {
            let mut info = fs.sbm.lock().unwrap();
            info.sb.inodes_count = 7;
            info.sb.free_blocks.set(10);
            info.sb.free_blocks.clear(3);
            fs.sbm.sync(&info).unwrap();
        }
        let mut root = fs.root().unwrap();
        root.body = InodeBody::Dir { children: 5 };
        fs.istore.save(&fs.sbm, &root).unwrap();

        let report = fs.check().unwrap();
        assert_eq!(report.count_mismatch, Some((7, 2)));
        assert_eq!(report.leaked_blocks, vec![10]);
        assert_eq!(report.unmarked_blocks, vec![3]);
        assert_eq!(report.children_mismatch, vec![(ROOTINO, 5, 1)]);
        assert!(report.to_string().contains("block 10 is busy but unused"));

        fs.repair().unwrap();
        assert!(fs.check().unwrap().is_clean());
        assert_eq!(fs.root().unwrap().children(), 1);
        let stats = fs.statfs().unwrap();
        assert_eq!(stats.objects, 2);
        // blocks 0..=3 busy
        assert_eq!(stats.free_blocks, stats.total_blocks - 4);
    }
}
