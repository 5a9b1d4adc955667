//! In-memory index over a directory's record block.
//!
//! Each directory gets a [`DirCache`] the first time it is searched or
//! listed. The cache holds one slot per record of the block, split into
//! a used set ordered by slot index and a free list. Once built it is the
//! authority for lookups and listings; the block on disk is only written,
//! never re-read, until the cache is dropped.

use super::*;
use buf::{BufCache, Buffer};
use disk::DirRecord;
use inode::Inode;

use log::debug;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, VecDeque};

pub struct DirCache {
    /// one record per slot of the block, indexed by entry index
    slots: Vec<DirRecord>,
    used: BTreeSet<usize>,
    free: VecDeque<usize>,
    children: u64,
}

impl DirCache {
    /// Scan every slot of a directory block, occupied ones become used entries.
    pub fn build(buf: &Buffer) -> Result<Self> {
        let mut cache = DirCache {
            slots: Vec::with_capacity(DPB),
            used: BTreeSet::new(),
            free: VecDeque::new(),
            children: 0,
        };
        for index in 0..DPB {
            let record: DirRecord = buf.get(DirRecord::offset(index))?;
            if record.is_free() {
                cache.free.push_back(index);
            } else {
                cache.used.insert(index);
                cache.children += 1;
            }
            cache.slots.push(record);
        }
        Ok(cache)
    }

    pub fn children(&self) -> u64 {
        self.children
    }

    /// Used entry called `name`, if any.
    pub fn lookup(&self, name: &str) -> Option<(usize, &DirRecord)> {
        self.used
            .iter()
            .map(|&index| (index, &self.slots[index]))
            .find(|(_, record)| record.name() == name)
    }

    /// Head of the free list. The slot stays free until [`DirCache::insert_used`].
    pub fn free_slot(&self) -> Option<usize> {
        self.free.front().copied()
    }

    /// Put `record` in slot `index` and file it among the used entries.
    pub fn insert_used(&mut self, index: usize, record: DirRecord) {
        if let Some(pos) = self.free.iter().position(|&i| i == index) {
            self.free.remove(pos);
            self.children += 1;
        } else if !self.used.contains(&index) {
            self.children += 1;
        }
        self.slots[index] = record;
        self.used.insert(index);
    }

    /// Move a used entry back to the head of the free list.
    pub fn release(&mut self, index: usize) -> Option<DirRecord> {
        if !self.used.remove(&index) {
            return None;
        }
        let record = std::mem::take(&mut self.slots[index]);
        self.free.push_front(index);
        self.children -= 1;
        Some(record)
    }

    /// Used entries in ascending entry index order.
    pub fn used(&self) -> impl Iterator<Item = (usize, &DirRecord)> + '_ {
        self.used.iter().map(|&index| (index, &self.slots[index]))
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// Caches of every directory touched so far, keyed by inode number.
#[derive(Default)]
pub struct DirCacheTable {
    caches: HashMap<u64, DirCache>,
}

impl DirCacheTable {
    pub fn get_or_build(&mut self, bcache: &BufCache, dir: &Inode) -> Result<&mut DirCache> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(dir.ino));
        }
        match self.caches.entry(dir.ino) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                debug!("building cache for directory {}", dir.ino);
                let buf = bcache.bread(dir.data_block)?;
                let cache = DirCache::build(&buf)?;
                bcache.brelse(buf)?;
                Ok(entry.insert(cache))
            }
        }
    }

    pub fn get(&self, ino: u64) -> Option<&DirCache> {
        self.caches.get(&ino)
    }

    /// Drop the cache of one directory, its entries go with it.
    pub fn release(&mut self, ino: u64) -> bool {
        let dropped = self.caches.remove(&ino).is_some();
        if dropped {
            debug!("released cache of directory {ino}");
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.caches.clear();
    }
}
