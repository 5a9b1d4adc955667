//! On-disk records. Every record is encoded with bincode's fixed-int,
//! little-endian layout, so the serialized size equals the sum of the
//! field widths.

use super::*;
use bitmap::Bitmap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlock {
    /// Must be SIMPLEFS_MAGIC
    pub magic: u64,
    pub version: u64,
    /// Must be BSIZE
    pub block_size: u64,
    /// Number of live inodes, root included
    pub inodes_count: u64,
    /// Busy map of the blocks of the image
    pub free_blocks: Bitmap,
    /// Object capacity chosen at format time
    pub capacity: u64,
}

impl SuperBlock {
    /// Superblock of a freshly formatted image holding only the root directory.
    pub fn new(capacity: u64) -> Self {
        let mut free_blocks = Bitmap::default();
        for bno in [SUPERBLOCK_BLOCK, INODESTORE_BLOCK, ROOTDIR_DATABLOCK] {
            free_blocks.set(bno as usize);
        }
        Self {
            magic: SIMPLEFS_MAGIC,
            version: SIMPLEFS_VERSION,
            block_size: BSIZE as u64,
            inodes_count: 1,
            free_blocks,
            capacity,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != SIMPLEFS_MAGIC {
            return Err(FsError::BadMagic(self.magic));
        }
        if self.block_size != BSIZE as u64 {
            return Err(FsError::BadBlockSize(self.block_size));
        }
        if self.version != SIMPLEFS_VERSION {
            return Err(FsError::Corrupt(format!(
                "unsupported format version {}",
                self.version
            )));
        }
        if self.capacity < 2 || self.capacity > MAX_OBJECTS {
            return Err(FsError::Corrupt(format!(
                "object capacity {} out of range",
                self.capacity
            )));
        }
        Ok(())
    }

    /// Blocks the allocator may hand out.
    pub fn data_blocks(&self) -> std::ops::Range<u64> {
        FIRST_DATA_BLOCK..fs_blocks(self.capacity)
    }
}

/// inode on disk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DInode {
    /// File type and permission bits
    pub mode: u32,
    _reserved: u32,
    /// 0 marks a free slot
    pub inode_no: u64,
    pub data_block_number: u64,
    /// children count of a directory, byte size of a regular file
    pub size_or_children: u64,
}

impl DInode {
    pub fn new(mode: u32, inode_no: u64, data_block_number: u64, size_or_children: u64) -> Self {
        Self {
            mode,
            _reserved: 0,
            inode_no,
            data_block_number,
            size_or_children,
        }
    }

    /// Byte offset of inode `ino` inside the inode store block.
    pub fn offset(ino: u64) -> usize {
        (ino as usize - 1) * INODE_SIZE
    }
}

/// Directory is a data block containing a sequence of dir records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirRecord {
    name: [u8; DIRSIZ],
    /// 0 marks an empty slot
    pub inode_no: u64,
}

impl DirRecord {
    pub fn new(name: &str, inode_no: u64) -> Result<Self> {
        check_name(name)?;
        let mut buf = [0u8; DIRSIZ];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self {
            name: buf,
            inode_no,
        })
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn is_free(&self) -> bool {
        self.inode_no == 0
    }

    /// Byte offset of slot `index` inside a directory block.
    pub fn offset(index: usize) -> usize {
        index * DIRENT_SIZE
    }
}

/// Names are stored in a fixed field; reject what would not round-trip.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(FsError::InvalidArgument(format!("bad file name {name:?}")));
    }
    if name.len() > FILENAME_MAXLEN {
        return Err(FsError::NameTooLong(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_layout() {
        let sb = SuperBlock::new(MAX_OBJECTS);
        assert_eq!(bincode::serialized_size(&sb).unwrap(), 56);
        assert_eq!(
            bincode::serialized_size(&DInode::default()).unwrap() as usize,
            INODE_SIZE
        );
        assert_eq!(
            bincode::serialized_size(&DirRecord::default()).unwrap() as usize,
            DIRENT_SIZE
        );
        assert_eq!(DPB, 102);
        assert_eq!(IPB, 128);
    }

    #[test]
    fn superblock_layout_is_little_endian() {
        let bytes = bincode::serialize(&SuperBlock::new(32)).unwrap();
        assert_eq!(&bytes[0..8], &SIMPLEFS_MAGIC.to_le_bytes());
        assert_eq!(&bytes[16..24], &(BSIZE as u64).to_le_bytes());
        // reserved blocks 0, 1, 2 busy
        assert_eq!(bytes[32], 0b111);
    }

    #[test]
    fn fresh_superblock_validates() {
        let sb = SuperBlock::new(32);
        sb.validate().unwrap();
        assert_eq!(sb.data_blocks(), 3..34);

        let mut bad = sb.clone();
        bad.magic = 1;
        assert!(matches!(bad.validate(), Err(FsError::BadMagic(1))));
        let mut bad = sb;
        bad.block_size = 512;
        assert!(matches!(bad.validate(), Err(FsError::BadBlockSize(512))));
    }

    #[test]
    fn dir_record_names() {
        let rec = DirRecord::new("hello", 7).unwrap();
        assert_eq!(rec.name(), "hello");
        assert!(!rec.is_free());
        assert!(DirRecord::default().is_free());

        let longest = "x".repeat(FILENAME_MAXLEN);
        assert_eq!(DirRecord::new(&longest, 2).unwrap().name(), longest);
        assert!(matches!(
            DirRecord::new(&"x".repeat(FILENAME_MAXLEN + 1), 2),
            Err(FsError::NameTooLong(_))
        ));
        assert!(matches!(DirRecord::new("a/b", 2), Err(FsError::InvalidArgument(_))));
        assert!(matches!(DirRecord::new("", 2), Err(FsError::InvalidArgument(_))));
    }
}
