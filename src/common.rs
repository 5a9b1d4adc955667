//! Geometry of a simplefs image.
//!
//! ```text
//! [ super block | inode store | root dir records | data blocks ... ]
//!       0              1              2            3 .. capacity + 2
//! ```

pub const SIMPLEFS_MAGIC: u64 = 0x10032013;

pub const SIMPLEFS_VERSION: u64 = 1;

/// block size
pub const BSIZE: usize = 4096;

pub const SUPERBLOCK_BLOCK: u64 = 0;
pub const INODESTORE_BLOCK: u64 = 1;
pub const ROOTDIR_DATABLOCK: u64 = 2;

/// first block handed out by the allocator
pub const FIRST_DATA_BLOCK: u64 = 3;

/// root i-number
pub const ROOTINO: u64 = 1;

/// Upper bound for the object capacity chosen at format time.
pub const MAX_OBJECTS: u64 = 64;

/// words in the on-disk free block map
pub const BITMAP_WORDS: usize = 2;

/// bits in the on-disk free block map
pub const BITMAP_BITS: usize = BITMAP_WORDS * 64;

/// Bytes reserved for a name inside a directory record.
pub const DIRSIZ: usize = 32;

/// longest accepted file name, one byte is kept for the terminating NUL
pub const FILENAME_MAXLEN: usize = DIRSIZ - 1;

/// on-disk inode record size
pub const INODE_SIZE: usize = 32;

/// inodes per block
pub const IPB: usize = BSIZE / INODE_SIZE;

/// on-disk directory record size
pub const DIRENT_SIZE: usize = DIRSIZ + 8;

/// directory records per block
pub const DPB: usize = BSIZE / DIRENT_SIZE;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

/// Blocks an image formatted for `capacity` objects occupies.
pub const fn fs_blocks(capacity: u64) -> u64 {
    capacity + 2
}
