//! Error type shared by every layer of the filesystem.

use libc::c_int;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    /// No free inode number, data block or directory slot.
    #[error("no space left on device")]
    OutOfSpace,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A lock wait was aborted by [`crate::SimpleFs::interrupt`]. Retry.
    #[error("interrupted while waiting for the {0} lock")]
    Interrupted(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry already exists: {0}")]
    Exists(String),

    #[error("not a directory: inode {0}")]
    NotADirectory(u64),

    #[error("is a directory: inode {0}")]
    IsADirectory(u64),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("file name too long: {0}")]
    NameTooLong(String),

    /// Files never grow past their single data block.
    #[error("offset {0} is beyond the single data block")]
    FileTooLarge(u64),

    #[error("bad magic number {0:#x}, not a simplefs image")]
    BadMagic(u64),

    #[error("image formatted with unsupported block size {0}")]
    BadBlockSize(u64),

    #[error("corrupt filesystem: {0}")]
    Corrupt(String),

    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn errno(&self) -> c_int {
        match self {
            FsError::OutOfSpace => libc::ENOSPC,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::Interrupted(_) => libc::EINTR,
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Exists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::NameTooLong(_) => libc::ENAMETOOLONG,
            FsError::FileTooLarge(_) => libc::EFBIG,
            FsError::Io(_)
            | FsError::BadMagic(_)
            | FsError::BadBlockSize(_)
            | FsError::Corrupt(_)
            | FsError::Codec(_) => libc::EIO,
        }
    }

    /// Only an interrupted lock wait leaves nothing behind and may be retried as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::Interrupted(_))
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Io(e) => e,
            other => std::io::Error::from_raw_os_error(other.errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::OutOfSpace.errno(), libc::ENOSPC);
        assert_eq!(FsError::Interrupted("superblock").errno(), libc::EINTR);
        assert_eq!(FsError::NotFound("a".into()).errno(), libc::ENOENT);
        assert_eq!(FsError::Corrupt("x".into()).errno(), libc::EIO);
    }

    #[test]
    fn only_interrupted_is_retryable() {
        assert!(FsError::Interrupted("inode").is_retryable());
        assert!(!FsError::OutOfSpace.is_retryable());
        let io: FsError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(!io.is_retryable());
        assert!(io.to_string().contains("I/O error"));
    }

    #[test]
    fn converts_to_os_error() {
        let io: std::io::Error = FsError::FileTooLarge(4096).into();
        assert_eq!(io.raw_os_error(), Some(libc::EFBIG));
    }
}
