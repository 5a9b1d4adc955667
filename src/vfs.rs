//! FUSE front end. Inode numbers are handed to the kernel unchanged, the
//! root directory is inode 1 on both sides.

use super::*;
use fs::FsStats;
use inode::Inode;
use simplefs::SimpleFs;

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const TTL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Default)]
pub struct MountConfig {
    pub auto_unmount: bool,
    pub read_only: bool,
}

impl MountConfig {
    fn options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName("simplefs".to_string()),
            MountOption::DefaultPermissions,
        ];
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
            options.push(MountOption::AllowRoot);
        }
        if self.read_only {
            options.push(MountOption::RO);
        } else {
            options.push(MountOption::RW);
        }
        options
    }
}

pub struct SimpleFuse {
    fs: Arc<SimpleFs>,
}

impl SimpleFuse {
    pub fn new(fs: Arc<SimpleFs>) -> Self {
        Self { fs }
    }
}

/// Serve `fs` at `mountpoint` until it is unmounted.
pub fn mount(fs: SimpleFs, mountpoint: impl AsRef<Path>, config: &MountConfig) -> Result<()> {
    let mountpoint = mountpoint.as_ref();
    info!("mounting simplefs at {}", mountpoint.display());
    fuser::mount2(
        SimpleFuse::new(Arc::new(fs)),
        mountpoint,
        &config.options(),
    )?;
    Ok(())
}

fn name_str(name: &OsStr) -> Result<&str> {
    name.to_str()
        .ok_or_else(|| FsError::InvalidArgument(format!("{name:?} is not valid UTF-8")))
}

/// Permission bits left after applying `umask`.
fn perm(mode: u32, umask: u32) -> u32 {
    mode & !umask & 0o7777
}

fn errno(op: &str, err: FsError) -> c_int {
    match err {
        FsError::NotFound(_) | FsError::Exists(_) | FsError::Interrupted(_) => {
            debug!("{op}: {err}")
        }
        _ => warn!("{op}: {err}"),
    }
    err.errno()
}

/// Objects that can still be created; a damaged superblock may count more
/// than the capacity.
fn free_objects(stats: &FsStats) -> u64 {
    stats.capacity.saturating_sub(stats.objects)
}

fn attr(inode: &Inode) -> FileAttr {
    FileAttr::from(inode)
}

impl Filesystem for SimpleFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let res = name_str(name).and_then(|name| self.fs.lookup(parent, name));
        match res {
            Ok(Some(inode)) => reply.entry(&TTL, &attr(&inode), 0),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(errno("lookup", e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.fs.inode(ino) {
            Ok(inode) => reply.attr(&TTL, &attr(&inode)),
            Err(e) => reply.error(errno("getattr", e)),
        }
    }

    /// Only the size can be changed, everything else is reported back as is.
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let res = match size {
            Some(size) => self.fs.truncate(ino, size),
            None => self.fs.inode(ino),
        };
        match res {
            Ok(inode) => reply.attr(&TTL, &attr(&inode)),
            Err(e) => reply.error(errno("setattr", e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if offset != 0 {
            // the whole listing went out on the first call
            reply.ok();
            return;
        }
        let entries = match self.fs.readdir(ino, 0) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno("readdir", e));
                return;
            }
        };
        if reply.add(ino, 1, FileType::Directory, ".") || reply.add(ino, 2, FileType::Directory, "..") {
            reply.ok();
            return;
        }
        for (i, entry) in entries.enumerate() {
            if reply.add(entry.ino, i as i64 + 3, entry.kind.into(), &entry.name) {
                warn!("readdir of {ino} did not fit in one reply");
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.fs.release_dir(ino) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(errno("releasedir", e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let res = name_str(name).and_then(|name| self.fs.mkdir(parent, name, perm(mode, umask)));
        match res {
            Ok(inode) => reply.entry(&TTL, &attr(&inode), 0),
            Err(e) => reply.error(errno("mkdir", e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if mode & S_IFMT != S_IFREG {
            reply.error(libc::EINVAL);
            return;
        }
        let res =
            name_str(name).and_then(|name| self.fs.create_file(parent, name, perm(mode, umask)));
        match res {
            Ok(inode) => reply.entry(&TTL, &attr(&inode), 0),
            Err(e) => reply.error(errno("mknod", e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let res =
            name_str(name).and_then(|name| self.fs.create_file(parent, name, perm(mode, umask)));
        match res {
            Ok(inode) => reply.created(&TTL, &attr(&inode), 0, 0, 0),
            Err(e) => reply.error(errno("create", e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let res = name_str(name).and_then(|name| self.fs.unlink(parent, name));
        match res {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let res = name_str(name).and_then(|name| self.fs.rmdir(parent, name));
        match res {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let mut buf = vec![0u8; (size as usize).min(BSIZE)];
        match self.fs.read_at(ino, offset as u64, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno("read", e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.write_at(ino, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(stats) => reply.statfs(
                stats.total_blocks,
                stats.free_blocks,
                stats.free_blocks,
                stats.capacity,
                free_objects(&stats),
                BSIZE as u32,
                FILENAME_MAXLEN as u32,
                BSIZE as u32,
            ),
            Err(e) => reply.error(errno("statfs", e)),
        }
    }

    fn destroy(&mut self) {
        // wake anything still queued on a lock before the instance goes away
        self.fs.interrupt();
        info!("filesystem session ended");
    }
}
