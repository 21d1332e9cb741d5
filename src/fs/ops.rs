use std::path::{Path, PathBuf};

use rustix::{
    fd::{AsFd, OwnedFd},
    fs::{
        AtFlags, Dir, FileType, Mode, OFlags, RawMode, Stat, Timespec, Timestamps, fstatat,
        linkat, mkdirat, openat, readlinkat, renameat, symlinkat, unlinkat, utimensat,
    },
    io::Errno,
};
use zerocopy::IntoBytes;

use super::{
    GrootFs,
    policy::{project_id, real_mode},
    record::FakeRecord,
    sidecar, wire,
    xattr::{self, read_fake_record, update_fake_record},
};

pub type OpResult = Result<Vec<u8>, i32>;

fn errno(err: Errno) -> i32 {
    err.raw_os_error()
}

fn parent_and_name<'a>(fs: &GrootFs, nodeid: u64, name: &'a str) -> Result<(PathBuf, &'a str), i32> {
    let parent = fs.inodes_path(nodeid).ok_or(libc::ENOENT)?;
    Ok((parent, name))
}

fn join(parent: &Path, name: &str) -> PathBuf {
    if parent.as_os_str().is_empty() {
        PathBuf::from(name)
    } else {
        parent.join(name)
    }
}

fn stat_to_attr(stat: &Stat, claimed: FakeRecord, max_uid: u32, max_gid: u32) -> wire::Attr {
    let file_type_bits = stat.st_mode as u32 & libc::S_IFMT;
    let perm_bits = claimed.mode.unwrap_or(stat.st_mode as u32 & 0o7777);
    let uid = claimed
        .uid
        .unwrap_or_else(|| project_id(stat.st_uid, max_uid));
    let gid = claimed
        .gid
        .unwrap_or_else(|| project_id(stat.st_gid, max_gid));

    wire::Attr {
        ino: stat.st_ino,
        size: stat.st_size as u64,
        blocks: stat.st_blocks as u64,
        atime: stat.st_atime as u64,
        mtime: stat.st_mtime as u64,
        ctime: stat.st_ctime as u64,
        atimensec: stat.st_atime_nsec as u32,
        mtimensec: stat.st_mtime_nsec as u32,
        ctimensec: stat.st_ctime_nsec as u32,
        mode: file_type_bits | perm_bits,
        nlink: stat.st_nlink as u32,
        uid,
        gid,
        rdev: stat.st_rdev as u32,
        blksize: stat.st_blksize as u32,
        padding: 0,
    }
}

fn attr_out(stat: &Stat, claimed: FakeRecord, max_uid: u32, max_gid: u32) -> wire::AttrOut {
    wire::AttrOut {
        attr_valid: 1,
        attr_valid_nsec: 0,
        dummy: 0,
        attr: stat_to_attr(stat, claimed, max_uid, max_gid),
    }
}

fn open_nofollow_path(basefd: impl AsFd, path: &Path) -> rustix::io::Result<OwnedFd> {
    openat(
        basefd,
        path,
        OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )
}

fn record_for(basefd: impl AsFd, path: &Path, is_symlink: bool, dev: u64, ino: u64) -> anyhow::Result<FakeRecord> {
    if is_symlink {
        sidecar::read(basefd, dev, ino)
    } else {
        let pathfd = open_nofollow_path(basefd, path)?;
        read_fake_record(pathfd)
    }
}

impl GrootFs {
    pub fn inodes_path(&self, nodeid: u64) -> Option<PathBuf> {
        self.path_of(nodeid).map(|p| p.to_path_buf())
    }

    pub fn path_of(&self, nodeid: u64) -> Option<&Path> {
        self.inodes.path_of(nodeid)
    }

    pub fn init(&mut self, _req: &wire::InitIn) -> wire::InitOut {
        wire::InitOut {
            major: wire::FUSE_KERNEL_VERSION,
            minor: wire::FUSE_KERNEL_MINOR_VERSION,
            max_readahead: 0,
            flags: 0,
            max_background: 16,
            congestion_threshold: 12,
            max_write: 128 * 1024,
            time_gran: 1,
            max_pages: 0,
            padding: 0,
            unused: [0; 8],
        }
    }

    pub fn lookup(&mut self, parent: u64, name: &str) -> Result<wire::EntryOut, i32> {
        let parent_path = self.inodes_path(parent).ok_or(libc::ENOENT)?;
        let path = join(&parent_path, name);

        let stat = fstatat(&self.basefd, &path, AtFlags::SYMLINK_NOFOLLOW).map_err(errno)?;
        let is_symlink = FileType::from_raw_mode(stat.st_mode as RawMode) == FileType::Symlink;
        let claimed = record_for(&self.basefd, &path, is_symlink, stat.st_dev, stat.st_ino)
            .map_err(|_| libc::EIO)?;

        let nodeid = self.inodes.lookup(&path);
        Ok(wire::EntryOut {
            nodeid,
            generation: 0,
            entry_valid: 1,
            attr_valid: 1,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr: stat_to_attr(&stat, claimed, self.max_uid, self.max_gid),
        })
    }

    pub fn forget(&mut self, nodeid: u64, nlookup: u64) {
        self.inodes.forget(nodeid, nlookup);
    }

    pub fn getattr(&mut self, nodeid: u64) -> Result<wire::AttrOut, i32> {
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        let stat = fstatat(&self.basefd, &path, AtFlags::SYMLINK_NOFOLLOW).map_err(errno)?;
        let is_symlink = FileType::from_raw_mode(stat.st_mode as RawMode) == FileType::Symlink;
        let claimed = record_for(&self.basefd, &path, is_symlink, stat.st_dev, stat.st_ino)
            .map_err(|_| libc::EIO)?;
        Ok(attr_out(&stat, claimed, self.max_uid, self.max_gid))
    }

    // chmod/chown/truncate/utimens all arrive as SETATTR; this follows
    // symlinks, since the kernel already resolved the link before calling.
    pub fn setattr(
        &mut self,
        nodeid: u64,
        valid: u32,
        mode: u32,
        uid: u32,
        gid: u32,
        size: Option<u64>,
        atime: (u64, u32),
        mtime: (u64, u32),
    ) -> Result<wire::AttrOut, i32> {
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;

        if valid & wire::fattr_flags::MODE != 0 {
            let stat = fstatat(&self.basefd, &path, AtFlags::empty()).map_err(errno)?;
            let is_dir = FileType::from_raw_mode(stat.st_mode as RawMode) == FileType::Directory;
            rustix::fs::chmodat(
                &self.basefd,
                &path,
                Mode::from_raw_mode(real_mode(is_dir, mode) as RawMode),
            )
            .map_err(errno)?;

            let pathfd = open_nofollow_path(&self.basefd, &path).map_err(errno)?;
            update_fake_record(&pathfd, FakeRecord::with_mode(mode)).map_err(|_| libc::EIO)?;
        }

        if valid & (wire::fattr_flags::UID | wire::fattr_flags::GID) != 0 {
            let mut update = FakeRecord::default();
            if valid & wire::fattr_flags::UID != 0 {
                update.uid = Some(uid);
            }
            if valid & wire::fattr_flags::GID != 0 {
                update.gid = Some(gid);
            }
            let pathfd = open_nofollow_path(&self.basefd, &path).map_err(errno)?;
            update_fake_record(&pathfd, update).map_err(|_| libc::EIO)?;
        }

        if valid & wire::fattr_flags::SIZE != 0 {
            if let Some(size) = size {
                let fd = openat(&self.basefd, &path, OFlags::WRONLY | OFlags::NOFOLLOW, Mode::empty())
                    .map_err(errno)?;
                rustix::fs::ftruncate(&fd, size).map_err(errno)?;
            }
        }

        if valid & (wire::fattr_flags::ATIME | wire::fattr_flags::MTIME) != 0 {
            let omit = Timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT as _ };
            let times = Timestamps {
                last_access: if valid & wire::fattr_flags::ATIME != 0 {
                    Timespec { tv_sec: atime.0 as i64, tv_nsec: atime.1 as i64 }
                } else {
                    omit
                },
                last_modification: if valid & wire::fattr_flags::MTIME != 0 {
                    Timespec { tv_sec: mtime.0 as i64, tv_nsec: mtime.1 as i64 }
                } else {
                    omit
                },
            };
            utimensat(&self.basefd, &path, &times, AtFlags::empty()).map_err(errno)?;
        }

        let stat = fstatat(&self.basefd, &path, AtFlags::SYMLINK_NOFOLLOW).map_err(errno)?;
        let is_symlink = FileType::from_raw_mode(stat.st_mode as RawMode) == FileType::Symlink;
        let claimed = record_for(&self.basefd, &path, is_symlink, stat.st_dev, stat.st_ino)
            .map_err(|_| libc::EIO)?;
        Ok(attr_out(&stat, claimed, self.max_uid, self.max_gid))
    }

    pub fn mkdir(
        &mut self,
        parent: u64,
        name: &str,
        mode: u32,
        req_uid: u32,
        req_gid: u32,
    ) -> Result<wire::EntryOut, i32> {
        let parent_path = self.inodes_path(parent).ok_or(libc::ENOENT)?;
        let path = join(&parent_path, name);

        mkdirat(&self.basefd, &path, Mode::from_raw_mode(real_mode(true, mode) as RawMode))
            .map_err(errno)?;

        let pathfd = open_nofollow_path(&self.basefd, &path).map_err(errno)?;
        update_fake_record(
            &pathfd,
            FakeRecord {
                uid: Some(req_uid),
                gid: Some(req_gid),
                mode: Some(mode),
            },
        )
        .map_err(|_| libc::EIO)?;

        self.lookup(parent, name)
    }

    pub fn rmdir(&mut self, parent: u64, name: &str) -> Result<(), i32> {
        let (parent_path, name) = parent_and_name(self, parent, name)?;
        let path = join(&parent_path, name);
        unlinkat(&self.basefd, &path, AtFlags::REMOVEDIR).map_err(errno)
    }

    // Try O_EXCL first so only a genuine create gets its owner/mode claim
    // written, falling back without it on EEXIST for open-or-create.
    pub fn create(
        &mut self,
        parent: u64,
        name: &str,
        mode: u32,
        flags: u32,
        req_uid: u32,
        req_gid: u32,
    ) -> Result<(wire::EntryOut, u64), i32> {
        let parent_path = self.inodes_path(parent).ok_or(libc::ENOENT)?;
        let path = join(&parent_path, name);

        let requested = OFlags::from_bits_truncate(flags);
        let wants_excl = requested.contains(OFlags::EXCL);
        let real_flags = (requested - OFlags::CREATE - OFlags::EXCL - OFlags::TRUNC)
            | OFlags::CREATE
            | OFlags::EXCL;

        let (fd, created) =
            match openat(&self.basefd, &path, real_flags, Mode::from_raw_mode(0o644)) {
                Ok(fd) => (fd, true),
                Err(Errno::EXIST) if !wants_excl => {
                    let retry_flags = (requested - OFlags::CREATE - OFlags::EXCL) | OFlags::CREATE;
                    let fd = openat(&self.basefd, &path, retry_flags, Mode::empty()).map_err(errno)?;
                    (fd, false)
                }
                Err(err) => return Err(errno(err)),
            };

        rustix::fs::fchmod(&fd, Mode::from_raw_mode(real_mode(false, mode) as RawMode))
            .map_err(errno)?;

        if created {
            update_fake_record(
                &fd,
                FakeRecord {
                    uid: Some(req_uid),
                    gid: Some(req_gid),
                    mode: Some(mode),
                },
            )
            .map_err(|_| libc::EIO)?;
        }

        let entry = self.lookup(parent, name)?;
        let fh = self.alloc_fh(fd, false);
        Ok((entry, fh))
    }

    pub fn open(&mut self, nodeid: u64, flags: u32) -> Result<u64, i32> {
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        let requested = OFlags::from_bits_truncate(flags) - OFlags::NOFOLLOW;
        let fd = openat(&self.basefd, &path, requested, Mode::empty()).map_err(errno)?;
        Ok(self.alloc_fh(fd, false))
    }

    pub fn opendir(&mut self, nodeid: u64) -> Result<u64, i32> {
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        let fd = openat(
            &self.basefd,
            &path,
            OFlags::DIRECTORY | OFlags::RDONLY,
            Mode::empty(),
        )
        .map_err(errno)?;
        Ok(self.alloc_fh(fd, true))
    }

    pub fn read(&mut self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, i32> {
        let handle = self.handle(fh).ok_or(libc::EBADF)?;
        let mut buf = vec![0u8; size as usize];
        let n = rustix::io::pread(&handle.fd, &mut buf, offset).map_err(errno)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&mut self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, i32> {
        let handle = self.handle(fh).ok_or(libc::EBADF)?;
        let n = rustix::io::pwrite(&handle.fd, data, offset).map_err(errno)?;
        Ok(n as u32)
    }

    pub fn release(&mut self, fh: u64) {
        self.close_handle(fh);
    }

    pub fn releasedir(&mut self, fh: u64) {
        self.close_handle(fh);
    }

    pub fn fsync(&mut self, fh: u64) -> Result<(), i32> {
        let handle = self.handle(fh).ok_or(libc::EBADF)?;
        rustix::fs::fsync(&handle.fd).map_err(errno)
    }

    pub fn readdir(&mut self, fh: u64, offset: u64, max_size: usize) -> Result<Vec<u8>, i32> {
        let handle = self.handle(fh).ok_or(libc::EBADF)?;
        if !handle.is_dir {
            return Err(libc::ENOTDIR);
        }

        let dupfd: OwnedFd = handle.fd.try_clone().map_err(|_| libc::EIO)?;
        let mut dir = Dir::read_from(dupfd).map_err(errno)?;

        let mut out = Vec::new();
        let mut index: u64 = 0;
        for entry in dir.by_ref() {
            let entry = entry.map_err(errno)?;
            index += 1;
            if index <= offset {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if sidecar::is_reserved(&name) {
                continue;
            }

            let d_type = match entry.file_type() {
                FileType::RegularFile => libc::DT_REG,
                FileType::Directory => libc::DT_DIR,
                FileType::Symlink => libc::DT_LNK,
                FileType::BlockDevice => libc::DT_BLK,
                FileType::CharacterDevice => libc::DT_CHR,
                FileType::Fifo => libc::DT_FIFO,
                FileType::Socket => libc::DT_SOCK,
                _ => libc::DT_UNKNOWN,
            } as u32;

            let header = wire::DirEntryHeader {
                ino: entry.ino(),
                off: index,
                namelen: name.len() as u32,
                d_type,
            };
            let padded = wire::dirent_padded_len(name.len());
            if out.len() + padded > max_size {
                break;
            }

            out.extend_from_slice(&header.to_bytes());
            out.extend_from_slice(name.as_bytes());
            out.resize(out.len() + (padded - wire::DirEntryHeader::LEN - name.len()), 0);
        }

        Ok(out)
    }

    pub fn readlink(&mut self, nodeid: u64) -> Result<Vec<u8>, i32> {
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        let target = readlinkat(&self.basefd, &path, Vec::new()).map_err(errno)?;
        Ok(target.into_bytes())
    }

    pub fn symlink(
        &mut self,
        parent: u64,
        name: &str,
        target: &str,
        req_uid: u32,
        req_gid: u32,
    ) -> Result<wire::EntryOut, i32> {
        let parent_path = self.inodes_path(parent).ok_or(libc::ENOENT)?;
        let path = join(&parent_path, name);

        symlinkat(target, &self.basefd, &path).map_err(errno)?;

        let stat = fstatat(&self.basefd, &path, AtFlags::SYMLINK_NOFOLLOW).map_err(errno)?;
        sidecar::write(
            &self.basefd,
            stat.st_dev,
            stat.st_ino,
            FakeRecord {
                uid: Some(req_uid),
                gid: Some(req_gid),
                mode: None,
            },
        )
        .map_err(|_| libc::EIO)?;

        self.lookup(parent, name)
    }

    pub fn unlink(&mut self, parent: u64, name: &str) -> Result<(), i32> {
        let parent_path = self.inodes_path(parent).ok_or(libc::ENOENT)?;
        let path = join(&parent_path, name);

        let stat = fstatat(&self.basefd, &path, AtFlags::SYMLINK_NOFOLLOW).map_err(errno)?;
        let is_symlink = FileType::from_raw_mode(stat.st_mode as RawMode) == FileType::Symlink;

        unlinkat(&self.basefd, &path, AtFlags::empty()).map_err(errno)?;

        if is_symlink {
            let _ = sidecar::remove(&self.basefd, stat.st_dev, stat.st_ino);
        }
        Ok(())
    }

    pub fn rename(&mut self, parent: u64, name: &str, newparent: u64, newname: &str) -> Result<(), i32> {
        let from_dir = self.inodes_path(parent).ok_or(libc::ENOENT)?;
        let to_dir = self.inodes_path(newparent).ok_or(libc::ENOENT)?;
        let from = join(&from_dir, name);
        let to = join(&to_dir, newname);

        renameat(&self.basefd, &from, &self.basefd, &to).map_err(errno)?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    pub fn link(&mut self, nodeid: u64, newparent: u64, newname: &str) -> Result<wire::EntryOut, i32> {
        let from = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        let to_dir = self.inodes_path(newparent).ok_or(libc::ENOENT)?;
        let to = join(&to_dir, newname);

        linkat(&self.basefd, &from, &self.basefd, &to, AtFlags::empty()).map_err(errno)?;
        self.lookup(newparent, newname)
    }

    // Always succeeds for write probes: the unprivileged caller owns the
    // whole backing directory regardless of claimed mode.
    pub fn access(&mut self, nodeid: u64, mask: u32) -> Result<(), i32> {
        if mask & (libc::W_OK as u32) != 0 {
            return Ok(());
        }
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        rustix::fs::accessat(&self.basefd, &path, rustix::fs::Access::from_bits_truncate(mask as i32), AtFlags::empty())
            .map_err(errno)
    }

    pub fn statfs(&mut self, nodeid: u64) -> Result<wire::StatfsOut, i32> {
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        let stat = rustix::fs::statvfs_at(&self.basefd, &path).map_err(errno)?;
        Ok(wire::StatfsOut {
            blocks: stat.f_blocks,
            bfree: stat.f_bfree,
            bavail: stat.f_bavail,
            files: stat.f_files,
            ffree: stat.f_ffree,
            bsize: stat.f_bsize as u32,
            namelen: stat.f_namemax as u32,
            frsize: stat.f_frsize as u32,
            padding: 0,
            spare: [0; 6],
        })
    }

    pub fn setxattr(&mut self, nodeid: u64, name: &str, value: &[u8]) -> Result<(), i32> {
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        let pathfd = open_nofollow_path(&self.basefd, &path).map_err(errno)?;
        xattr::user_setxattr(&pathfd, name, value, rustix::fs::XattrFlags::empty()).map_err(errno)
    }

    pub fn getxattr(&mut self, nodeid: u64, name: &str, size: usize) -> Result<Vec<u8>, i32> {
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        let pathfd = open_nofollow_path(&self.basefd, &path).map_err(errno)?;

        if size == 0 {
            let needed = xattr::user_getxattr(&pathfd, name, &mut []).map_err(errno)?;
            return Ok(wire::GetXattrOut { size: needed as u32, padding: 0 }.as_bytes().to_vec());
        }

        let mut buf = vec![0u8; size];
        let n = xattr::user_getxattr(&pathfd, name, &mut buf).map_err(errno)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn listxattr(&mut self, nodeid: u64, size: usize) -> Result<Vec<u8>, i32> {
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        let pathfd = open_nofollow_path(&self.basefd, &path).map_err(errno)?;
        let names = xattr::user_listxattr(&pathfd).map_err(errno)?;

        let mut joined = Vec::new();
        for name in &names {
            joined.extend_from_slice(name.as_bytes());
            joined.push(0);
        }

        if size == 0 {
            return Ok(wire::GetXattrOut { size: joined.len() as u32, padding: 0 }.as_bytes().to_vec());
        }
        if joined.len() > size {
            return Err(libc::ERANGE);
        }
        Ok(joined)
    }

    pub fn removexattr(&mut self, nodeid: u64, name: &str) -> Result<(), i32> {
        let path = self.inodes_path(nodeid).ok_or(libc::ENOENT)?;
        let pathfd = open_nofollow_path(&self.basefd, &path).map_err(errno)?;
        xattr::user_removexattr(&pathfd, name).map_err(errno)
    }

    // mknod is always refused: grootfs never virtualises device nodes.
    pub fn mknod(&mut self) -> Result<(), i32> {
        Err(libc::EROFS)
    }
}
