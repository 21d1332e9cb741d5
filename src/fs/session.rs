use std::{
    os::fd::{AsFd, OwnedFd},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use log::{debug, trace, warn};
use rustix::io::Errno;
use zerocopy::{FromBytes, IntoBytes};

use super::{
    GrootFs,
    wire::{self, IN_HEADER_LEN, InHeader, OUT_HEADER_LEN, OutHeader, Opcode},
};

const BUFFER_LEN: usize = 132 * 1024;

static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);

extern "C" fn request_exit(_signum: libc::c_int) {
    SHOULD_EXIT.store(true, Ordering::SeqCst);
}

// SIGPIPE ignored: writing to /dev/fuse after the kernel tore the mount
// down should surface as an error, not kill the process.
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGHUP, request_exit as libc::sighandler_t);
        libc::signal(libc::SIGINT, request_exit as libc::sighandler_t);
        libc::signal(libc::SIGTERM, request_exit as libc::sighandler_t);
    }
}

fn write_reply(fd: impl AsFd, unique: u64, error: i32, payload: &[u8]) -> Result<()> {
    let header = OutHeader {
        len: (OUT_HEADER_LEN + payload.len()) as u32,
        error: -error,
        unique,
    };
    let mut out = Vec::with_capacity(OUT_HEADER_LEN + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    rustix::io::write(fd, &out).context("Failed to write FUSE reply")?;
    Ok(())
}

fn write_error(fd: impl AsFd, unique: u64, error: i32) -> Result<()> {
    write_reply(fd, unique, error, &[])
}

macro_rules! reply_or_error {
    ($fd:expr, $unique:expr, $result:expr) => {
        match $result {
            Ok(payload) => write_reply($fd, $unique, 0, payload.as_bytes()),
            Err(errno) => write_error($fd, $unique, errno),
        }
    };
}

// fuse_fd must already be the fd named by the fd= mount option for this mount.
pub fn run(fuse_fd: OwnedFd, basefd: OwnedFd, max_uid: u32, max_gid: u32) -> Result<()> {
    install_signal_handlers();

    let mut fs = GrootFs::new(basefd, max_uid, max_gid);
    let mut buf = vec![0u8; BUFFER_LEN];

    loop {
        if SHOULD_EXIT.load(Ordering::SeqCst) {
            debug!("grootfs session exiting on signal");
            return Ok(());
        }

        let n = match rustix::io::read(&fuse_fd, &mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(Errno::INTR) => continue,
            Err(Errno::NODEV) => {
                debug!("grootfs mount was torn down");
                return Ok(());
            }
            Err(err) => return Err(err).context("Failed to read from FUSE device"),
        };

        if n < IN_HEADER_LEN {
            warn!("short FUSE request ({n} bytes), ignoring");
            continue;
        }

        let (header, body) = InHeader::ref_from_prefix(&buf[..n])
            .map_err(|_| anyhow::anyhow!("malformed FUSE request header"))?;
        dispatch(&fuse_fd, &mut fs, header, body)?;
    }
}

fn dispatch(fuse_fd: impl AsFd, fs: &mut GrootFs, header: &InHeader, body: &[u8]) -> Result<()> {
    let unique = header.unique;
    let nodeid = header.nodeid;

    let Ok(opcode) = Opcode::try_from(header.opcode) else {
        trace!("Unsupported FUSE opcode {}, replying ENOSYS", header.opcode);
        return write_error(fuse_fd, unique, libc::ENOSYS);
    };

    match opcode {
        Opcode::Init => {
            let Ok((req, _)) = wire::InitIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let out = fs.init(req);
            write_reply(fuse_fd, unique, 0, out.as_bytes())
        }

        Opcode::Destroy => write_error(fuse_fd, unique, 0),

        Opcode::Lookup => {
            let Ok(name) = parse_name(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            reply_or_error!(fuse_fd, unique, fs.lookup(nodeid, name))
        }

        Opcode::Forget => {
            // FUSE_FORGET never gets a reply, successful or otherwise.
            if let Ok((forget, _)) = ForgetIn::ref_from_prefix(body) {
                fs.forget(nodeid, forget.nlookup);
            }
            Ok(())
        }

        Opcode::GetAttr => reply_or_error!(fuse_fd, unique, fs.getattr(nodeid)),

        Opcode::SetAttr => {
            let Ok((req, _)) = wire::SetAttrIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let size = (req.valid & wire::fattr_flags::SIZE != 0).then_some(req.size);
            reply_or_error!(
                fuse_fd,
                unique,
                fs.setattr(
                    nodeid,
                    req.valid,
                    req.mode,
                    req.uid,
                    req.gid,
                    size,
                    (req.atime, req.atimensec),
                    (req.mtime, req.mtimensec),
                )
            )
        }

        Opcode::Mkdir => {
            let Ok((req, rest)) = wire::MkdirIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let Ok(name) = parse_name(rest) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            reply_or_error!(
                fuse_fd,
                unique,
                fs.mkdir(nodeid, name, req.mode, header.uid, header.gid)
            )
        }

        Opcode::Mknod => reply_or_error!(fuse_fd, unique, fs.mknod()),

        Opcode::Rmdir => {
            let Ok(name) = parse_name(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.rmdir(nodeid, name) {
                Ok(()) => write_error(fuse_fd, unique, 0),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::Unlink => {
            let Ok(name) = parse_name(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.unlink(nodeid, name) {
                Ok(()) => write_error(fuse_fd, unique, 0),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::Create => {
            let Ok((req, rest)) = wire::CreateIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let Ok(name) = parse_name(rest) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.create(nodeid, name, req.mode, req.flags, header.uid, header.gid) {
                Ok((entry, fh)) => {
                    let open_out = wire::OpenOut {
                        fh,
                        open_flags: 0,
                        padding: 0,
                    };
                    let mut payload = Vec::new();
                    payload.extend_from_slice(entry.as_bytes());
                    payload.extend_from_slice(open_out.as_bytes());
                    write_reply(fuse_fd, unique, 0, &payload)
                }
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::Open => {
            let Ok((req, _)) = wire::OpenIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.open(nodeid, req.flags) {
                Ok(fh) => write_reply(
                    fuse_fd,
                    unique,
                    0,
                    wire::OpenOut {
                        fh,
                        open_flags: 0,
                        padding: 0,
                    }
                    .as_bytes(),
                ),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::OpenDir => match fs.opendir(nodeid) {
            Ok(fh) => write_reply(
                fuse_fd,
                unique,
                0,
                wire::OpenOut {
                    fh,
                    open_flags: 0,
                    padding: 0,
                }
                .as_bytes(),
            ),
            Err(errno) => write_error(fuse_fd, unique, errno),
        },

        Opcode::Read => {
            let Ok((req, _)) = wire::ReadIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.read(req.fh, req.offset, req.size) {
                Ok(data) => write_reply(fuse_fd, unique, 0, &data),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::Write => {
            let Ok((req, rest)) = wire::WriteIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let data = &rest[..(req.size as usize).min(rest.len())];
            match fs.write(req.fh, req.offset, data) {
                Ok(written) => write_reply(
                    fuse_fd,
                    unique,
                    0,
                    wire::WriteOut {
                        size: written,
                        padding: 0,
                    }
                    .as_bytes(),
                ),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::Release => {
            if let Ok((req, _)) = wire::ReleaseIn::ref_from_prefix(body) {
                fs.release(req.fh);
            }
            write_error(fuse_fd, unique, 0)
        }

        Opcode::ReleaseDir => {
            if let Ok((req, _)) = wire::ReleaseIn::ref_from_prefix(body) {
                fs.releasedir(req.fh);
            }
            write_error(fuse_fd, unique, 0)
        }

        Opcode::Flush => write_error(fuse_fd, unique, 0),

        Opcode::Fsync | Opcode::FsyncDir => {
            let Ok((req, _)) = wire::FsyncIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.fsync(req.fh) {
                Ok(()) => write_error(fuse_fd, unique, 0),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::ReadDir => {
            let Ok((req, _)) = wire::ReadIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.readdir(req.fh, req.offset, req.size as usize) {
                Ok(data) => write_reply(fuse_fd, unique, 0, &data),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::ReadLink => match fs.readlink(nodeid) {
            Ok(target) => write_reply(fuse_fd, unique, 0, &target),
            Err(errno) => write_error(fuse_fd, unique, errno),
        },

        Opcode::Symlink => {
            let Ok((name, rest)) = split_name(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let Ok(target) = parse_name(rest) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            reply_or_error!(
                fuse_fd,
                unique,
                fs.symlink(nodeid, name, target, header.uid, header.gid)
            )
        }

        Opcode::Rename => {
            let Ok((req, rest)) = wire::RenameIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let Ok((name, rest)) = split_name(rest) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let Ok(newname) = parse_name(rest) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.rename(nodeid, name, req.newdir, newname) {
                Ok(()) => write_error(fuse_fd, unique, 0),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::Link => {
            let Ok((req, rest)) = wire::LinkIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let Ok(newname) = parse_name(rest) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            reply_or_error!(fuse_fd, unique, fs.link(req.oldnodeid, nodeid, newname))
        }

        Opcode::Access => {
            let Ok((req, _)) = wire::AccessIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.access(nodeid, req.mask) {
                Ok(()) => write_error(fuse_fd, unique, 0),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::Statfs => reply_or_error!(fuse_fd, unique, fs.statfs(nodeid)),

        Opcode::SetXattr => {
            let Ok((req, rest)) = wire::SetXattrIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let Ok((name, value)) = split_name(rest) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let value = &value[..(req.size as usize).min(value.len())];
            match fs.setxattr(nodeid, name, value) {
                Ok(()) => write_error(fuse_fd, unique, 0),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::GetXattr => {
            let Ok((req, rest)) = wire::GetXattrIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            let Ok(name) = parse_name(rest) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.getxattr(nodeid, name, req.size as usize) {
                Ok(data) => write_reply(fuse_fd, unique, 0, &data),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::ListXattr => {
            let Ok((req, _)) = wire::GetXattrIn::ref_from_prefix(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.listxattr(nodeid, req.size as usize) {
                Ok(data) => write_reply(fuse_fd, unique, 0, &data),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }

        Opcode::RemoveXattr => {
            let Ok(name) = parse_name(body) else {
                return write_error(fuse_fd, unique, libc::EINVAL);
            };
            match fs.removexattr(nodeid, name) {
                Ok(()) => write_error(fuse_fd, unique, 0),
                Err(errno) => write_error(fuse_fd, unique, errno),
            }
        }
    }
}

#[derive(zerocopy::FromBytes, zerocopy::KnownLayout, zerocopy::Immutable)]
#[repr(C)]
struct ForgetIn {
    nlookup: u64,
}

fn split_name(body: &[u8]) -> Result<(&str, &[u8]), ()> {
    let nul = body.iter().position(|&b| b == 0).ok_or(())?;
    let name = std::str::from_utf8(&body[..nul]).map_err(|_| ())?;
    Ok((name, &body[nul + 1..]))
}

fn parse_name(body: &[u8]) -> Result<&str, ()> {
    split_name(body).map(|(name, _)| name)
}
