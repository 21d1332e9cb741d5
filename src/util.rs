use rustix::{
    fd::{AsFd, OwnedFd},
    fs::{Mode, OFlags, openat},
    path::Arg as PathArg,
};

pub fn open_dir(dirfd: impl AsFd, name: impl PathArg) -> rustix::io::Result<OwnedFd> {
    openat(
        dirfd,
        name,
        OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
}
