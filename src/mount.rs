use std::path::Path;

use anyhow::{Context, Result};
use rustix::{
    fd::{AsRawFd, OwnedFd},
    fs::{Mode, OFlags, open},
    mount::{MountFlags, mount},
};

// Classic mount(2), not fsopen/fsmount: the FUSE device fd has to be
// named in the mount data string, which only the classic call accepts.
pub fn mount_grootfs(target: &Path, uid: u32, gid: u32) -> Result<OwnedFd> {
    let dev_fuse = open("/dev/fuse", OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
        .context("Unable to open /dev/fuse")?;

    let data = format!(
        "fd={},rootmode=040000,user_id={uid},group_id={gid},allow_other",
        dev_fuse.as_raw_fd()
    );

    mount(
        "groot",
        target,
        "fuse.fuse-grootfs",
        MountFlags::NOSUID | MountFlags::NODEV,
        &data,
    )
    .with_context(|| format!("Unable to mount grootfs at {}", target.display()))?;

    Ok(dev_fuse)
}
