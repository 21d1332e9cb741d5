// Many filesystems refuse user xattrs on symlink inodes, so a symlink's
// fake record lives in a regular file at the wrap root instead, keyed by
// the symlink's own (dev, ino). Symlinks can't be hardlinked, so this key
// always has at most one referent.

use rustix::{
    fd::AsFd,
    fs::{AtFlags, Mode, OFlags, openat, unlinkat},
    io::{Errno, pread, pwrite},
};

use super::record::{FakeRecord, RECORD_LEN};

pub const SIDECAR_PREFIX: &str = ".groot.symlink.";
// every .groot.-prefixed name is reserved and hidden from readdir.
pub const RESERVED_PREFIX: &str = ".groot.";

pub fn sidecar_name(dev: u64, ino: u64) -> String {
    format!("{SIDECAR_PREFIX}{dev:x}_{ino:x}")
}

pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

pub fn read(basefd: impl AsFd, dev: u64, ino: u64) -> anyhow::Result<FakeRecord> {
    let name = sidecar_name(dev, ino);
    match openat(basefd, &name, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty()) {
        Ok(fd) => {
            let mut buf = [0u8; RECORD_LEN];
            let n = pread(&fd, &mut buf, 0)?;
            if n == 0 {
                Ok(FakeRecord::default())
            } else {
                FakeRecord::decode(&buf[..n])
            }
        }
        Err(Errno::NOENT) => Ok(FakeRecord::default()),
        Err(err) => Err(err.into()),
    }
}

pub fn write(basefd: impl AsFd + Copy, dev: u64, ino: u64, update: FakeRecord) -> anyhow::Result<()> {
    let current = read(basefd, dev, ino)?;
    let merged = current.merged_with(update);
    let name = sidecar_name(dev, ino);
    let fd = openat(
        basefd,
        &name,
        OFlags::WRONLY | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
        Mode::from_bits_truncate(0o600),
    )?;
    pwrite(&fd, &merged.encode(), 0)?;
    Ok(())
}

pub fn remove(basefd: impl AsFd, dev: u64, ino: u64) -> anyhow::Result<()> {
    let name = sidecar_name(dev, ino);
    match unlinkat(basefd, &name, AtFlags::empty()) {
        Ok(()) => Ok(()),
        Err(Errno::NOENT) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_hex_encoded() {
        assert_eq!(sidecar_name(0, 0), ".groot.symlink.0_0");
        assert_eq!(sidecar_name(0x10, 0xff), ".groot.symlink.10_ff");
    }

    #[test]
    fn sidecars_and_reserved_names_are_filtered() {
        assert!(is_reserved(&sidecar_name(1, 2)));
        assert!(is_reserved(".groot.anything"));
        assert!(!is_reserved("regular-file"));
    }
}
