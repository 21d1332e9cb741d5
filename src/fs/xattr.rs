// rustix::fs only exposes path-based getxattr/setxattr/listxattr/
// removexattr (no *at() variant in the kernel itself), so every call here
// goes through /proc/self/fd/<fd>.

use std::path::Path;

use rustix::io::Errno;

use crate::fs::record::{FakeRecord, RECORD_LEN};

pub const FAKE_RECORD_ATTR: &str = "user.grootfs";
pub const USER_ATTR_PREFIX: &str = "user.grootfs.";

fn proc_path(dirfd: impl rustix::fd::AsFd) -> String {
    format!("/proc/self/fd/{}", dirfd.as_fd().as_raw_fd())
}

use rustix::fd::AsRawFd;

pub fn read_fake_record(dirfd: impl rustix::fd::AsFd) -> anyhow::Result<FakeRecord> {
    let path = proc_path(dirfd);
    let mut buf = [0u8; RECORD_LEN];
    match rustix::fs::getxattr(&path, FAKE_RECORD_ATTR, &mut buf) {
        Ok(RECORD_LEN) => FakeRecord::decode(&buf),
        Ok(other) => {
            anyhow::bail!("corrupt grootfs fake record: read {other} bytes, expected {RECORD_LEN}")
        }
        Err(Errno::NODATA) | Err(Errno::OPNOTSUPP) | Err(Errno::NOENT) => Ok(FakeRecord::default()),
        Err(err) => Err(err.into()),
    }
}

pub fn update_fake_record(
    dirfd: impl rustix::fd::AsFd + Copy,
    update: FakeRecord,
) -> anyhow::Result<()> {
    let current = read_fake_record(dirfd)?;
    let merged = current.merged_with(update);
    let path = proc_path(dirfd);
    rustix::fs::setxattr(
        &path,
        FAKE_RECORD_ATTR,
        &merged.encode(),
        rustix::fs::XattrFlags::empty(),
    )?;
    Ok(())
}

pub fn user_getxattr(dirfd: impl rustix::fd::AsFd, name: &str, buf: &mut [u8]) -> rustix::io::Result<usize> {
    rustix::fs::getxattr(proc_path(dirfd), &format!("{USER_ATTR_PREFIX}{name}"), buf)
}

pub fn user_setxattr(
    dirfd: impl rustix::fd::AsFd,
    name: &str,
    value: &[u8],
    flags: rustix::fs::XattrFlags,
) -> rustix::io::Result<()> {
    rustix::fs::setxattr(
        proc_path(dirfd),
        &format!("{USER_ATTR_PREFIX}{name}"),
        value,
        flags,
    )
}

pub fn user_removexattr(dirfd: impl rustix::fd::AsFd, name: &str) -> rustix::io::Result<()> {
    rustix::fs::removexattr(proc_path(dirfd), &format!("{USER_ATTR_PREFIX}{name}"))
}

pub fn user_listxattr(dirfd: impl rustix::fd::AsFd) -> rustix::io::Result<Vec<String>> {
    let path = proc_path(dirfd);

    // Probe with a zero-size buffer to learn how much space is needed,
    // then grow by doubling on ERANGE.
    let mut size = match rustix::fs::listxattr(&path, &mut []) {
        Ok(n) => n,
        Err(Errno::NODATA) | Err(Errno::OPNOTSUPP) => return Ok(vec![]),
        Err(err) => return Err(err),
    };
    if size == 0 {
        return Ok(vec![]);
    }

    loop {
        let mut buf = vec![0u8; size];
        match rustix::fs::listxattr(&path, &mut buf) {
            Ok(actual) => {
                buf.truncate(actual);
                return Ok(parse_names(&buf)
                    .into_iter()
                    .filter_map(|n| n.strip_prefix(USER_ATTR_PREFIX).map(str::to_string))
                    .collect());
            }
            Err(Errno::RANGE) => size *= 2,
            Err(err) => return Err(err),
        }
    }
}

fn parse_names(buf: &[u8]) -> Vec<String> {
    buf.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nul_separated_names() {
        let names = parse_names(b"user.grootfs.foo\0user.grootfs.bar\0user.other\0");
        assert_eq!(names, vec!["user.grootfs.foo", "user.grootfs.bar", "user.other"]);
    }
}
