mod inodes;
pub mod ops;
pub mod policy;
pub mod record;
pub mod session;
pub mod sidecar;
pub mod wire;
pub mod xattr;

use std::{collections::HashMap, os::fd::OwnedFd};

use inodes::Inodes;

pub struct OpenHandle {
    pub fd: OwnedFd,
    pub is_dir: bool,
}

pub struct GrootFs {
    pub basefd: OwnedFd,
    pub max_uid: u32,
    pub max_gid: u32,

    inodes: Inodes,
    handles: HashMap<u64, OpenHandle>,
    next_fh: u64,
}

impl GrootFs {
    pub fn new(basefd: OwnedFd, max_uid: u32, max_gid: u32) -> Self {
        Self {
            basefd,
            max_uid,
            max_gid,
            inodes: Inodes::new(),
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn alloc_fh(&mut self, fd: OwnedFd, is_dir: bool) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, OpenHandle { fd, is_dir });
        fh
    }

    fn handle(&self, fh: u64) -> Option<&OpenHandle> {
        self.handles.get(&fh)
    }

    fn close_handle(&mut self, fh: u64) {
        self.handles.remove(&fh);
    }
}
