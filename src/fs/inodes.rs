// a nodeid here is just a lookup-refcounted relative path; there's no
// separate inode cache to keep coherent with the real filesystem.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::fs::wire::FUSE_ROOT_ID;

struct Entry {
    path: PathBuf,
    lookups: u64,
}

#[derive(Default)]
pub struct Inodes {
    by_id: HashMap<u64, Entry>,
    by_path: HashMap<PathBuf, u64>,
    next_id: u64,
}

impl Inodes {
    pub fn new() -> Self {
        let mut by_id = HashMap::new();
        by_id.insert(
            FUSE_ROOT_ID,
            Entry {
                path: PathBuf::new(),
                lookups: 1,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert(PathBuf::new(), FUSE_ROOT_ID);

        Self {
            by_id,
            by_path,
            next_id: FUSE_ROOT_ID + 1,
        }
    }

    pub fn path_of(&self, nodeid: u64) -> Option<&Path> {
        self.by_id.get(&nodeid).map(|e| e.path.as_path())
    }

    pub fn lookup(&mut self, path: &Path) -> u64 {
        if let Some(&id) = self.by_path.get(path) {
            self.by_id.get_mut(&id).unwrap().lookups += 1;
            return id;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.by_id.insert(
            id,
            Entry {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        self.by_path.insert(path.to_path_buf(), id);
        id
    }

    pub fn forget(&mut self, nodeid: u64, count: u64) {
        if nodeid == FUSE_ROOT_ID {
            return;
        }
        let Some(entry) = self.by_id.get_mut(&nodeid) else {
            return;
        };
        entry.lookups = entry.lookups.saturating_sub(count);
        if entry.lookups == 0 {
            let path = entry.path.clone();
            self.by_id.remove(&nodeid);
            self.by_path.remove(&path);
        }
    }

    pub fn rename(&mut self, from: &Path, to: &Path) {
        if let Some(id) = self.by_path.remove(from) {
            self.by_id.get_mut(&id).unwrap().path = to.to_path_buf();
            self.by_path.insert(to.to_path_buf(), id);
        }

        let prefix = from.to_path_buf();
        let moved: Vec<(u64, PathBuf)> = self
            .by_id
            .iter()
            .filter_map(|(&id, e)| {
                e.path
                    .strip_prefix(&prefix)
                    .ok()
                    .map(|rest| (id, to.join(rest)))
            })
            .collect();
        for (id, new_path) in moved {
            if let Some(entry) = self.by_id.get_mut(&id) {
                self.by_path.remove(&entry.path);
                entry.path = new_path.clone();
                self.by_path.insert(new_path, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preassigned() {
        let inodes = Inodes::new();
        assert_eq!(inodes.path_of(FUSE_ROOT_ID), Some(Path::new("")));
    }

    #[test]
    fn repeated_lookup_returns_same_id() {
        let mut inodes = Inodes::new();
        let a = inodes.lookup(Path::new("foo"));
        let b = inodes.lookup(Path::new("foo"));
        assert_eq!(a, b);
    }

    #[test]
    fn forget_frees_the_mapping() {
        let mut inodes = Inodes::new();
        let id = inodes.lookup(Path::new("foo"));
        inodes.forget(id, 1);
        assert_eq!(inodes.path_of(id), None);
    }

    #[test]
    fn rename_rekeys_nested_paths() {
        let mut inodes = Inodes::new();
        let dir = inodes.lookup(Path::new("a"));
        let child = inodes.lookup(Path::new("a/b"));
        inodes.rename(Path::new("a"), Path::new("z"));
        assert_eq!(inodes.path_of(dir), Some(Path::new("z")));
        assert_eq!(inodes.path_of(child), Some(Path::new("z/b")));
    }
}
