// Every wrap's backing directory is opened synchronously, before the
// double-fork, so a failure to open it can be logged while still attached
// to the caller's terminal; a wrap that fails to open is skipped (its slot
// in Handle::valid is false) and the coordinator never sends it a FUSE
// device handle.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rustix::fd::OwnedFd;

use crate::{
    daemonize::{Role, detach},
    fs::session,
    rendezvous,
    util::open_dir,
};

pub struct Handle {
    sock: OwnedFd,
    // Parallel to the wraps slice passed to spawn().
    pub valid: Vec<bool>,
}

impl Handle {
    pub fn send_device(&self, fd: impl rustix::fd::AsFd) -> Result<()> {
        rendezvous::send_fd(&self.sock, fd)
    }

    pub fn confirm_attached(&self) -> Result<()> {
        rendezvous::wait(&self.sock, "Mount Helper failed to attach filesystem sessions")
    }
}

pub fn spawn(wraps: &[PathBuf], max_uid: u32, max_gid: u32) -> Result<Handle> {
    let (coordinator_sock, helper_sock) = rendezvous::pair()?;

    let mut opened = Vec::with_capacity(wraps.len());
    let mut valid = Vec::with_capacity(wraps.len());
    for wrap in wraps {
        match open_dir(rustix::fs::CWD, wrap.as_path()) {
            Ok(fd) => {
                valid.push(true);
                opened.push(Some(fd));
            }
            Err(err) => {
                log::error!("Unable to open wrap directory {}: {err}; skipping it", wrap.display());
                valid.push(false);
                opened.push(None);
            }
        }
    }

    match detach()? {
        Role::Parent => {
            drop(helper_sock);
            drop(opened);
            Ok(Handle {
                sock: coordinator_sock,
                valid,
            })
        }
        Role::Detached => {
            drop(coordinator_sock);
            let code = match run(helper_sock, opened, max_uid, max_gid) {
                Ok(()) => 0,
                Err(err) => {
                    log::error!("Mount Helper failed: {err:?}");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

fn run(sock: OwnedFd, opened: Vec<Option<OwnedFd>>, max_uid: u32, max_gid: u32) -> Result<()> {
    let mut sessions = Vec::new();

    for basefd in opened.into_iter().flatten() {
        let fuse_fd =
            rendezvous::recv_fd(&sock).context("Failed to receive FUSE device handle")?;
        sessions.push(std::thread::spawn(move || {
            if let Err(err) = session::run(fuse_fd, basefd, max_uid, max_gid) {
                log::error!("grootfs session failed: {err:?}");
            }
        }));
    }

    rendezvous::wake(&sock)?;

    for session in sessions {
        let _ = session.join();
    }

    Ok(())
}
