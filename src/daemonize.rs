// fork twice so the grandchild reparents to PID 1 and becomes its own
// session leader; the intermediate child exits immediately so the caller
// can reap it synchronously instead of leaving an orphan around.

use std::process::exit;

use anyhow::{Context, Result};
use rustix::process::{Pid, WaitOptions, setsid, waitpid};

pub enum Role {
    Parent,
    Detached,
}

pub fn detach() -> Result<Role> {
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error()).context("Unable to fork helper process"),
        0 => match unsafe { libc::fork() } {
            -1 => {
                eprintln!(
                    "Unable to fork detached helper: {}",
                    std::io::Error::last_os_error()
                );
                exit(1);
            }
            0 => {
                setsid().context("Unable to become session leader")?;
                Ok(Role::Detached)
            }
            _grandchild => exit(0),
        },
        child => {
            let pid = Pid::from_raw(child).context("Helper fork returned pid 0")?;
            waitpid(pid, WaitOptions::empty()).context("Unable to reap intermediate helper")?;
            Ok(Role::Parent)
        }
    }
}
