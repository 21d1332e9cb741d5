use std::process::Command;

use anyhow::{Context, Result, ensure};
use rustix::{fd::OwnedFd, process::Pid};

use crate::{
    daemonize::{Role, detach},
    rendezvous,
    subid::IdMapTable,
};

pub struct Handle {
    sock: OwnedFd,
}

impl Handle {
    pub fn confirm_mapping(&self) -> Result<()> {
        rendezvous::wake(&self.sock)?;
        rendezvous::wait(&self.sock, "Failed to set up uid/gid mappings")
    }
}

pub fn spawn(uid_table: IdMapTable, gid_table: IdMapTable) -> Result<Handle> {
    let (coordinator_sock, helper_sock) = rendezvous::pair()?;
    // Captured before forking: this is the coordinator's own pid, the one
    // whose uid_map/gid_map we need the helper to write from outside the
    // namespace the coordinator is about to create.
    let target_pid = rustix::process::getpid();

    match detach()? {
        Role::Parent => {
            drop(helper_sock);
            Ok(Handle {
                sock: coordinator_sock,
            })
        }
        Role::Detached => {
            drop(coordinator_sock);
            let code = match run(helper_sock, target_pid, &uid_table, &gid_table) {
                Ok(()) => 0,
                Err(err) => {
                    log::error!("Privilege-Map Helper failed: {err:?}");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

fn run(sock: OwnedFd, pid: Pid, uid_table: &IdMapTable, gid_table: &IdMapTable) -> Result<()> {
    rendezvous::wait(&sock, "Privilege-Map Helper woke before rendezvous")?;

    run_idmap_tool("newuidmap", pid, uid_table)?;
    run_idmap_tool("newgidmap", pid, gid_table)?;

    rendezvous::wake(&sock)?;
    Ok(())
}

fn run_idmap_tool(tool: &str, pid: Pid, table: &IdMapTable) -> Result<()> {
    let status = Command::new(tool)
        .arg(rustix::process::Pid::as_raw(Some(pid)).to_string())
        .args(table.args())
        .status()
        .with_context(|| format!("Unable to run {tool}"))?;

    ensure!(status.success(), "{tool} exited with {status}");
    Ok(())
}
