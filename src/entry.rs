use std::{
    ffi::{OsStr, OsString},
    os::unix::process::CommandExt,
    path::PathBuf,
    process::Command,
};

use anyhow::{Context, Result};
use rustix::{
    mount::MountPropagationFlags,
    process::{getgid, getuid},
    thread::UnshareFlags,
};

use crate::{capabilities, mount, mount_helper, privmap, subid};

const SUBUID_FILE: &str = "/etc/subuid";
const SUBGID_FILE: &str = "/etc/subgid";

// GROOT_USER is set by the preload variant, which must not call into NSS
// during early init; fall back to the normal passwd-database lookup.
fn resolve_login() -> String {
    std::env::var("GROOT_USER").unwrap_or_else(|_| whoami::username())
}

pub fn run_in_namespace(wraps: &[PathBuf], command: &OsStr, args: &[OsString]) -> Result<()> {
    let login = resolve_login();
    let host_uid = getuid().as_raw();
    let host_gid = getgid().as_raw();

    // Step 2: build the sub-id range tables from /etc/subuid, /etc/subgid.
    let uid_table = subid::build_table(SUBUID_FILE, &login, host_uid)
        .context("Unable to read uid sub-id allocation")?;
    let gid_table = subid::build_table(SUBGID_FILE, &login, host_gid)
        .context("Unable to read gid sub-id allocation")?;
    let max_uid = uid_table.max_ns_id();
    let max_gid = gid_table.max_ns_id();

    // Step 3: spawn the Mount Helper first, if any wraps were requested,
    // so its own pre-open failures surface before we touch namespaces.
    let helper = if wraps.is_empty() {
        None
    } else {
        Some(mount_helper::spawn(wraps, max_uid, max_gid).context("Unable to start Mount Helper")?)
    };

    // Step 4: spawn the Privilege-Map Helper with both tables.
    let privmap = privmap::spawn(uid_table, gid_table).context("Unable to start Privilege-Map Helper")?;

    // Step 5.
    capabilities::set_no_new_privs()?;

    // Step 6: atomically create the new mount and user namespaces, then
    // make the mount namespace private so the wrap overlays we're about to
    // mount never propagate back to the host (the only mount-namespace
    // isolation spec.md's Non-goals call for: "beyond what is required to
    // perform the overlay mounts").
    rustix::thread::unshare(UnshareFlags::NEWUSER | UnshareFlags::NEWNS)
        .context("Unable to create new user+mount namespace")?;
    rustix::mount::mount_change("/", MountPropagationFlags::PRIVATE | MountPropagationFlags::REC)
        .context("Unable to make mount namespace private")?;

    // Step 7: wake the Privilege-Map Helper and wait for its mapping to land.
    privmap
        .confirm_mapping()
        .context("Failed to set up uid/gid mappings")?;

    // Step 8: mount each valid wrap and hand its device handle to the
    // Mount Helper, in wrap order.
    if let Some(helper) = &helper {
        for (wrap, &ok) in wraps.iter().zip(&helper.valid) {
            if !ok {
                continue;
            }
            let dev_fuse = mount::mount_grootfs(wrap, 0, 0)?;
            helper.send_device(&dev_fuse)?;
            drop(dev_fuse);
        }

        // Step 9.
        helper.confirm_attached()?;
    }

    // Step 10.
    capabilities::raise_ambient()?;

    // Step 11: never returns on success.
    let err = Command::new(command).args(args).exec();
    Err(err).context("Unable to execve target command")
}
