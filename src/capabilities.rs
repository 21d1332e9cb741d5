// Root-in-namespace starts with a full permitted set but an empty
// inheritable/ambient set, so a non-setuid target would drop capabilities
// the moment it execs. Raise everything permitted into inheritable and
// ambient so it survives execve.

use anyhow::{Context, Result};
use caps::{CapSet, CapsHashSet};
use log::debug;

pub fn set_no_new_privs() -> Result<()> {
    rustix::thread::set_no_new_privs(true).context("Unable to set PR_SET_NO_NEW_PRIVS")
}

pub fn raise_ambient() -> Result<()> {
    let permitted: CapsHashSet =
        caps::read(None, CapSet::Permitted).context("Unable to read permitted capability set")?;

    caps::set(None, CapSet::Inheritable, &permitted)
        .context("Unable to raise inheritable capabilities")?;

    for capability in permitted.iter().copied() {
        // Unknown-to-this-kernel capabilities report an error from the
        // underlying prctl(PR_CAP_AMBIENT) call; skip them rather than
        // aborting the whole sandbox entry.
        if let Err(err) = caps::raise(None, CapSet::Ambient, capability) {
            debug!("Ignoring capability {capability:?} unknown to this kernel: {err}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_known_capabilities_is_nonempty() {
        assert!(!caps::all().is_empty());
    }
}
