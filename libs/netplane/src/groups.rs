use anyhow::{Context as _, Result};

use crate::cmd::{Cmd, Runner};
use crate::{DIRECT_GROUP, PROXY_GROUP};

/// Resolved ids of the two owning groups.
///
/// The steering rules match on these via `-m owner --gid-owner`; workers are
/// spawned into them so the kernel can tell their traffic apart without any
/// per-flow bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct Groups {
    pub direct_gid: u32,
    pub proxy_gid: u32,
}

/// Creates both groups if needed and resolves their ids.
pub fn ensure_groups(runner: &impl Runner) -> Result<Groups> {
    for name in [DIRECT_GROUP, PROXY_GROUP] {
        // -f makes re-runs a no-op.
        runner.run(&Cmd::new("groupadd").args(["-f", name]))?;
    }

    Ok(Groups {
        direct_gid: gid_of(DIRECT_GROUP)?,
        proxy_gid: gid_of(PROXY_GROUP)?,
    })
}

pub fn gid_of(name: &str) -> Result<u32> {
    let group = nix::unistd::Group::from_name(name)
        .with_context(|| format!("Failed to look up group `{name}`"))?
        .with_context(|| format!("Group `{name}` does not exist"))?;

    Ok(group.gid.as_raw())
}
