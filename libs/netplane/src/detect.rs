use anyhow::{Context as _, Result, bail};

use crate::cmd::{Cmd, Runner};

/// Finds the iptables commands to use, one per family.
///
/// The legacy binaries are preferred: the rules here use matches and targets
/// that the nf_tables frontend does not translate faithfully everywhere.
pub(crate) fn find_iptables(runner: &impl Runner) -> Result<(String, String)> {
    Ok((
        find_one(runner, "iptables-legacy", "iptables")?,
        find_one(runner, "ip6tables-legacy", "ip6tables")?,
    ))
}

fn find_one(runner: &impl Runner, legacy: &str, modern: &str) -> Result<String> {
    if which::which(legacy).is_ok() {
        return Ok(legacy.to_owned());
    }

    which::which(modern).with_context(|| format!("Cannot find the `{modern}` command"))?;

    let output = runner.run(&Cmd::new(modern).arg("--version").tolerant())?;
    if output.contains("(nf_tables)") {
        bail!("`{modern}` is the nf_tables frontend; install `{legacy}`");
    }

    Ok(modern.to_owned())
}

/// Verifies every external dependency the build sequence needs.
pub(crate) fn check_requirements(runner: &impl Runner, iptables: &str) -> Result<()> {
    for name in ["sysctl", "ip", "ipset", "groupadd"] {
        which::which(name).with_context(|| format!("Required command `{name}` not found"))?;
    }

    for module in ["conntrack", "addrtype"] {
        if !has_match(runner, iptables, module)? {
            bail!("iptables match `{module}` is not available; is the kernel module installed?");
        }
    }

    if !has_table(runner, iptables, "nat")? {
        bail!("iptables `nat` table is not available");
    }

    Ok(())
}

fn has_match(runner: &impl Runner, iptables: &str, module: &str) -> Result<bool> {
    let output = runner.run(&Cmd::new(iptables).args(["-m", module, "-h"]).tolerant())?;

    if output.contains("Couldn't load match") {
        return Ok(false);
    }
    if output.contains("Usage:") {
        return Ok(true);
    }

    bail!("Unexpected output probing for match `{module}`:\n{output}");
}

fn has_table(runner: &impl Runner, iptables: &str, table: &str) -> Result<bool> {
    let output = runner.run(&Cmd::new(iptables).args(["-t", table, "-S"]).tolerant())?;

    Ok(!output.to_lowercase().contains("table does not exist"))
}
