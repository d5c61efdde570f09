use std::path::Path;

use anyhow::{Context as _, Result};

use crate::Family;
use crate::cmd::{Cmd, Runner};

/// Turns on the kernel switches the steering rules depend on.
///
/// `route_localnet` and `send_redirects` are not optional: without the former
/// TPROXY-diverted packets are discarded as martians, and with the latter the
/// kernel would hint direct paths to LAN clients behind our back.
pub(crate) fn apply(runner: &impl Runner, v4_forward: bool, v6_forward: bool) -> Result<()> {
    if v4_forward {
        runner.run(&Cmd::new("sysctl").args(["-wq", "net/ipv4/ip_forward=1"]))?;
    }
    if v6_forward {
        all_interfaces(runner, Family::V6, "forwarding=1")?;
    }

    all_interfaces(runner, Family::V4, "route_localnet=1")?;
    all_interfaces(runner, Family::V4, "send_redirects=0")?;

    Ok(())
}

/// Applies `key=value` under every `net/ipv<n>/conf/<interface>`.
///
/// Uses sysctl's slash syntax throughout; interface names may contain dots.
fn all_interfaces(runner: &impl Runner, family: Family, kv: &str) -> Result<()> {
    let conf = format!("/proc/sys/net/ipv{}/conf", family.number());
    let conf = Path::new(&conf);

    if !conf.exists() {
        // A v6-less kernel has nothing to configure.
        return Ok(());
    }

    for entry in std::fs::read_dir(conf)
        .with_context(|| format!("Failed to list `{}`", conf.display()))?
    {
        let name = entry.context("Failed to read directory entry")?.file_name();
        let setting = format!(
            "net/ipv{}/conf/{}/{kv}",
            family.number(),
            name.to_string_lossy()
        );

        runner.run(&Cmd::new("sysctl").args(["-wq", setting.as_str()]))?;
    }

    Ok(())
}
