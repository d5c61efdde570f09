use std::path::Path;

use anyhow::{Context as _, Result, bail};
use netplane::{Host, Plane};

mod setup;
mod start;

pub(crate) use setup::setup;
pub(crate) use start::start;

use crate::supervisor;

pub(crate) fn stop() -> Result<()> {
    ensure_root()?;

    supervisor::kill_stragglers();

    let plane = Plane::new(Host)?;
    plane.stop()?;

    tracing::info!("System state restored");

    Ok(())
}

pub(crate) fn update(config_dir: &Path) -> Result<()> {
    tracing::info!("Refreshing all rule files");

    runtime()?.block_on(rulesets::update_all(config_dir))
}

#[expect(
    clippy::print_stdout,
    reason = "The probe report is the command's output."
)]
pub(crate) fn probe() -> Result<()> {
    let report = runtime()?.block_on(crate::probe::run());

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render report")?
    );

    Ok(())
}

/// Replaces this process with `command`, running under `group`.
pub(crate) fn exec(group: &str, command: &[String]) -> Result<()> {
    use std::os::unix::process::CommandExt as _;

    ensure_root()?;

    let gid = netplane::gid_of(group)?;

    let err = std::process::Command::new(&command[0])
        .args(&command[1..])
        .gid(gid)
        .exec();

    // exec only returns on failure.
    Err(err).with_context(|| format!("Failed to exec `{}`", command[0]))
}

pub(crate) fn ensure_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("This command must run as root");
    }

    Ok(())
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}
