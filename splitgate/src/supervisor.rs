use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context as _, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// A re-exec'd worker process.
///
/// Workers run under a dedicated owning group so the steering rules can
/// recognise their traffic, and carry a parent-death signal so they cannot
/// outlive us even through a crash.
pub(crate) struct Worker {
    name: &'static str,
    child: tokio::process::Child,
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub(crate) fn spawn_worker(
    name: &'static str,
    args: &[&str],
    gid: u32,
    envs: &[(&str, String)],
) -> Result<Worker> {
    let exe = std::env::current_exe().context("Cannot locate our own executable")?;

    let mut command = tokio::process::Command::new(exe);
    command
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .gid(gid)
        .kill_on_drop(true);

    for (key, value) in envs {
        command.env(key, value);
    }

    // SAFETY: set_pdeathsig is async-signal-safe; nothing else runs in the
    // forked child before exec.
    unsafe {
        command.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)
                .map_err(std::io::Error::from)
        });
    }

    let child = command
        .spawn()
        .with_context(|| format!("Failed to spawn `{name}` worker"))?;

    tracing::info!(name, pid = child.id(), gid, "Spawned worker");

    Ok(Worker { name, child })
}

impl Worker {
    /// Resolves when the worker exits on its own. That is always a failure
    /// condition for the daemon: kernel state without its workers is a
    /// half-configured trap.
    pub(crate) async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for `{}` worker", self.name))
    }

    /// Graceful termination first, a kill if the worker lingers.
    pub(crate) async fn shutdown(mut self) {
        let Some(pid) = self.child.id() else {
            return; // Already reaped.
        };

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(name = self.name, "Failed to signal worker: {e}");
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) if clean_exit(&status) => {
                tracing::info!(name = self.name, "Worker exited");
            }
            Ok(Ok(status)) => {
                tracing::warn!(name = self.name, %status, "Worker exited uncleanly");
            }
            Ok(Err(e)) => {
                tracing::warn!(name = self.name, "Failed to reap worker: {e}");
            }
            Err(_) => {
                tracing::warn!(name = self.name, "Worker ignored SIGTERM, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Deaths by our own shutdown signals count as clean exits.
pub(crate) fn clean_exit(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt as _;

    if status.success() {
        return true;
    }

    matches!(
        status.signal(),
        Some(sig) if sig == Signal::SIGINT as i32
            || sig == Signal::SIGTERM as i32
            || sig == Signal::SIGKILL as i32
    )
}

/// Kills every other process running this same executable.
///
/// Run at daemon exit (and before start) to collect workers orphaned by a
/// crash; the parent-death signal covers most cases but not all kernels and
/// not a SIGKILLed parent's already-detached children.
pub(crate) fn kill_stragglers() {
    let me = std::process::id();
    let Ok(my_exe) = std::fs::read_link("/proc/self/exe") else {
        return;
    };
    let Ok(proc_entries) = std::fs::read_dir("/proc") else {
        return;
    };

    for entry in proc_entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == me {
            continue;
        }

        let Ok(exe) = std::fs::read_link(entry.path().join("exe")) else {
            continue;
        };
        if exe != my_exe {
            continue;
        }

        tracing::warn!(pid, "Killing leftover process");
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt as _;

    use super::*;

    #[test]
    fn signal_deaths_from_shutdown_are_clean() {
        assert!(clean_exit(&ExitStatus::from_raw(0)));
        assert!(clean_exit(&ExitStatus::from_raw(libc_signal(Signal::SIGTERM))));
        assert!(clean_exit(&ExitStatus::from_raw(libc_signal(Signal::SIGKILL))));
        assert!(!clean_exit(&ExitStatus::from_raw(1 << 8)));
    }

    fn libc_signal(signal: Signal) -> i32 {
        // Wait status encoding: low byte is the terminating signal.
        signal as i32
    }
}
