//! splitgate — a transparent split-horizon gateway for a dual-stack router.
//!
//! The daemon classifies every outbound connection into a direct path or a
//! proxy path: a classifying DNS resolver decides per name, publishes the
//! answers into kernel IP sets, and TPROXY rules steer matching flows into a
//! local proxy output. Clients need no configuration at all.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

mod admin;
mod commands;
mod config;
mod envcfg;
mod outputs;
mod probe;
mod signals;
mod supervisor;
mod tasks;
mod tlsconn;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory containing the configuration and rule files.
    #[arg(short = 'c', long, global = true, env = "SPLITGATE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(clap::Subcommand)]
enum Cmd {
    /// Probe the OS and install the required system tools.
    Setup,
    /// Build the kernel state, spawn the workers and wait.
    Start,
    /// Tear all kernel state down. Kernel parameters and groups stay.
    Stop,
    /// Stop, then start.
    Restart,
    /// Safely refresh all remote rule files.
    Update,
    /// Dial a few well-known sites and report per-target latency.
    Probe,
    /// Run a command under a given owning group.
    #[command(hide = true)]
    Exec {
        group: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Internal re-exec entry point for worker processes.
    #[command(hide = true)]
    Tasks {
        role: String,
        subrole: Option<String>,
    },
}

#[expect(
    clippy::print_stderr,
    reason = "No logger is active when we are printing this error."
)]
fn main() {
    match try_main() {
        Ok(()) => {}
        Err(e) => {
            // Print chain of errors manually to avoid it looking like a crash with stacktrace.
            eprintln!("{e:#}");

            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);

    match cli.command {
        Cmd::Setup => commands::setup(&config_dir),
        Cmd::Start => commands::start(&config_dir),
        Cmd::Stop => commands::stop(),
        Cmd::Restart => {
            commands::stop()?;
            commands::start(&config_dir)
        }
        Cmd::Update => commands::update(&config_dir),
        Cmd::Probe => commands::probe(),
        Cmd::Exec { group, command } => commands::exec(&group, &command),
        Cmd::Tasks { role, subrole } => tasks::run(&role, subrole.as_deref()),
    }
}

fn init_logging() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set up logging: {e}"))
}

/// `/etc/splitgate`, unless we are clearly running from a scratch directory
/// (tests, one-off builds), in which case the working directory wins.
fn default_config_dir() -> PathBuf {
    let fallback = PathBuf::from("/etc/splitgate");

    let tmp = std::env::temp_dir();
    let Ok(cwd) = std::env::current_dir() else {
        return fallback;
    };

    let exe_in_tmp = std::env::current_exe().is_ok_and(|exe| exe.starts_with(&tmp));
    if cwd.starts_with(&tmp) || exe_in_tmp {
        return cwd;
    }

    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    // Can't remember how Clap works sometimes
    #[test]
    fn cli() {
        let actual = Cli::try_parse_from(["splitgate", "start"]).unwrap();
        assert!(matches!(actual.command, Cmd::Start));
        assert_eq!(actual.config_dir, None);

        let actual =
            Cli::try_parse_from(["splitgate", "--config-dir", "/tmp/x", "stop"]).unwrap();
        assert_eq!(actual.config_dir, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn exec_keeps_flags_of_the_wrapped_command() {
        let actual = Cli::try_parse_from([
            "splitgate", "exec", "split_direct", "curl", "-s", "https://example.com",
        ])
        .unwrap();

        match actual.command {
            Cmd::Exec { group, command } => {
                assert_eq!(group, "split_direct");
                assert_eq!(command, vec!["curl", "-s", "https://example.com"]);
            }
            _ => panic!("Expected Exec command"),
        }
    }

    #[test]
    fn tasks_takes_role_and_subrole() {
        let actual = Cli::try_parse_from(["splitgate", "tasks", "outputs", "socks5"]).unwrap();

        match actual.command {
            Cmd::Tasks { role, subrole } => {
                assert_eq!(role, "outputs");
                assert_eq!(subrole.as_deref(), Some("socks5"));
            }
            _ => panic!("Expected Tasks command"),
        }
    }
}
