use std::io::Write as _;
use std::process::Stdio;

use anyhow::{Context as _, Result, bail};

/// One external command, built argument by argument.
///
/// There is deliberately no way to pass a whole command line: every operand
/// is its own argument and nothing is ever parsed by a shell.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    benign: Vec<&'static str>,
    tolerant: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            benign: Vec::new(),
            tolerant: false,
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// Non-zero exits whose output contains one of these substrings are
    /// treated as success; they mean "already absent" during teardown.
    pub fn benign(mut self, needles: &'static [&'static str]) -> Self {
        self.benign.extend_from_slice(needles);
        self
    }

    /// Accept any exit status. For probing commands whose output is the
    /// actual result.
    pub fn tolerant(mut self) -> Self {
        self.tolerant = true;
        self
    }

    /// Rendering for logs and errors only; never fed back into a shell.
    pub fn line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Executes [`Cmd`]s. A trait so the build and teardown sequences can be
/// exercised against a recording fake.
pub trait Runner {
    /// Runs to completion and returns combined stdout + stderr.
    fn run(&self, cmd: &Cmd) -> Result<String>;
}

/// The real thing: synchronous subprocesses on the local host.
pub struct Host;

impl Runner for Host {
    fn run(&self, cmd: &Cmd) -> Result<String> {
        tracing::debug!(cmd = %cmd.line(), "Running command");

        let mut command = std::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn `{}`", cmd.line()))?;

        if let Some(bytes) = &cmd.stdin {
            child
                .stdin
                .take()
                .context("Child has no stdin")?
                .write_all(bytes)
                .with_context(|| format!("Failed to write stdin of `{}`", cmd.line()))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for `{}`", cmd.line()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() || cmd.tolerant {
            return Ok(combined);
        }

        if cmd.benign.iter().any(|needle| combined.contains(needle)) {
            tracing::debug!(cmd = %cmd.line(), "Ignoring benign failure");
            return Ok(combined);
        }

        bail!(
            "`{}` failed ({}):\n{}",
            cmd.line(),
            output.status,
            combined.trim()
        )
    }
}
