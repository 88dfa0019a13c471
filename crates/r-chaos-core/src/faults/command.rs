//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "External command execution used by host-level fault controllers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::FaultError;

/// Captured result of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            status: Some(0),
            ..Self::default()
        }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }
}

/// Seam between fault controllers and the host's `tc`, `iptables`, and
/// service managers.
///
/// A spawn failure with [`io::ErrorKind::NotFound`] means the tool is not
/// installed; controllers fall back to a simulated fault in that case.
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs commands on the host through `tokio::process`.
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        debug!(
            target: "r_chaos::faults::command",
            command = %command_line(program, args),
            "executing"
        );
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} timed out after {:?}", program, self.timeout),
                )
            })??;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_owned();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Convert a non-zero exit into a [`FaultError`], mapping stderr that matches
/// any of `not_found_markers` to [`FaultError::NotFound`].
pub(crate) fn check_output(
    program: &str,
    args: &[String],
    output: CommandOutput,
    not_found_markers: &[&str],
) -> Result<CommandOutput, FaultError> {
    if output.succeeded() {
        return Ok(output);
    }
    let command = command_line(program, args);
    let stderr = output.stderr.trim().to_owned();
    let lowered = stderr.to_ascii_lowercase();
    if not_found_markers
        .iter()
        .any(|marker| lowered.contains(&marker.to_ascii_lowercase()))
    {
        return Err(FaultError::NotFound(format!("{command}: {stderr}")));
    }
    Err(FaultError::Command {
        command,
        status: output.status,
        stderr,
    })
}

pub(crate) fn is_missing_tool(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

pub(crate) fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_owned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_output_classifies_already_removed_rules() {
        let output = CommandOutput::failure(
            1,
            "iptables: Bad rule (does a matching rule exist in that chain?).",
        );
        let err = check_output("iptables", &args(["-D", "INPUT"]), output, &["bad rule"]).unwrap_err();
        assert!(err.is_not_found());

        let err = check_output(
            "iptables",
            &args(["-I", "INPUT"]),
            CommandOutput::failure(4, "Permission denied (you must be root)"),
            &["bad rule"],
        )
        .unwrap_err();
        assert!(matches!(err, FaultError::Command { status: Some(4), .. }));
    }

    #[tokio::test]
    async fn system_runner_reports_missing_binary() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let err = runner
            .run("r-chaos-definitely-not-installed", &[])
            .await
            .unwrap_err();
        assert!(is_missing_tool(&err));
    }
}
