//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "support"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Scripted command runner standing in for host tools in tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::command::{command_line, CommandOutput, CommandRunner};

/// Scripted response for [`ScriptedCommandRunner`].
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Output(CommandOutput),
    /// The program is not installed.
    Missing,
}

/// Deterministic runner for tests.
///
/// Responses are matched by command-line prefix. One-shot responses are
/// consumed before persistent ones; unmatched commands succeed.
#[derive(Debug, Default)]
pub struct ScriptedCommandRunner {
    once: Mutex<VecDeque<(String, ScriptedResponse)>>,
    always: Mutex<Vec<(String, ScriptedResponse)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command starting with `prefix`.
    pub fn respond(&self, prefix: impl Into<String>, response: ScriptedResponse) -> &Self {
        self.always.lock().push((prefix.into(), response));
        self
    }

    /// Answer the next command starting with `prefix`, then forget the rule.
    pub fn respond_once(&self, prefix: impl Into<String>, response: ScriptedResponse) -> &Self {
        self.once.lock().push_back((prefix.into(), response));
        self
    }

    /// Every command line executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let line = command_line(program, args);
        self.calls.lock().push(line.clone());

        let response = {
            let mut once = self.once.lock();
            match once.iter().position(|(prefix, _)| line.starts_with(prefix)) {
                Some(index) => once.remove(index).map(|(_, response)| response),
                None => None,
            }
        }
        .or_else(|| {
            self.always
                .lock()
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix))
                .map(|(_, response)| response.clone())
        });

        match response {
            Some(ScriptedResponse::Output(output)) => Ok(output),
            Some(ScriptedResponse::Missing) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{program}: command not found"),
            )),
            None => Ok(CommandOutput::success()),
        }
    }
}
