//! Recording command runner for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::exec::{CommandRunner, command_line};
use crate::{Error, Result};

/// Canned answer for one command line.
#[derive(Debug, Clone)]
pub struct FakeResult {
    output: String,
    failure: Option<String>,
}

impl FakeResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            failure: None,
        }
    }

    pub fn fail(output: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            failure: Some(reason.into()),
        }
    }
}

#[derive(Default)]
struct State {
    log: Vec<Vec<String>>,
    results: HashMap<String, FakeResult>,
}

/// Records every invocation in order and answers from canned results keyed
/// by the flattened command line. Unknown commands succeed with no output.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<State>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all canned results.
    pub fn set_results<'a>(&self, results: impl IntoIterator<Item = (&'a str, FakeResult)>) {
        let mut state = self.state.lock().unwrap();
        state.results = results
            .into_iter()
            .map(|(line, result)| (line.to_owned(), result))
            .collect();
    }

    pub fn log(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }
}

impl CommandRunner for FakeRunner {
    async fn exec(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let line = command_line(cmd, args);
        let result = {
            let mut state = self.state.lock().unwrap();
            state.log.push(
                std::iter::once(cmd)
                    .chain(args.iter().copied())
                    .map(String::from)
                    .collect(),
            );
            state.results.get(&line).cloned()
        };
        match result {
            None => Ok(String::new()),
            Some(FakeResult {
                output,
                failure: None,
            }) => Ok(output),
            Some(FakeResult {
                output,
                failure: Some(reason),
            }) => Err(Error::CommandFailed {
                command: line,
                reason,
                output,
            }),
        }
    }
}

/// Builds an expected log entry from string slices.
pub fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}
