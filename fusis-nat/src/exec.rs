use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const PRIVILEGE_WRAPPER: &str = "sudo";

/// Runs a single external control command and returns its combined output.
///
/// A non-zero exit is reported as [`Error::CommandFailed`], which still
/// carries the captured output: tools such as `ip` and `iptables` only
/// distinguish "already exists" from real failures in their message text.
pub trait CommandRunner: Send + Sync {
    fn exec(&self, cmd: &str, args: &[&str]) -> impl Future<Output = Result<String>> + Send;
}

impl<T: CommandRunner> CommandRunner for Arc<T> {
    fn exec(&self, cmd: &str, args: &[&str]) -> impl Future<Output = Result<String>> + Send {
        (**self).exec(cmd, args)
    }
}

/// Runs commands through `sudo`, or directly when constructed with
/// [`SudoRunner::direct`].
#[derive(Debug, Clone)]
pub struct SudoRunner {
    wrapper: Option<String>,
    timeout: Duration,
}

impl SudoRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            wrapper: Some(PRIVILEGE_WRAPPER.into()),
            timeout,
        }
    }

    pub fn direct(timeout: Duration) -> Self {
        Self {
            wrapper: None,
            timeout,
        }
    }

    fn command(&self, cmd: &str, args: &[&str]) -> Command {
        let mut command = match &self.wrapper {
            Some(wrapper) => {
                let mut command = Command::new(wrapper);
                command.arg(cmd);
                command
            }
            None => Command::new(cmd),
        };
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        command
    }
}

impl Default for SudoRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl CommandRunner for SudoRunner {
    async fn exec(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let line = command_line(cmd, args);
        debug!(command = %line, "running command");

        let output = tokio::time::timeout(self.timeout, self.command(cmd, args).output())
            .await
            .map_err(|_| Error::CommandTimeout {
                command: line.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| Error::CommandSpawn {
                command: line.clone(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: line,
                reason: output.status.to_string(),
                output: combined,
            });
        }
        Ok(combined)
    }
}

/// Flattens a command and its arguments into a single space separated line.
pub fn command_line(cmd: &str, args: &[&str]) -> String {
    std::iter::once(cmd)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
