use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::reconcile::Pass;

#[derive(Error, Debug)]
pub enum Error {
    #[error("error spawning command {command:?}: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error running command {command:?}: {reason} - output: {output:?}")]
    CommandFailed {
        command: String,
        reason: String,
        output: String,
    },

    #[error("command {command:?} timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("routing table registry {}: {source}", path.display())]
    Registry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Per-address failures of a pass. `pass` holds what did get applied.
    #[error("multiple errors: {}", errors.join(" | "))]
    Multiple { errors: Vec<String>, pass: Pass },
}

impl Error {
    /// Raw combined output of a failed command, if any was captured.
    pub fn output(&self) -> Option<&str> {
        match self {
            Error::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// The part of a pass that was applied before it failed.
    pub fn partial_pass(&self) -> Option<&Pass> {
        match self {
            Error::Multiple { pass, .. } => Some(pass),
            _ => None,
        }
    }

    /// Short form used inside aggregated messages: the exit reason and the
    /// tool's own message instead of the whole command line.
    pub fn summary(&self) -> String {
        match self {
            Error::CommandFailed { reason, output, .. } if output.trim().is_empty() => {
                reason.clone()
            }
            Error::CommandFailed { reason, output, .. } => {
                format!("{}: {}", reason, output.trim())
            }
            other => other.to_string(),
        }
    }

    pub fn metric_label(&self) -> String {
        match self {
            Error::CommandSpawn { .. } => "command_spawn",
            Error::CommandFailed { .. } => "command_failed",
            Error::CommandTimeout { .. } => "command_timeout",
            Error::Registry { .. } => "registry",
            Error::Multiple { .. } => "partial",
        }
        .into()
    }
}
