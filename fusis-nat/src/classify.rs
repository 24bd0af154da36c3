//! Maps raw command results onto the outcomes the controllers act on.
//!
//! `ip` and `iptables` report duplicate creation and missing rules as plain
//! failures, so the only way to tell them apart is the message text.

use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

static FILE_EXISTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)file exists").expect("invalid file exists pattern"));
static CHAIN_EXISTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)chain already exists").expect("invalid chain exists pattern")
});
// Newer iptables releases answer `-C`/`-D` on a missing rule with "Bad rule
// (does a matching rule exist in that chain?)".
static NO_SUCH_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no .* by that name|does a matching rule exist")
        .expect("invalid no rule pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    RouteExists,
    ChainExists,
    NoSuchRule,
}

#[derive(Debug)]
pub enum Outcome {
    Success(String),
    /// A known failure. The caller decides whether it means the desired
    /// state already holds.
    Recoverable(Condition, Error),
    Fatal(Error),
}

/// Whether a mutating step changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
}

impl Outcome {
    /// Resolves the outcome, treating `condition` as the desired end state.
    pub fn tolerate(self, condition: Condition) -> Result<Applied> {
        match self {
            Outcome::Success(_) => Ok(Applied::Changed),
            Outcome::Recoverable(c, _) if c == condition => Ok(Applied::Unchanged),
            Outcome::Recoverable(_, e) | Outcome::Fatal(e) => Err(e),
        }
    }

    /// Resolves the outcome without tolerating any known failure.
    pub fn strict(self) -> Result<Applied> {
        match self {
            Outcome::Success(_) => Ok(Applied::Changed),
            Outcome::Recoverable(_, e) | Outcome::Fatal(e) => Err(e),
        }
    }
}

pub fn classify_route(result: Result<String>) -> Outcome {
    classify(result, |output| {
        FILE_EXISTS
            .is_match(output)
            .then_some(Condition::RouteExists)
    })
}

pub fn classify_iptables(result: Result<String>) -> Outcome {
    classify(result, |output| {
        if CHAIN_EXISTS.is_match(output) {
            Some(Condition::ChainExists)
        } else if NO_SUCH_RULE.is_match(output) {
            Some(Condition::NoSuchRule)
        } else {
            None
        }
    })
}

fn classify(result: Result<String>, condition: impl Fn(&str) -> Option<Condition>) -> Outcome {
    match result {
        Ok(output) => Outcome::Success(output),
        Err(e) => match e.output().and_then(&condition) {
            Some(c) => Outcome::Recoverable(c, e),
            None => Outcome::Fatal(e),
        },
    }
}
