use std::collections::BTreeSet;

use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};

use crate::Result;
use crate::classify::{Applied, Condition, Outcome, classify_iptables};
use crate::exec::CommandRunner;

pub const MANGLE_TABLE: &str = "mangle";
pub const CHAIN_NAME: &str = "FUSIS";
const PREROUTING: &str = "PREROUTING";

/// A packet-marking chain in one iptables table, jumped to from PREROUTING,
/// holding one `-s <addr> -j MARK --set-mark <mark>` rule per source.
pub struct MarkChain<R> {
    runner: R,
    table: String,
    chain: String,
    mark: String,
}

impl<R: CommandRunner> MarkChain<R> {
    pub fn new(runner: R, mark: impl Into<String>) -> Self {
        Self {
            runner,
            table: MANGLE_TABLE.into(),
            chain: CHAIN_NAME.into(),
            mark: mark.into(),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub async fn ensure_chain_exists(&self) -> Result<Applied> {
        let chain = self.chain.as_str();
        self.iptables(&["-N", chain])
            .await
            .tolerate(Condition::ChainExists)
    }

    /// Checks for the PREROUTING jump and inserts it at the head of the
    /// chain when the check reports it missing.
    pub async fn ensure_jump_rule_exists(&self) -> Result<Applied> {
        let chain = self.chain.as_str();
        match self.iptables(&["-C", PREROUTING, "-j", chain]).await {
            Outcome::Success(_) => Ok(Applied::Unchanged),
            Outcome::Recoverable(Condition::NoSuchRule, _) => {
                info!("inserting {} jump to {}", PREROUTING, chain);
                self.iptables(&["-I", PREROUTING, "-j", chain])
                    .await
                    .strict()
            }
            Outcome::Recoverable(_, e) | Outcome::Fatal(e) => Err(e),
        }
    }

    /// Source addresses that currently carry a rule in the chain.
    pub async fn list_marked_sources(&self) -> Result<BTreeSet<String>> {
        let out = self
            .runner
            .exec("iptables-save", &["-t", self.table.as_str()])
            .await?;
        Ok(parse_sources(&out, &self.chain))
    }

    pub async fn add_mark(&self, addr: &str) -> Result<Applied> {
        let chain = self.chain.as_str();
        let mark = self.mark.as_str();
        self.iptables(&["-A", chain, "-s", addr, "-j", "MARK", "--set-mark", mark])
            .await
            .strict()
    }

    /// Deletes the rule for `addr`. A rule that is already gone counts as
    /// removed.
    pub async fn remove_mark(&self, addr: &str) -> Result<Applied> {
        let chain = self.chain.as_str();
        let mark = self.mark.as_str();
        self.iptables(&["-D", chain, "-s", addr, "-j", "MARK", "--set-mark", mark])
            .await
            .tolerate(Condition::NoSuchRule)
    }

    async fn iptables(&self, rule: &[&str]) -> Outcome {
        let mut args = vec!["-t", self.table.as_str()];
        args.extend_from_slice(rule);
        classify_iptables(self.runner.exec("iptables", &args).await)
    }
}

/// Extracts the bare source address of every `-A <chain> -s <cidr>` line in
/// `iptables-save` output.
pub(crate) fn parse_sources(out: &str, chain: &str) -> BTreeSet<String> {
    let prefix = format!("-A {} -s ", chain);
    out.lines()
        .filter_map(|line| line.strip_prefix(&prefix))
        .filter_map(|rest| {
            let source = rest.split_whitespace().next()?;
            if !source.contains('/') {
                debug!("ignoring source without prefix length: {}", source);
                return None;
            }
            match source.parse::<IpNetwork>() {
                Ok(network) => Some(network.ip().to_string()),
                Err(e) => {
                    warn!("ignoring unparsable source {} in chain {}: {}", source, chain, e);
                    None
                }
            }
        })
        .collect()
}
