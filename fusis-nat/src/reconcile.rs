use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::chain::MarkChain;
use crate::exec::CommandRunner;
use crate::route::PolicyRouting;
use crate::{Error, Result};

pub const MARK: &str = "9";

/// Addresses touched by one successful pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Pass {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Converges the installed marking state to a desired source set.
pub trait Apply: Send + Sync {
    fn apply(
        &self,
        desired: &BTreeSet<String>,
        gateway: &str,
    ) -> impl Future<Output = Result<Pass>> + Send;
}

pub struct Reconciler<R> {
    routing: PolicyRouting<Arc<R>>,
    chain: MarkChain<Arc<R>>,
    mark: String,
}

impl<R: CommandRunner> Reconciler<R> {
    pub fn new(runner: Arc<R>, registry: impl Into<PathBuf>) -> Self {
        Self {
            routing: PolicyRouting::new(runner.clone(), registry),
            chain: MarkChain::new(runner, MARK),
            mark: MARK.into(),
        }
    }

    /// Runs one reconciliation pass.
    ///
    /// Setup failures (registry, route, selector rule, chain, jump rule)
    /// abort the pass. Per-address failures are collected and returned
    /// together as [`Error::Multiple`] once every address was attempted,
    /// along with the part of the pass that was applied.
    #[tracing::instrument(skip(self, desired), fields(desired = desired.len()))]
    pub async fn reconcile(&self, desired: &BTreeSet<String>, gateway: &str) -> Result<Pass> {
        self.routing.ensure_routing_table_registered()?;
        self.routing.ensure_default_route(gateway).await?;
        self.routing.ensure_selector_rule(&self.mark).await?;
        self.chain.ensure_chain_exists().await?;
        self.chain.ensure_jump_rule_exists().await?;

        let current = self.chain.list_marked_sources().await?;
        let (to_add, to_remove) = diff(desired, &current);

        let mut pass = Pass::default();
        let mut errors = vec![];
        for addr in to_add {
            match self.chain.add_mark(&addr).await {
                Ok(_) => pass.added.push(addr),
                Err(e) => {
                    warn!("failed to mark {} in {}: {}", addr, self.chain.chain(), e);
                    errors.push(format!("error adding rule for {}: {}", addr, e.summary()));
                }
            }
        }
        for addr in to_remove {
            match self.chain.remove_mark(&addr).await {
                Ok(_) => pass.removed.push(addr),
                Err(e) => {
                    warn!("failed to unmark {} in {}: {}", addr, self.chain.chain(), e);
                    errors.push(format!("error removing rule for {}: {}", addr, e.summary()));
                }
            }
        }
        if !pass.added.is_empty() || !pass.removed.is_empty() {
            info!(added = ?pass.added, removed = ?pass.removed, "reconciled marked sources");
        }
        if !errors.is_empty() {
            return Err(Error::Multiple { errors, pass });
        }
        Ok(pass)
    }
}

impl<R: CommandRunner> Apply for Reconciler<R> {
    fn apply(
        &self,
        desired: &BTreeSet<String>,
        gateway: &str,
    ) -> impl Future<Output = Result<Pass>> + Send {
        self.reconcile(desired, gateway)
    }
}

/// Returns `(desired - current, current - desired)`, both sorted.
fn diff(desired: &BTreeSet<String>, current: &BTreeSet<String>) -> (Vec<String>, Vec<String>) {
    let to_add = desired.difference(current).cloned().collect();
    let to_remove = current.difference(desired).cloned().collect();
    (to_add, to_remove)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::testing::{FakeResult, FakeRunner, cmd};

    const GATEWAY: &str = "192.168.1.1";
    const JUMP_CHECK: &str = "iptables -t mangle -C PREROUTING -j FUSIS";
    const NO_RULE: &str = "iptables: No chain/target/match by that name.";

    fn base_expected() -> Vec<Vec<String>> {
        vec![
            cmd(&[
                "ip", "route", "add", "default", "via", GATEWAY, "table", "fusis.out",
            ]),
            cmd(&["ip", "rule", "list"]),
            cmd(&["ip", "rule", "add", "fwmark", "9", "table", "fusis.out"]),
            cmd(&["iptables", "-t", "mangle", "-N", "FUSIS"]),
            cmd(&["iptables", "-t", "mangle", "-C", "PREROUTING", "-j", "FUSIS"]),
            cmd(&["iptables-save", "-t", "mangle"]),
        ]
    }

    fn add(addr: &str) -> Vec<String> {
        cmd(&[
            "iptables", "-t", "mangle", "-A", "FUSIS", "-s", addr, "-j", "MARK", "--set-mark", "9",
        ])
    }

    fn remove(addr: &str) -> Vec<String> {
        cmd(&[
            "iptables", "-t", "mangle", "-D", "FUSIS", "-s", addr, "-j", "MARK", "--set-mark", "9",
        ])
    }

    fn set(addrs: &[&str]) -> BTreeSet<String> {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    fn reconciler() -> (Arc<FakeRunner>, NamedTempFile, Reconciler<FakeRunner>) {
        let runner = Arc::new(FakeRunner::new());
        let registry = NamedTempFile::new().unwrap();
        let reconciler = Reconciler::new(runner.clone(), registry.path());
        (runner, registry, reconciler)
    }

    fn save_output(addrs: &[&str]) -> String {
        let mut out = String::from("*mangle\n:PREROUTING ACCEPT [0:0]\n:FUSIS - [0:0]\n");
        out.push_str("-A PREROUTING -j FUSIS\n");
        for addr in addrs {
            out.push_str(&format!(
                "-A FUSIS -s {}/32 -j MARK --set-xmark 0x9/0xffffffff\n",
                addr
            ));
        }
        out.push_str("COMMIT\n");
        out
    }

    #[test]
    fn test_diff_is_minimal_and_sorted() {
        let (to_add, to_remove) = diff(
            &set(&["10.0.0.2", "10.0.0.1", "10.0.0.5"]),
            &set(&["10.0.0.5", "10.0.0.9", "10.0.0.3"]),
        );
        assert_eq!(to_add, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(to_remove, vec!["10.0.0.3", "10.0.0.9"]);
    }

    #[tokio::test]
    async fn test_apply_from_empty_state() {
        let (runner, registry, reconciler) = reconciler();
        runner.set_results([(JUMP_CHECK, FakeResult::fail(NO_RULE, "exit 1"))]);

        let pass = reconciler
            .apply(&set(&["10.0.0.2", "10.0.0.1"]), GATEWAY)
            .await
            .unwrap();
        assert_eq!(pass.added, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(pass.removed.is_empty());

        let mut expected = base_expected();
        expected.insert(
            5,
            cmd(&["iptables", "-t", "mangle", "-I", "PREROUTING", "-j", "FUSIS"]),
        );
        expected.push(add("10.0.0.1"));
        expected.push(add("10.0.0.2"));
        assert_eq!(runner.log(), expected);
        assert_eq!(
            fs::read_to_string(registry.path()).unwrap(),
            "\n100 fusis.out\n"
        );
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let (runner, registry, reconciler) = reconciler();
        let desired = set(&["10.0.0.1", "10.0.0.2"]);

        reconciler.apply(&desired, GATEWAY).await.unwrap();
        let mut expected = base_expected();
        expected.push(add("10.0.0.1"));
        expected.push(add("10.0.0.2"));
        assert_eq!(runner.log(), expected);

        runner.clear_log();
        runner.set_results([
            (
                "ip rule list",
                FakeResult::ok("32765:\tfrom all fwmark 0x9 lookup fusis.out\n"),
            ),
            (
                "iptables-save -t mangle",
                FakeResult::ok(save_output(&["10.0.0.1", "10.0.0.2"])),
            ),
        ]);
        let pass = reconciler.apply(&desired, GATEWAY).await.unwrap();
        assert_eq!(pass, Pass::default());

        let log = runner.log();
        assert!(
            log.iter().all(|c| !c.contains(&"MARK".to_string())),
            "unexpected mark mutation: {:?}",
            log
        );
        assert_eq!(
            fs::read_to_string(registry.path()).unwrap(),
            "\n100 fusis.out\n"
        );
    }

    #[tokio::test]
    async fn test_apply_with_existing_sources() {
        let (runner, _registry, reconciler) = reconciler();
        runner.set_results([(
            "iptables-save -t mangle",
            FakeResult::ok(save_output(&["10.0.0.2", "10.0.0.3"])),
        )]);

        let pass = reconciler
            .apply(&set(&["10.0.0.1", "10.0.0.2"]), GATEWAY)
            .await
            .unwrap();
        assert_eq!(pass.added, vec!["10.0.0.1"]);
        assert_eq!(pass.removed, vec!["10.0.0.3"]);

        let mut expected = base_expected();
        expected.push(add("10.0.0.1"));
        expected.push(remove("10.0.0.3"));
        assert_eq!(runner.log(), expected);
    }

    #[tokio::test]
    async fn test_apply_existing_selector_rule() {
        let (runner, _registry, reconciler) = reconciler();
        runner.set_results([(
            "ip rule list",
            FakeResult::ok(
                "0:\tfrom all lookup local\n\
                 32765:\tfrom all fwmark 0x9 lookup fusis.out\n\
                 32766:\tfrom all lookup main\n",
            ),
        )]);

        reconciler
            .apply(&set(&["10.0.0.1"]), GATEWAY)
            .await
            .unwrap();
        let mut expected = base_expected();
        expected.remove(2);
        expected.push(add("10.0.0.1"));
        assert_eq!(runner.log(), expected);
    }

    #[tokio::test]
    async fn test_apply_default_route_errors() {
        let (runner, _registry, reconciler) = reconciler();
        let route = "ip route add default via 192.168.1.1 table fusis.out";
        runner.set_results([(
            route,
            FakeResult::fail("RTNETLINK answers: File exists", "exit 2"),
        )]);
        reconciler
            .apply(&set(&["10.0.0.1"]), GATEWAY)
            .await
            .unwrap();

        runner.clear_log();
        runner.set_results([(
            route,
            FakeResult::fail("RTNETLINK answers: Unknown error", "exit 2"),
        )]);
        let err = reconciler
            .apply(&set(&["10.0.0.1"]), GATEWAY)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("RTNETLINK answers: Unknown error"));
        assert_eq!(runner.log(), base_expected()[..1].to_vec());
    }

    #[tokio::test]
    async fn test_apply_chain_create_error_aborts() {
        let (runner, _registry, reconciler) = reconciler();
        runner.set_results([(
            "iptables -t mangle -N FUSIS",
            FakeResult::fail("iptables: Chain already exists.", "exit 1"),
        )]);
        reconciler
            .apply(&set(&["10.0.0.1"]), GATEWAY)
            .await
            .unwrap();

        runner.clear_log();
        runner.set_results([(
            "iptables -t mangle -N FUSIS",
            FakeResult::fail("iptables: Other err.", "exit 1"),
        )]);
        let err = reconciler
            .apply(&set(&["10.0.0.1"]), GATEWAY)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit 1"));
        assert_eq!(runner.log(), base_expected()[..4].to_vec());
    }

    #[tokio::test]
    async fn test_apply_jump_check_error_aborts() {
        let (runner, _registry, reconciler) = reconciler();
        runner.set_results([(JUMP_CHECK, FakeResult::fail("iptables: Other err.", "exit 1"))]);

        let err = reconciler
            .apply(&set(&["10.0.0.1"]), GATEWAY)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("iptables: Other err."));
        assert_eq!(runner.log(), base_expected()[..5].to_vec());
    }

    #[tokio::test]
    async fn test_apply_registry_error_aborts() {
        let runner = Arc::new(FakeRunner::new());
        let reconciler = Reconciler::new(runner.clone(), "/nonexistent/fusis/rt_tables");

        let err = reconciler
            .apply(&set(&["10.0.0.1"]), GATEWAY)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry { .. }));
        assert!(runner.log().is_empty());
    }

    #[tokio::test]
    async fn test_apply_partial_failures() {
        let (runner, _registry, reconciler) = reconciler();
        runner.set_results([
            (
                "iptables -t mangle -A FUSIS -s 10.0.0.1 -j MARK --set-mark 9",
                FakeResult::fail("something", "errx1"),
            ),
            (
                "iptables -t mangle -A FUSIS -s 10.0.0.3 -j MARK --set-mark 9",
                FakeResult::fail("something", "errx2"),
            ),
        ]);

        let err = reconciler
            .apply(
                &set(&["10.0.0.4", "10.0.0.3", "10.0.0.2", "10.0.0.1"]),
                GATEWAY,
            )
            .await
            .unwrap_err();
        let Error::Multiple { errors, pass } = &err else {
            panic!("expected aggregate error, got {err}");
        };
        assert_eq!(
            errors,
            &vec![
                "error adding rule for 10.0.0.1: errx1: something".to_string(),
                "error adding rule for 10.0.0.3: errx2: something".to_string(),
            ]
        );
        assert_eq!(pass.added, vec!["10.0.0.2", "10.0.0.4"]);
        assert!(pass.removed.is_empty());
        assert_eq!(err.partial_pass(), Some(pass));

        assert_eq!(
            err.to_string(),
            "multiple errors: error adding rule for 10.0.0.1: errx1: something | \
             error adding rule for 10.0.0.3: errx2: something"
        );

        let mut expected = base_expected();
        for addr in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"] {
            expected.push(add(addr));
        }
        assert_eq!(runner.log(), expected);
    }

    #[tokio::test]
    async fn test_apply_remove_failure_is_reported() {
        let (runner, _registry, reconciler) = reconciler();
        runner.set_results([
            (
                "iptables-save -t mangle",
                FakeResult::ok(save_output(&["10.0.0.8", "10.0.0.9"])),
            ),
            (
                "iptables -t mangle -D FUSIS -s 10.0.0.8 -j MARK --set-mark 9",
                FakeResult::fail("iptables: Resource temporarily unavailable.", "exit 4"),
            ),
        ]);

        let err = reconciler.apply(&set(&[]), GATEWAY).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "multiple errors: error removing rule for 10.0.0.8: \
             exit 4: iptables: Resource temporarily unavailable."
        );
        assert_eq!(err.partial_pass().unwrap().removed, vec!["10.0.0.9"]);

        let mut expected = base_expected();
        expected.push(remove("10.0.0.8"));
        expected.push(remove("10.0.0.9"));
        assert_eq!(runner.log(), expected);
    }
}
