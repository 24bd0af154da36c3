use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::classify::{Applied, Condition, classify_route};
use crate::exec::CommandRunner;
use crate::{Error, Result};

pub const ROUTING_TABLE_ID: u32 = 100;
pub const ROUTING_TABLE_NAME: &str = "fusis.out";
pub const DEFAULT_RT_TABLES: &str = "/etc/iproute2/rt_tables";

/// Owns the `fusis.out` routing table, its default route and the fwmark
/// rule that sends marked packets into it.
pub struct PolicyRouting<R> {
    runner: R,
    registry: PathBuf,
    table_id: u32,
    table_name: String,
}

impl<R: CommandRunner> PolicyRouting<R> {
    pub fn new(runner: R, registry: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            registry: registry.into(),
            table_id: ROUTING_TABLE_ID,
            table_name: ROUTING_TABLE_NAME.into(),
        }
    }

    /// Appends the table to the registry unless its name is already present.
    pub fn ensure_routing_table_registered(&self) -> Result<Applied> {
        let data = fs::read(&self.registry).map_err(|e| self.registry_error(e))?;
        if String::from_utf8_lossy(&data).contains(&self.table_name) {
            return Ok(Applied::Unchanged);
        }

        info!(
            "registering routing table {} {} in {}",
            self.table_id,
            self.table_name,
            self.registry.display()
        );
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.registry)
            .map_err(|e| self.registry_error(e))?;
        file.write_all(format!("\n{} {}\n", self.table_id, self.table_name).as_bytes())
            .map_err(|e| self.registry_error(e))?;
        Ok(Applied::Changed)
    }

    pub async fn ensure_default_route(&self, gateway: &str) -> Result<Applied> {
        let result = self
            .runner
            .exec(
                "ip",
                &[
                    "route",
                    "add",
                    "default",
                    "via",
                    gateway,
                    "table",
                    self.table_name.as_str(),
                ],
            )
            .await;
        let applied = classify_route(result).tolerate(Condition::RouteExists)?;
        if applied == Applied::Unchanged {
            debug!("default route via {} already present", gateway);
        }
        Ok(applied)
    }

    pub async fn ensure_selector_rule(&self, mark: &str) -> Result<Applied> {
        let rules = self.runner.exec("ip", &["rule", "list"]).await?;
        if rules.contains(&format!("lookup {}", self.table_name)) {
            return Ok(Applied::Unchanged);
        }
        info!("adding fwmark {} rule for table {}", mark, self.table_name);
        self.runner
            .exec(
                "ip",
                &["rule", "add", "fwmark", mark, "table", self.table_name.as_str()],
            )
            .await?;
        Ok(Applied::Changed)
    }

    fn registry_error(&self, source: std::io::Error) -> Error {
        Error::Registry {
            path: self.registry.clone(),
            source,
        }
    }
}
