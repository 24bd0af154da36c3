use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::supervisor::Settings;
use crate::{Error, Result};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Agent(AgentArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Docker address
    #[arg(
        short = 'd',
        long,
        env = "DOCKER_HOST",
        default_value = "unix:///var/run/docker.sock"
    )]
    pub docker: String,

    /// Label to lookup when listing docker containers
    #[arg(short = 'f', long, env = "FUSIS_LABEL_FILTER", default_value = "router=fusis")]
    pub label_filter: String,

    /// Interval between docker container listings
    #[arg(short = 'i', long, default_value = "1m", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Address of the fusis router
    #[arg(short = 'a', long, env = "FUSIS_ADDR")]
    pub fusis_addr: Option<String>,

    /// Routing table name registry
    #[arg(long, env = "FUSIS_RT_TABLES", default_value = fusis_nat::DEFAULT_RT_TABLES)]
    pub rt_tables: PathBuf,

    /// Timeout for every ip/iptables invocation
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub command_timeout: Duration,

    /// Run ip/iptables directly instead of through sudo
    #[arg(long)]
    pub no_sudo: bool,

    /// Metrics listener for agent
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}

impl AgentArgs {
    /// Validates the mandatory settings of the supervisor loop.
    pub fn settings(&self) -> Result<Settings> {
        let gateway = match self.fusis_addr.as_deref() {
            Some(addr) if !addr.is_empty() => addr.to_owned(),
            _ => return Err(Error::InvalidConfig("fusis address is mandatory".into())),
        };
        if self.label_filter.is_empty() {
            return Err(Error::InvalidConfig("label filter is mandatory".into()));
        }
        if self.interval.is_zero() {
            return Err(Error::InvalidConfig("interval is mandatory".into()));
        }
        Ok(Settings {
            gateway,
            label_filter: self.label_filter.clone(),
            interval: self.interval,
        })
    }
}
