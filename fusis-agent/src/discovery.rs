use std::collections::HashMap;
use std::future::Future;

use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::ContainerSummary;
use bollard::{API_DEFAULT_VERSION, Docker};
use tracing::{debug, error};

use crate::{Error, Result};

const CLIENT_TIMEOUT_SECS: u64 = 60;
const BRIDGE_NETWORK: &str = "bridge";

/// Source of the addresses that should be routed through the fusis gateway.
pub trait Discovery: Send + Sync {
    fn list_candidate_addresses(
        &self,
        label_filter: &str,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Unix(String),
    Http(String),
}

impl Endpoint {
    pub(crate) fn parse(endpoint: &str) -> Result<Self> {
        if let Some(path) = endpoint.strip_prefix("unix://")
            && !path.is_empty()
        {
            return Ok(Endpoint::Unix(path.into()));
        }
        for scheme in ["tcp://", "http://"] {
            if let Some(host) = endpoint.strip_prefix(scheme)
                && !host.is_empty()
            {
                return Ok(Endpoint::Http(endpoint.into()));
            }
        }
        // bare `host:port`
        if !endpoint.contains("://")
            && let Some((host, port)) = endpoint.rsplit_once(':')
            && !host.is_empty()
            && port.parse::<u16>().is_ok()
        {
            return Ok(Endpoint::Http(format!("tcp://{endpoint}")));
        }
        Err(Error::InvalidEndpoint(endpoint.into()))
    }
}

/// Lists running containers through the Docker API.
pub struct DockerDiscovery {
    client: Docker,
}

impl DockerDiscovery {
    pub fn connect(endpoint: &str) -> Result<Self> {
        let client = match Endpoint::parse(endpoint)? {
            Endpoint::Unix(path) => {
                Docker::connect_with_unix(&path, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            Endpoint::Http(addr) => {
                Docker::connect_with_http(&addr, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
        };
        debug!("docker client configured for {}", endpoint);
        Ok(Self { client })
    }

    async fn container_address(&self, container: &ContainerSummary) -> Option<String> {
        if let Some(ip) = bridge_address(container) {
            return Some(ip);
        }
        let id = container.id.as_deref()?;
        match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect
                .network_settings
                .and_then(|settings| settings.ip_address)
                .filter(|ip| !ip.is_empty()),
            Err(e) => {
                error!("error inspecting container {}: {}", id, e);
                None
            }
        }
    }
}

impl Discovery for DockerDiscovery {
    async fn list_candidate_addresses(&self, label_filter: &str) -> Result<Vec<String>> {
        let filters = HashMap::from([("label".to_string(), vec![label_filter.to_string()])]);
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await?;

        let mut addrs = Vec::with_capacity(containers.len());
        for container in &containers {
            match self.container_address(container).await {
                Some(ip) => addrs.push(ip),
                None => debug!("container {:?} has no address", container.id),
            }
        }
        addrs.sort();
        Ok(addrs)
    }
}

fn bridge_address(container: &ContainerSummary) -> Option<String> {
    container
        .network_settings
        .as_ref()?
        .networks
        .as_ref()?
        .get(BRIDGE_NETWORK)?
        .ip_address
        .clone()
        .filter(|ip| !ip.is_empty())
}
