//! Seed node helper services
//!
//! Seed nodes run small HTTP scripts the installer relies on:
//! - `GET /getip` answers with the caller's public IP address
//! - `GET /portcheck?ip=..&port=..` tries to connect to the given endpoint and
//!   answers `OK` or `FAILED`
//!
//! Nodes are tried in random order until one gives a usable answer.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace};
use url::Url;

use crate::error::InstallerError;
use crate::port_check::PortProbe;
use crate::task::AsyncTask;

pub const DEFAULT_SEED_NODES: [&str; 4] = [
    "http://ham1.fermat.cloud:9090",
    "http://ham2.fermat.cloud:9090",
    "http://ham3.fermat.cloud:9090",
    "http://ham4.fermat.cloud:9090",
];

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Answer of the seed nodes to a port check request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortVerdict {
    /// A seed node connected to the port.
    Open,
    /// A seed node could not connect to the port.
    Closed,
    /// No seed node gave a valid answer.
    Undetermined,
}

impl PortVerdict {
    pub fn is_open(self) -> bool {
        self == PortVerdict::Open
    }
}

/// HTTP client for the seed node scripts.
#[derive(Clone)]
pub struct SeedNodeClient {
    client: reqwest::Client,
    nodes: Arc<[Url]>,
}

impl SeedNodeClient {
    /// Create a client for `nodes`, shuffled once.
    pub fn new<S: AsRef<str>>(
        nodes: &[S],
        request_timeout: Duration,
    ) -> Result<Self, InstallerError> {
        let mut urls = nodes
            .iter()
            .map(|node| {
                Url::parse(node.as_ref()).map_err(|e| {
                    InstallerError::Config(format!("Invalid seed node '{}': {}", node.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if urls.is_empty() {
            return Err(InstallerError::Config(
                "At least one seed node is required".to_string(),
            ));
        }
        fastrand::shuffle(&mut urls);

        let client = reqwest::Client::builder()
            .user_agent(concat!("iop-installer/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| InstallerError::System(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            nodes: urls.into(),
        })
    }

    /// Seed nodes in the order they are tried.
    pub fn nodes(&self) -> &[Url] {
        &self.nodes
    }

    /// Ask the seed nodes for the public IP address of this machine.
    pub async fn external_ip(&self) -> Option<IpAddr> {
        trace!("()");

        for seed in self.nodes.iter() {
            let Some(url) = external_ip_url(seed) else {
                error!("Unable to build external IP request for '{}'.", seed);
                continue;
            };

            match self.http_get(&url).await {
                Some(body) => match parse_external_ip(&body) {
                    Some(ip) => {
                        trace!("(-):{}", ip);
                        return Some(ip);
                    }
                    None => error!("Received invalid response from '{}'.", url),
                },
                None => error!("Request to '{}' failed.", url),
            }
        }

        trace!("(-):None");
        None
    }

    /// Ask the seed nodes whether `ip:port` accepts TCP connections.
    pub async fn port_verdict(&self, ip: IpAddr, port: u16) -> PortVerdict {
        trace!("(ip:{},port:{})", ip, port);

        for seed in self.nodes.iter() {
            let Some(url) = port_check_url(seed, ip, port) else {
                error!("Unable to build port check request for '{}'.", seed);
                continue;
            };

            match self.http_get(&url).await {
                Some(body) => match parse_port_check_response(&body) {
                    Some(verdict) => {
                        trace!("(-):{:?}", verdict);
                        return verdict;
                    }
                    None => error!("Invalid response received from '{}':\n{}", url, body),
                },
                None => error!("Request to '{}' failed.", url),
            }
        }

        trace!("(-):{:?}", PortVerdict::Undetermined);
        PortVerdict::Undetermined
    }

    /// Body of a successful GET, `None` on transport errors and non-2xx answers.
    async fn http_get(&self, url: &Url) -> Option<String> {
        debug!("Sending request to '{}'.", url);

        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Request to '{}' failed: {}", url, e);
                return None;
            }
        };

        if !response.status().is_success() {
            error!("Request to '{}' failed with status code {}.", url, response.status());
            return None;
        }

        match response.text().await {
            Ok(body) => Some(body),
            Err(e) => {
                error!("Reading response from '{}' failed: {}", url, e);
                None
            }
        }
    }
}

impl PortProbe for SeedNodeClient {
    fn check_port(&self, ip: IpAddr, port: u16) -> AsyncTask<bool> {
        let client = self.clone();
        AsyncTask::from_future(async move { client.port_verdict(ip, port).await })
            .map(PortVerdict::is_open)
    }
}

/// `{seed}/{script}`, keeping any path the seed base already has.
fn script_url(seed: &Url, script: &str) -> Option<Url> {
    let mut url = seed.clone();
    url.path_segments_mut().ok()?.pop_if_empty().push(script);
    Some(url)
}

fn external_ip_url(seed: &Url) -> Option<Url> {
    script_url(seed, "getip")
}

fn port_check_url(seed: &Url, ip: IpAddr, port: u16) -> Option<Url> {
    let mut url = script_url(seed, "portcheck")?;
    url.query_pairs_mut()
        .append_pair("ip", &ip.to_string())
        .append_pair("port", &port.to_string());
    Some(url)
}

fn parse_external_ip(body: &str) -> Option<IpAddr> {
    body.trim().parse().ok()
}

fn parse_port_check_response(body: &str) -> Option<PortVerdict> {
    match body.trim() {
        "OK" => Some(PortVerdict::Open),
        "FAILED" => Some(PortVerdict::Closed),
        _ => None,
    }
}
