//! Ports used by the installed servers

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::InstallerError;

/// Which of the two installers is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallerFlavor {
    /// Core wallet plus the server stack.
    FullNode,
    /// Server stack only.
    Server,
}

impl fmt::Display for InstallerFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallerFlavor::FullNode => write!(f, "full node"),
            InstallerFlavor::Server => write!(f, "server"),
        }
    }
}

/// Whether an interface must be reachable from the Internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortExposure {
    Public,
    /// Only the servers on this machine connect; picked without asking.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentPort {
    pub component: &'static str,
    pub interface: &'static str,
    pub default_port: u16,
    pub exposure: PortExposure,
    /// The user may answer 0 to not expose the interface at all.
    pub cancellable: bool,
}

/// Interface names, used as keys of the assigned ports.
pub mod interface {
    pub const CORE_WALLET_P2P: &str = "Core wallet P2P interface";
    pub const CORE_WALLET_RPC: &str = "Core wallet RPC interface";
    pub const LOC_LOCAL: &str = "LOC server local interface";
    pub const LOC_NODE: &str = "LOC server node interface";
    pub const LOC_CLIENT: &str = "LOC server client interface";
    pub const CAN_API: &str = "CAN server API interface";
    pub const CAN_SWARM: &str = "CAN server swarm interface";
    pub const CAN_GATEWAY: &str = "CAN server gateway interface";
    pub const PROFILE_PRIMARY: &str = "Profile server primary interface";
    pub const PROFILE_OTHER: &str = "Profile server other interfaces";
}

const CORE_WALLET: &str = "Core wallet";
const LOC_SERVER: &str = "LOC server";
const CAN_SERVER: &str = "CAN server";
const PROFILE_SERVER: &str = "Profile server";

const CORE_WALLET_PORTS: [ComponentPort; 2] = [
    ComponentPort {
        component: CORE_WALLET,
        interface: interface::CORE_WALLET_P2P,
        default_port: 4877,
        exposure: PortExposure::Public,
        cancellable: false,
    },
    ComponentPort {
        component: CORE_WALLET,
        interface: interface::CORE_WALLET_RPC,
        default_port: 8337,
        exposure: PortExposure::Public,
        cancellable: true,
    },
];

// Local interfaces come first so that public questions see them as taken.
const SERVER_PORTS: [ComponentPort; 8] = [
    ComponentPort {
        component: LOC_SERVER,
        interface: interface::LOC_LOCAL,
        default_port: 16982,
        exposure: PortExposure::Local,
        cancellable: false,
    },
    ComponentPort {
        component: LOC_SERVER,
        interface: interface::LOC_NODE,
        default_port: 16980,
        exposure: PortExposure::Public,
        cancellable: false,
    },
    ComponentPort {
        component: LOC_SERVER,
        interface: interface::LOC_CLIENT,
        default_port: 16981,
        exposure: PortExposure::Public,
        cancellable: false,
    },
    ComponentPort {
        component: CAN_SERVER,
        interface: interface::CAN_API,
        default_port: 15001,
        exposure: PortExposure::Local,
        cancellable: false,
    },
    ComponentPort {
        component: CAN_SERVER,
        interface: interface::CAN_SWARM,
        default_port: 14001,
        exposure: PortExposure::Public,
        cancellable: false,
    },
    ComponentPort {
        component: CAN_SERVER,
        interface: interface::CAN_GATEWAY,
        default_port: 18080,
        exposure: PortExposure::Public,
        cancellable: false,
    },
    ComponentPort {
        component: PROFILE_SERVER,
        interface: interface::PROFILE_PRIMARY,
        default_port: 16987,
        exposure: PortExposure::Public,
        cancellable: false,
    },
    ComponentPort {
        component: PROFILE_SERVER,
        interface: interface::PROFILE_OTHER,
        default_port: 16988,
        exposure: PortExposure::Public,
        cancellable: false,
    },
];

/// Ports the given installer asks for, in question order.
pub fn component_ports(flavor: InstallerFlavor) -> Vec<ComponentPort> {
    match flavor {
        InstallerFlavor::FullNode => CORE_WALLET_PORTS
            .iter()
            .chain(SERVER_PORTS.iter())
            .copied()
            .collect(),
        InstallerFlavor::Server => SERVER_PORTS.to_vec(),
    }
}

/// Ports already assigned during this installation, with the interface
/// that owns them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRegistry {
    used: BTreeMap<u16, String>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self, port: u16) -> Option<&str> {
        self.used.get(&port).map(String::as_str)
    }

    pub fn is_used(&self, port: u16) -> bool {
        self.used.contains_key(&port)
    }

    /// Assign `port` to `owner`.
    pub fn claim(&mut self, port: u16, owner: impl Into<String>) -> Result<(), InstallerError> {
        if let Some(current) = self.used.get(&port) {
            return Err(InstallerError::PortInUse {
                port,
                owner: current.clone(),
            });
        }

        let owner = owner.into();
        debug!("Port {} assigned to '{}'.", port, owner);
        self.used.insert(port, owner);
        Ok(())
    }

    /// Assign the first free port at or above `start` to `owner`.
    pub fn claim_next_free(
        &mut self,
        start: u16,
        owner: impl Into<String>,
    ) -> Result<u16, InstallerError> {
        let port = (start.max(1)..=u16::MAX)
            .find(|port| !self.is_used(*port))
            .ok_or_else(|| InstallerError::System(format!("No free port at or above {}", start)))?;
        self.claim(port, owner)?;
        Ok(port)
    }

    pub fn release(&mut self, port: u16) -> Option<String> {
        self.used.remove(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &str)> {
        self.used.iter().map(|(port, owner)| (*port, owner.as_str()))
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

/// Interpretation of a typed port number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortAnswer {
    Port(u16),
    Cancel,
    Invalid(String),
}

/// Parse a port answer; `0` cancels when `allow_cancel` is set.
pub fn parse_port_answer(answer: &str, allow_cancel: bool) -> PortAnswer {
    let trimmed = answer.trim();
    match trimmed.parse::<u16>() {
        Ok(0) if allow_cancel => PortAnswer::Cancel,
        Ok(port) if port > 0 => PortAnswer::Port(port),
        _ => PortAnswer::Invalid(trimmed.to_string()),
    }
}
