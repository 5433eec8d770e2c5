//! Configuration files of the installed servers
//!
//! Each server gets its configuration rendered from a template with the ports
//! of the [`InstallationPlan`]. The CAN server writes its own configuration on
//! first start, so only its listening addresses are patched.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::autorun::render_template;
use crate::certificate::PfxCertificateRequest;
use crate::error::InstallerError;
use crate::ports::{InstallerFlavor, interface};
use crate::system::SystemTools;
use crate::wizard::InstallationPlan;

/// Core wallet `IoP.conf`.
pub const CORE_WALLET_CONF_TEMPLATE: &str = "debug=0
testnet=0
listen=1
port=$MAIN_PORT
server=$ENABLE_RPC
rpcuser=$RPC_USER
rpcpassword=$RPC_PASSWORD
rpcport=$RPC_PORT
rpcallowip=0.0.0.0/0
addnode=ham3.fermat.cloud
addnode=ham2.fermat.cloud
addnode=ham4.fermat.cloud
mine=$ENABLE_MINING
minewhitelistaddr=$MINING_LICENSE
minetoaddr=$MINE_TO_ADDR
";

/// LOC server command line options file.
pub const LOC_SERVER_CONF_TEMPLATE: &str = "--nodeid $NODE_ID
--nodeport $NODE_PORT
--clientport $CLIENT_PORT
--localport $LOCAL_PORT
--latitude $LATITUDE
--longitude $LONGITUDE
--logpath \"$LOG_FILE\"
--dbpath \"$DB_FILE\"
";

pub const PROFILE_SERVER_CONF_TEMPLATE: &str = "test_mode = off
external_server_address = $EXTERNAL_ADDR
bind_to_interface = 0.0.0.0
primary_interface_port = $PRIMARY_PORT
server_neighbor_interface_port = $NEIGHBOR_PORT
client_non_customer_interface_port = $NON_CUSTOMER_PORT
client_customer_interface_port = $CUSTOMER_PORT
client_app_service_interface_port = $APP_SERVICE_PORT
tls_server_certificate = $PFX_CERT_FILE
image_data_folder = $IMAGES_DIR
tmp_data_folder = $TMP_DIR
db_file_name = $DB_FILE
max_hosted_identities = 10000
max_identity_relations = 100
neighborhood_initialization_parallelism = 10
loc_port = $LOC_PORT
neighbor_profiles_expiration_time = 86400
max_neighborhood_size = 110
max_follower_servers_count = 200
follower_refresh_time = 43200
can_api_port = $CAN_API_PORT
";

/// RPC port of the Core wallet when it is not exposed to the Internet.
pub const DEFAULT_RPC_PORT: u16 = 8337;
pub const DEFAULT_RPC_USER: &str = "IoP";

// Ports in the configuration the CAN server generates on its first start.
const CAN_DEFAULT_SWARM_PORT: u16 = 14001;
const CAN_DEFAULT_API_PORT: u16 = 15001;
const CAN_DEFAULT_GATEWAY_PORT: u16 = 18080;

/// Data directories of the servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentLayout {
    pub core_wallet_dir: PathBuf,
    pub loc_server_dir: PathBuf,
    pub can_server_dir: PathBuf,
    pub profile_server_dir: PathBuf,
}

impl ComponentLayout {
    /// The servers' usual directories under `root`, normally the home directory.
    pub fn under(root: &Path) -> Self {
        Self {
            core_wallet_dir: root.join(".IoP"),
            loc_server_dir: root.join(".iop-locnet"),
            can_server_dir: root.join(".iopcan"),
            profile_server_dir: root.join(".IoP-ProfileServer"),
        }
    }

    pub fn core_wallet_conf(&self) -> PathBuf {
        self.core_wallet_dir.join("IoP.conf")
    }

    pub fn loc_server_conf(&self) -> PathBuf {
        self.loc_server_dir.join("iop-locnet.cfg")
    }

    pub fn can_server_conf(&self) -> PathBuf {
        self.can_server_dir.join("config")
    }

    pub fn profile_server_conf(&self) -> PathBuf {
        self.profile_server_dir.join("ProfileServer.conf")
    }

    /// TLS certificate of the profile server.
    pub fn profile_server_pfx(&self) -> PathBuf {
        self.profile_server_dir.join("ProfileServer.pfx")
    }

    /// Certificate request that writes to [`Self::profile_server_pfx`].
    pub fn profile_certificate(&self, openssl: impl Into<PathBuf>) -> PfxCertificateRequest {
        PfxCertificateRequest::new(openssl, self.profile_server_pfx())
    }
}

/// Credentials of the Core wallet RPC server.
#[derive(Clone, PartialEq, Eq)]
pub struct RpcSettings {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for RpcSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSettings")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Location the LOC server announces.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// A rendered configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub component: &'static str,
    pub path: PathBuf,
    pub contents: String,
}

/// Renders the configuration files of the servers of one installation plan.
pub struct ComponentConfigurator<'a> {
    plan: &'a InstallationPlan,
    layout: &'a ComponentLayout,
    rpc: Option<RpcSettings>,
    location: GeoLocation,
    loc_node_id: String,
}

impl<'a> ComponentConfigurator<'a> {
    pub fn new(plan: &'a InstallationPlan, layout: &'a ComponentLayout) -> Self {
        Self {
            plan,
            layout,
            rpc: None,
            location: GeoLocation::default(),
            loc_node_id: random_node_id(),
        }
    }

    /// Enable the Core wallet RPC server.
    pub fn with_rpc(mut self, rpc: Option<RpcSettings>) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_location(mut self, location: GeoLocation) -> Self {
        self.location = location;
        self
    }

    pub fn with_loc_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.loc_node_id = node_id.into();
        self
    }

    fn port(&self, name: &str) -> Result<u16, InstallerError> {
        self.plan.port(name).ok_or_else(|| {
            InstallerError::Config(format!("Installation plan has no port for '{}'", name))
        })
    }

    pub fn core_wallet_config(&self) -> Result<ConfigFile, InstallerError> {
        let rpc_port = self
            .plan
            .port(interface::CORE_WALLET_RPC)
            .unwrap_or(DEFAULT_RPC_PORT);
        let (enable_rpc, user, password) = match &self.rpc {
            Some(rpc) => ("1", rpc.user.as_str(), rpc.password.as_str()),
            None => ("0", DEFAULT_RPC_USER, ""),
        };

        let contents = render(
            CORE_WALLET_CONF_TEMPLATE,
            &[
                ("$MAIN_PORT", self.port(interface::CORE_WALLET_P2P)?.to_string()),
                ("$ENABLE_RPC", enable_rpc.to_string()),
                ("$RPC_USER", user.to_string()),
                ("$RPC_PASSWORD", password.to_string()),
                ("$RPC_PORT", rpc_port.to_string()),
                ("$ENABLE_MINING", "0".to_string()),
                ("$MINING_LICENSE", String::new()),
                ("$MINE_TO_ADDR", String::new()),
            ],
        );

        Ok(ConfigFile {
            component: "Core wallet",
            path: self.layout.core_wallet_conf(),
            contents,
        })
    }

    pub fn loc_server_config(&self) -> Result<ConfigFile, InstallerError> {
        let dir = &self.layout.loc_server_dir;
        let contents = render(
            LOC_SERVER_CONF_TEMPLATE,
            &[
                ("$NODE_ID", self.loc_node_id.clone()),
                ("$NODE_PORT", self.port(interface::LOC_NODE)?.to_string()),
                ("$CLIENT_PORT", self.port(interface::LOC_CLIENT)?.to_string()),
                ("$LOCAL_PORT", self.port(interface::LOC_LOCAL)?.to_string()),
                ("$LATITUDE", self.location.latitude.to_string()),
                ("$LONGITUDE", self.location.longitude.to_string()),
                ("$LOG_FILE", dir.join("iop-locnet.log").display().to_string()),
                ("$DB_FILE", dir.join("iop-locnet.sqlite").display().to_string()),
            ],
        );

        Ok(ConfigFile {
            component: "LOC server",
            path: self.layout.loc_server_conf(),
            contents,
        })
    }

    pub fn profile_server_config(&self) -> Result<ConfigFile, InstallerError> {
        let dir = &self.layout.profile_server_dir;
        let other = self.port(interface::PROFILE_OTHER)?.to_string();
        let contents = render(
            PROFILE_SERVER_CONF_TEMPLATE,
            &[
                ("$EXTERNAL_ADDR", self.plan.external_ip.to_string()),
                ("$PRIMARY_PORT", self.port(interface::PROFILE_PRIMARY)?.to_string()),
                ("$NEIGHBOR_PORT", other.clone()),
                ("$NON_CUSTOMER_PORT", other.clone()),
                ("$CUSTOMER_PORT", other.clone()),
                ("$APP_SERVICE_PORT", other),
                (
                    "$PFX_CERT_FILE",
                    self.layout.profile_server_pfx().display().to_string(),
                ),
                ("$IMAGES_DIR", dir.join("images").display().to_string()),
                ("$TMP_DIR", dir.join("tmp").display().to_string()),
                ("$DB_FILE", dir.join("ProfileServer.db").display().to_string()),
                ("$LOC_PORT", self.port(interface::LOC_LOCAL)?.to_string()),
                ("$CAN_API_PORT", self.port(interface::CAN_API)?.to_string()),
            ],
        );

        Ok(ConfigFile {
            component: "Profile server",
            path: self.layout.profile_server_conf(),
            contents,
        })
    }

    /// Every rendered configuration file of the plan's flavor.
    pub fn config_files(&self) -> Result<Vec<ConfigFile>, InstallerError> {
        let mut files = Vec::new();
        if self.plan.flavor == InstallerFlavor::FullNode {
            files.push(self.core_wallet_config()?);
        }
        files.push(self.loc_server_config()?);
        files.push(self.profile_server_config()?);
        Ok(files)
    }

    /// Write the configuration files, handing them over to the sudo user,
    /// and patch the CAN server configuration if it exists. Returns the
    /// written paths.
    pub async fn write(&self, tools: &SystemTools) -> Result<Vec<PathBuf>, InstallerError> {
        trace!("()");

        let profile_dir = &self.layout.profile_server_dir;
        for dir in [profile_dir.join("images"), profile_dir.join("tmp")] {
            fs::create_dir_all(&dir)?;
        }

        let mut written = Vec::new();
        for file in self.config_files()? {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent)?;
            }
            debug!(
                "Writing {} configuration to '{}'.",
                file.component,
                file.path.display()
            );
            tools.write_file_chown(&file.path, &file.contents).await?;
            written.push(file.path);
        }

        let can_conf = self.layout.can_server_conf();
        let ports = CanPorts {
            swarm: self.port(interface::CAN_SWARM)?,
            api: self.port(interface::CAN_API)?,
            gateway: self.port(interface::CAN_GATEWAY)?,
        };
        if update_can_config(tools, &can_conf, ports).await? {
            written.push(can_conf);
        }
        for dir in [
            &self.layout.core_wallet_dir,
            &self.layout.loc_server_dir,
            &self.layout.profile_server_dir,
        ] {
            if !dir.exists() {
                continue;
            }
            if let Err(e) = tools.chown(dir).await {
                debug!("Unable to change owner of '{}': {}", dir.display(), e);
            }
        }

        trace!("(-):{}", written.len());
        Ok(written)
    }
}

/// Listening ports of the CAN server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanPorts {
    pub swarm: u16,
    pub api: u16,
    pub gateway: u16,
}

/// Replace the default ports in the `"Addresses"` section of a CAN server
/// configuration.
pub fn rewrite_can_addresses(contents: &str, ports: CanPorts) -> String {
    let swarm = format!("tcp/{}", ports.swarm);
    let api = format!("tcp/{}", ports.api);
    let gateway = format!("tcp/{}", ports.gateway);
    let default_swarm = format!("tcp/{}", CAN_DEFAULT_SWARM_PORT);
    let default_api = format!("tcp/{}", CAN_DEFAULT_API_PORT);
    let default_gateway = format!("tcp/{}", CAN_DEFAULT_GATEWAY_PORT);

    let mut in_addresses = false;
    let mut lines = Vec::new();
    for line in contents.lines() {
        let mut line = line.to_string();
        if in_addresses {
            if line.contains(&format!("/ip4/0.0.0.0/{}", default_swarm))
                || line.contains(&format!("/ip6/::/{}", default_swarm))
            {
                line = line.replace(&default_swarm, &swarm);
            } else if line.contains(&format!("/ip4/127.0.0.1/{}", default_api)) {
                line = line.replace(&default_api, &api);
            } else if line.contains(&format!("/ip4/127.0.0.1/{}", default_gateway)) {
                line = line.replace(&default_gateway, &gateway);
            } else if line.trim_end().ends_with("},") {
                in_addresses = false;
            }
        } else {
            in_addresses = line.contains("\"Addresses\":");
        }
        lines.push(line);
    }

    let mut res = lines.join("\n");
    if contents.ends_with('\n') {
        res.push('\n');
    }
    res
}

/// Patch the CAN server configuration at `path`. Returns `false` if the
/// server has not created it yet.
pub async fn update_can_config(
    tools: &SystemTools,
    path: &Path,
    ports: CanPorts,
) -> Result<bool, InstallerError> {
    if !path.exists() {
        debug!(
            "CAN server configuration '{}' does not exist yet, skipping.",
            path.display()
        );
        return Ok(false);
    }

    let contents = fs::read_to_string(path)?;
    tools
        .write_file_chown(path, &rewrite_can_addresses(&contents, ports))
        .await?;
    Ok(true)
}

fn render(template: &str, values: &[(&str, String)]) -> String {
    let replacements = values
        .iter()
        .map(|(pattern, value)| (pattern.to_string(), value.clone()))
        .collect();
    render_template(template, &replacements)
}

fn random_node_id() -> String {
    format!("{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn plan(flavor: InstallerFlavor) -> InstallationPlan {
        let mut ports = BTreeMap::from([
            (interface::LOC_LOCAL.to_string(), 16982),
            (interface::LOC_NODE.to_string(), 26980),
            (interface::LOC_CLIENT.to_string(), 26981),
            (interface::CAN_API.to_string(), 15002),
            (interface::CAN_SWARM.to_string(), 24001),
            (interface::CAN_GATEWAY.to_string(), 28080),
            (interface::PROFILE_PRIMARY.to_string(), 26987),
            (interface::PROFILE_OTHER.to_string(), 26988),
        ]);
        if flavor == InstallerFlavor::FullNode {
            ports.insert(interface::CORE_WALLET_P2P.to_string(), 4877);
        }
        InstallationPlan {
            flavor,
            external_ip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)),
            ports,
        }
    }

    #[test]
    fn profile_server_config_uses_plan_and_certificate() {
        let plan = plan(InstallerFlavor::Server);
        let layout = ComponentLayout::under(Path::new("/home/iop"));
        let file = ComponentConfigurator::new(&plan, &layout)
            .profile_server_config()
            .unwrap();

        assert_eq!(file.path, Path::new("/home/iop/.IoP-ProfileServer/ProfileServer.conf"));
        assert!(file.contents.contains("external_server_address = 198.51.100.7\n"));
        assert!(file.contents.contains("primary_interface_port = 26987\n"));
        assert!(file.contents.contains("client_non_customer_interface_port = 26988\n"));
        assert!(file.contents.contains("client_customer_interface_port = 26988\n"));
        assert!(file.contents.contains("loc_port = 16982\n"));
        assert!(file.contents.contains("can_api_port = 15002\n"));
        assert!(!file.contents.contains('$'));

        let request = layout.profile_certificate("openssl");
        assert!(file.contents.contains(&format!(
            "tls_server_certificate = {}\n",
            request.pfx_file.display()
        )));
    }

    #[test]
    fn loc_server_config_has_ports_location_and_node_id() {
        let plan = plan(InstallerFlavor::Server);
        let layout = ComponentLayout::under(Path::new("/home/iop"));
        let file = ComponentConfigurator::new(&plan, &layout)
            .with_loc_node_id("abc123")
            .with_location(GeoLocation {
                latitude: 48.5,
                longitude: -3.25,
            })
            .loc_server_config()
            .unwrap();

        assert_eq!(
            file.contents,
            "--nodeid abc123\n--nodeport 26980\n--clientport 26981\n--localport 16982\n\
             --latitude 48.5\n--longitude -3.25\n\
             --logpath \"/home/iop/.iop-locnet/iop-locnet.log\"\n\
             --dbpath \"/home/iop/.iop-locnet/iop-locnet.sqlite\"\n"
        );
    }

    #[test]
    fn core_wallet_rpc_follows_settings() {
        let plan = plan(InstallerFlavor::FullNode);
        let layout = ComponentLayout::under(Path::new("/home/iop"));

        let disabled = ComponentConfigurator::new(&plan, &layout)
            .core_wallet_config()
            .unwrap();
        assert!(disabled.contents.contains("port=4877\nserver=0\n"));
        assert!(disabled.contents.contains(&format!("rpcport={}\n", DEFAULT_RPC_PORT)));
        assert!(disabled.contents.contains("mine=0\n"));

        let rpc = RpcSettings {
            user: "alice".to_string(),
            password: "pw".to_string(),
        };
        let enabled = ComponentConfigurator::new(&plan, &layout)
            .with_rpc(Some(rpc.clone()))
            .core_wallet_config()
            .unwrap();
        assert!(enabled.contents.contains("server=1\nrpcuser=alice\nrpcpassword=pw\n"));
        assert!(!format!("{:?}", rpc).contains("\"pw\""));
    }

    #[test]
    fn server_flavor_has_no_core_wallet_config() {
        let layout = ComponentLayout::under(Path::new("/home/iop"));

        let plan = plan(InstallerFlavor::Server);
        let files = ComponentConfigurator::new(&plan, &layout).config_files().unwrap();
        assert_eq!(
            files.iter().map(|f| f.component).collect::<Vec<_>>(),
            ["LOC server", "Profile server"]
        );

        let mut incomplete = plan.clone();
        incomplete.ports.remove(interface::LOC_NODE);
        assert!(matches!(
            ComponentConfigurator::new(&incomplete, &layout).config_files(),
            Err(InstallerError::Config(_))
        ));
    }

    #[test]
    fn can_addresses_are_rewritten_inside_section_only() {
        let config = r#"{
  "API": {
    "HTTPHeaders": null
  },
  "Addresses": {
    "API": "/ip4/127.0.0.1/tcp/15001",
    "Gateway": "/ip4/127.0.0.1/tcp/18080",
    "Swarm": [
      "/ip4/0.0.0.0/tcp/14001",
      "/ip6/::/tcp/14001"
    ]
  },
  "Other": "/ip4/127.0.0.1/tcp/15001"
}
"#;
        let ports = CanPorts {
            swarm: 24001,
            api: 15002,
            gateway: 28080,
        };
        let rewritten = rewrite_can_addresses(config, ports);

        assert!(rewritten.contains("\"API\": \"/ip4/127.0.0.1/tcp/15002\""));
        assert!(rewritten.contains("\"Gateway\": \"/ip4/127.0.0.1/tcp/28080\""));
        assert!(rewritten.contains("\"/ip4/0.0.0.0/tcp/24001\""));
        assert!(rewritten.contains("\"/ip6/::/tcp/24001\""));
        assert!(rewritten.contains("\"Other\": \"/ip4/127.0.0.1/tcp/15001\""));
        assert!(rewritten.ends_with("}\n"));
    }

    #[tokio::test]
    async fn writes_config_files_into_layout() {
        let root = tempfile::tempdir().unwrap();
        let layout = ComponentLayout::under(root.path());
        fs::create_dir_all(&layout.can_server_dir).unwrap();
        fs::write(
            layout.can_server_conf(),
            "{\n  \"Addresses\": {\n    \"API\": \"/ip4/127.0.0.1/tcp/15001\"\n  },\n}\n",
        )
        .unwrap();

        let plan = plan(InstallerFlavor::FullNode);
        let tools = SystemTools::default().with_sudo_user_group(None);
        let written = ComponentConfigurator::new(&plan, &layout)
            .write(&tools)
            .await
            .unwrap();

        assert_eq!(written.len(), 4);
        assert!(layout.core_wallet_conf().exists());
        assert!(layout.profile_server_dir.join("images").is_dir());
        assert!(
            fs::read_to_string(layout.can_server_conf())
                .unwrap()
                .contains("tcp/15002")
        );
    }
}
