//! Interactive installation wizard
//!
//! Asks for the external IP address of the machine and for the ports of the
//! installed servers. Every public port is checked for reachability from the
//! Internet before it is accepted. The answers form an [`InstallationPlan`].

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::components::{ComponentConfigurator, ComponentLayout, GeoLocation, RpcSettings};
use crate::error::InstallerError;
use crate::port_check::{PortProbe, PortReachabilityChecker};
use crate::ports::{
    ComponentPort, InstallerFlavor, PortAnswer, PortExposure, PortRegistry, component_ports,
    parse_port_answer,
};
use crate::seed::SeedNodeClient;
use crate::system::{SystemTools, write_file_atomic};

pub const PLAN_FILE: &str = "installation-plan.toml";

/// What to do after a failed reachability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryChoice {
    CheckAgain,
    SelectDifferentPort,
}

/// Source of the user's answers.
pub trait Prompter {
    fn confirm(&mut self, message: &str, default: bool) -> Result<bool, InstallerError>;

    fn text(&mut self, message: &str, default: Option<&str>) -> Result<String, InstallerError>;

    /// Like [`Prompter::text`], without echoing the answer.
    fn password(&mut self, message: &str) -> Result<String, InstallerError>;

    fn retry_choice(&mut self, message: &str) -> Result<RetryChoice, InstallerError>;
}

/// Prompts on the terminal.
#[derive(Debug, Default)]
pub struct ConsolePrompter;

impl Prompter for ConsolePrompter {
    fn confirm(&mut self, message: &str, default: bool) -> Result<bool, InstallerError> {
        Ok(inquire::Confirm::new(message).with_default(default).prompt()?)
    }

    fn text(&mut self, message: &str, default: Option<&str>) -> Result<String, InstallerError> {
        let mut prompt = inquire::Text::new(message);
        if let Some(default) = default {
            prompt = prompt.with_default(default);
        }
        Ok(prompt.prompt()?)
    }

    fn password(&mut self, message: &str) -> Result<String, InstallerError> {
        Ok(inquire::Password::new(message)
            .without_confirmation()
            .prompt()?)
    }

    fn retry_choice(&mut self, message: &str) -> Result<RetryChoice, InstallerError> {
        const CHECK_AGAIN: &str = "Check again";
        const SELECT_DIFFERENT: &str = "Select a different port";

        let answer = inquire::Select::new(message, vec![CHECK_AGAIN, SELECT_DIFFERENT]).prompt()?;
        Ok(if answer == SELECT_DIFFERENT {
            RetryChoice::SelectDifferentPort
        } else {
            RetryChoice::CheckAgain
        })
    }
}

/// Result of the wizard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationPlan {
    pub flavor: InstallerFlavor,
    pub external_ip: IpAddr,
    /// Port of each server interface, keyed by the interface name.
    pub ports: BTreeMap<String, u16>,
}

impl InstallationPlan {
    /// Store the plan as TOML in `dir` and return the file path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, InstallerError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(PLAN_FILE);
        let content = toml::to_string_pretty(self)?;
        write_file_atomic(&path, &content)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, InstallerError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Port assigned to `interface`.
    pub fn port(&self, interface: &str) -> Option<u16> {
        self.ports.get(interface).copied()
    }
}

/// What the wizard produced.
#[derive(Debug, Clone)]
pub struct InstallationResult {
    pub plan: InstallationPlan,
    pub plan_path: PathBuf,
    /// Server configuration files written from the plan.
    pub config_files: Vec<PathBuf>,
}

pub struct Wizard<P, U> {
    checker: PortReachabilityChecker<P>,
    prompter: U,
    registry: PortRegistry,
}

impl<P: PortProbe, U: Prompter> Wizard<P, U> {
    pub fn new(checker: PortReachabilityChecker<P>, prompter: U) -> Self {
        Self {
            checker,
            prompter,
            registry: PortRegistry::new(),
        }
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn external_ip(&self) -> IpAddr {
        self.checker.public_ip()
    }

    /// Ask the user to confirm the installation. `false` means abort.
    pub fn intro(&mut self, flavor: InstallerFlavor) -> Result<bool, InstallerError> {
        show_banner(flavor);
        self.prompter.confirm("Would you like to continue?", true)
    }

    /// Ask for the external IP address, offering `detected` as the default.
    pub fn ask_for_external_ip(&mut self, detected: Option<IpAddr>) -> Result<IpAddr, InstallerError> {
        trace!("(detected:{:?})", detected);

        let default = detected.map(|ip| ip.to_string());
        let ip = loop {
            let answer = self
                .prompter
                .text("Enter external IP address of this machine:", default.as_deref())?;

            match answer.trim().parse::<IpAddr>() {
                Ok(ip) => break ip,
                Err(_) => {
                    write_error(&format!(
                        "'{}' is not a valid IP address. Please try again.",
                        answer.trim()
                    ));
                }
            }
        };

        self.checker.set_public_ip(ip);
        trace!("(-):{}", ip);
        Ok(ip)
    }

    /// Ask for a port that is reachable from the Internet and assign it to
    /// `service_name`.
    ///
    /// Returns `None` if the user cancelled with `0`, which is only accepted
    /// when `allow_cancel` is set.
    pub async fn ask_for_open_port(
        &mut self,
        message: &str,
        default: u16,
        service_name: &str,
        allow_cancel: bool,
    ) -> Result<Option<u16>, InstallerError> {
        trace!(
            "(default:{},service_name:'{}',allow_cancel:{})",
            default, service_name, allow_cancel
        );

        let default_answer = default.to_string();
        let res = loop {
            let answer = self.prompter.text(message, Some(&default_answer))?;

            match parse_port_answer(&answer, allow_cancel) {
                PortAnswer::Port(port) => {
                    if let Some(owner) = self.registry.owner(port) {
                        error!("Port {} is already used for '{}'.", port, owner);
                        write_error(&format!(
                            "Port {} is already used by {}. Please try different port.",
                            port, owner
                        ));
                        continue;
                    }

                    if self.check_port_open_ui(port).await? {
                        self.registry.claim(port, service_name)?;
                        break Some(port);
                    }
                    warn!("Port {} is not open.", port);
                }
                PortAnswer::Cancel => {
                    debug!("Port selection cancelled.");
                    break None;
                }
                PortAnswer::Invalid(answer) => {
                    error!("Invalid port number entered '{}'.", answer);
                    write_error(&format!(
                        "'{}' is not a valid port number. It has to be an integer between 1 and 65535. Please try again.",
                        answer
                    ));
                }
            }
        };

        trace!("(-):{:?}", res);
        Ok(res)
    }

    /// Check `port` until it is open or the user wants a different port.
    pub async fn check_port_open_ui(&mut self, port: u16) -> Result<bool, InstallerError> {
        trace!("(port:{})", port);

        let res = loop {
            write_progress(&format!(
                "Checking whether the TCP port {} can be accessed from the Internet by connecting to {}:{}... ",
                port,
                self.checker.public_ip(),
                port
            ));

            if self.checker.check_port_open(port).await {
                write_status(true);
                break true;
            }
            write_status(false);

            let choice = self.prompter.retry_choice(&format!(
                "TCP port {} is not open or an error occurred. How would you like to proceed?",
                port
            ))?;
            if choice == RetryChoice::SelectDifferentPort {
                break false;
            }
        };

        trace!("(-):{}", res);
        Ok(res)
    }

    /// Assign ports to every interface the installer sets up. Interfaces
    /// the user may decline are skipped unless `optional` is set.
    pub async fn assign_ports(
        &mut self,
        flavor: InstallerFlavor,
        optional: bool,
    ) -> Result<BTreeMap<String, u16>, InstallerError> {
        let mut assigned = BTreeMap::new();

        for port in component_ports(flavor) {
            if port.cancellable && !optional {
                debug!("Skipping optional {}.", port.interface);
                continue;
            }
            if let Some(number) = self.assign_port(&port).await? {
                assigned.insert(port.interface.to_string(), number);
            }
        }

        Ok(assigned)
    }

    /// Ask whether the Core wallet RPC server should run and for its
    /// credentials. `None` means no RPC server.
    pub fn ask_for_rpc_settings(&mut self) -> Result<Option<RpcSettings>, InstallerError> {
        if !self.prompter.confirm(
            "Would you like to run Core wallet RPC server (this is required if you want to mine)?",
            false,
        )? {
            return Ok(None);
        }

        let user = self
            .prompter
            .text("Enter RPC user name:", Some(crate::components::DEFAULT_RPC_USER))?;
        let password = self.prompter.password("Enter RPC password:")?;
        Ok(Some(RpcSettings {
            user: user.trim().to_string(),
            password,
        }))
    }

    /// Ask for the location the LOC server announces.
    pub fn ask_for_location(&mut self) -> Result<GeoLocation, InstallerError> {
        let latitude = self.ask_for_coordinate("Enter latitude of this machine:", 90.0)?;
        let longitude = self.ask_for_coordinate("Enter longitude of this machine:", 180.0)?;
        Ok(GeoLocation {
            latitude,
            longitude,
        })
    }

    fn ask_for_coordinate(&mut self, message: &str, limit: f64) -> Result<f64, InstallerError> {
        loop {
            let answer = self.prompter.text(message, Some("0"))?;
            match answer.trim().parse::<f64>() {
                Ok(value) if value.abs() <= limit => return Ok(value),
                _ => write_error(&format!(
                    "'{}' is not a number between -{} and {}. Please try again.",
                    answer.trim(),
                    limit,
                    limit
                )),
            }
        }
    }

    async fn assign_port(&mut self, port: &ComponentPort) -> Result<Option<u16>, InstallerError> {
        match port.exposure {
            PortExposure::Local => {
                let number = self
                    .registry
                    .claim_next_free(port.default_port, port.interface)?;
                debug!("Selected port {} as {}.", number, port.interface);
                Ok(Some(number))
            }
            PortExposure::Public => {
                if port.cancellable
                    && !self.prompter.confirm(
                        &format!(
                            "Would you like the {} to be accessible from the Internet?",
                            port.interface
                        ),
                        false,
                    )?
                {
                    return Ok(None);
                }

                let mut message = format!(
                    "Please enter a port number for {}. This port will have to be open and publicly accessible from the Internet.",
                    port.interface
                );
                if port.cancellable {
                    message.push_str(" If you changed your mind, enter 0.");
                }
                self.ask_for_open_port(&message, port.default_port, port.interface, port.cancellable)
                    .await
            }
        }
    }
}

/// Run the whole wizard, store the plan in `data_dir` and write the server
/// configuration files into `layout`.
pub async fn run<P: PortProbe, U: Prompter>(
    mut wizard: Wizard<P, U>,
    flavor: InstallerFlavor,
    seed: Option<&SeedNodeClient>,
    data_dir: &Path,
    layout: &ComponentLayout,
    tools: &SystemTools,
) -> anyhow::Result<Option<InstallationResult>> {
    use anyhow::Context;

    if !wizard.intro(flavor)? {
        return Ok(None);
    }

    let detected = match seed {
        Some(seed) => {
            write_progress("Trying to find out what is your external IP address... ");
            let ip = seed.external_ip().await;
            write_status(ip.is_some());
            ip
        }
        None => None,
    };
    let external_ip = wizard.ask_for_external_ip(detected)?;
    let rpc = match flavor {
        InstallerFlavor::FullNode => wizard.ask_for_rpc_settings()?,
        InstallerFlavor::Server => None,
    };
    let ports = wizard.assign_ports(flavor, rpc.is_some()).await?;
    let location = wizard.ask_for_location()?;

    let plan = InstallationPlan {
        flavor,
        external_ip,
        ports,
    };
    let path = plan
        .save(data_dir)
        .with_context(|| format!("Failed to save installation plan to {}", data_dir.display()))?;

    let config_files = ComponentConfigurator::new(&plan, layout)
        .with_rpc(rpc)
        .with_location(location)
        .write(tools)
        .await
        .context("Failed to write server configuration files")?;
    show_summary(&plan, &path);

    Ok(Some(InstallationResult {
        plan,
        plan_path: path,
        config_files,
    }))
}

fn show_banner(flavor: InstallerFlavor) {
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);

    let _ = stdout.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)));
    let _ = writeln!(
        stdout,
        "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━"
    );
    let _ = stdout.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)).set_bold(true));
    let _ = writeln!(stdout, "\n                 IoP {} installer", flavor);
    let _ = stdout.reset();

    let _ = writeln!(
        stdout,
        "\nYou will be asked several questions. Ports of the installed servers have to\n\
         be reachable from the Internet; each of them is checked before it is accepted."
    );

    let _ = stdout.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)));
    let _ = writeln!(
        stdout,
        "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n"
    );
    let _ = stdout.reset();
}

fn show_summary(plan: &InstallationPlan, path: &Path) {
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);

    let _ = stdout.set_color(ColorSpec::new().set_fg(Some(Color::Green)).set_bold(true));
    let _ = writeln!(stdout, "\nInstallation plan for {} saved to {}", plan.external_ip, path.display());
    let _ = stdout.reset();

    for (interface, port) in &plan.ports {
        let _ = writeln!(stdout, "  {:<40} {}", interface, port);
    }
    let _ = writeln!(stdout);
}

fn write_progress(message: &str) {
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);
    let _ = write!(stdout, "{}", message);
    let _ = stdout.flush();
}

fn write_status(ok: bool) {
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);
    let (color, text) = if ok { (Color::Green, "OK") } else { (Color::Red, "FAILED") };
    let _ = stdout.set_color(ColorSpec::new().set_fg(Some(color)));
    let _ = writeln!(stdout, "{}", text);
    let _ = stdout.reset();
}

fn write_error(message: &str) {
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);
    let _ = stdout.set_color(ColorSpec::new().set_fg(Some(Color::Red)));
    let _ = write!(stdout, "ERROR: ");
    let _ = stdout.reset();
    let _ = writeln!(stdout, "{}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_check::CheckerOptions;
    use crate::task::AsyncTask;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// Answers from a list, in order.
    struct ScriptedPrompter {
        answers: VecDeque<&'static str>,
    }

    impl ScriptedPrompter {
        fn new(answers: &[&'static str]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
            }
        }

        fn next(&mut self) -> Result<&'static str, InstallerError> {
            self.answers
                .pop_front()
                .ok_or_else(|| InstallerError::Prompt("no more answers".to_string()))
        }
    }

    impl Prompter for ScriptedPrompter {
        fn confirm(&mut self, _message: &str, _default: bool) -> Result<bool, InstallerError> {
            Ok(self.next()? == "y")
        }

        fn text(&mut self, _message: &str, default: Option<&str>) -> Result<String, InstallerError> {
            let answer = self.next()?;
            Ok(match (answer, default) {
                ("", Some(default)) => default.to_string(),
                _ => answer.to_string(),
            })
        }

        fn password(&mut self, _message: &str) -> Result<String, InstallerError> {
            Ok(self.next()?.to_string())
        }

        fn retry_choice(&mut self, _message: &str) -> Result<RetryChoice, InstallerError> {
            Ok(if self.next()? == "s" {
                RetryChoice::SelectDifferentPort
            } else {
                RetryChoice::CheckAgain
            })
        }
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("0.0.0.0:0").expect("bind ephemeral port");
        listener.local_addr().expect("local addr").port()
    }

    fn leak(port: u16) -> &'static str {
        Box::leak(port.to_string().into_boxed_str())
    }

    #[tokio::test]
    async fn invalid_and_used_ports_are_asked_again() {
        let port = free_port();
        let probe = |_: IpAddr, _: u16| AsyncTask::ready(true);
        let checker = PortReachabilityChecker::new(probe, LOCALHOST);
        let mut wizard = Wizard::new(checker, ScriptedPrompter::new(&["abc", "0", "4877", leak(port)]));
        wizard.registry.claim(4877, "Core wallet P2P interface").unwrap();

        let res = wizard
            .ask_for_open_port("port?", 16987, "Profile server primary interface", false)
            .await
            .unwrap();

        assert_eq!(res, Some(port));
        assert_eq!(
            wizard.registry().owner(port),
            Some("Profile server primary interface")
        );
    }

    #[tokio::test]
    async fn closed_port_offers_check_again_and_different_port() {
        let first = free_port();
        let second = free_port();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        // Closed twice, then open.
        let probe = move |_: IpAddr, _: u16| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            AsyncTask::ready(n >= 2)
        };
        let checker = PortReachabilityChecker::new(probe, LOCALHOST);
        let prompter = ScriptedPrompter::new(&[leak(first), "c", "s", leak(second)]);
        let mut wizard = Wizard::new(checker, prompter);

        let res = wizard
            .ask_for_open_port("port?", 16980, "LOC server node interface", false)
            .await
            .unwrap();

        assert_eq!(res, Some(second));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!wizard.registry().is_used(first));
    }

    #[tokio::test]
    async fn cancellable_port_accepts_zero() {
        let probe = |_: IpAddr, _: u16| AsyncTask::ready(true);
        let checker = PortReachabilityChecker::new(probe, LOCALHOST);
        let mut wizard = Wizard::new(checker, ScriptedPrompter::new(&["0"]));

        let res = wizard
            .ask_for_open_port("port?", 8337, "Core wallet RPC interface", true)
            .await
            .unwrap();
        assert_eq!(res, None);
        assert!(wizard.registry().is_empty());
    }

    #[test]
    fn external_ip_defaults_to_detected_address() {
        let probe = |_: IpAddr, _: u16| AsyncTask::ready(true);
        let checker = PortReachabilityChecker::new(probe, LOCALHOST);
        let mut wizard = Wizard::new(checker, ScriptedPrompter::new(&["not-an-ip", ""]));

        let detected = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2));
        assert_eq!(wizard.ask_for_external_ip(Some(detected)).unwrap(), detected);
        assert_eq!(wizard.external_ip(), detected);
    }

    #[tokio::test]
    async fn server_flavor_assigns_every_interface_in_test_mode() {
        let probe = |_: IpAddr, _: u16| AsyncTask::ready(false);
        let options = CheckerOptions {
            test_mode: true,
            ..CheckerOptions::default()
        };
        let checker = PortReachabilityChecker::new(probe, LOCALHOST).with_options(options);
        let prompter = ScriptedPrompter::new(&["50001", "50002", "50003", "50004", "50005", "50006"]);
        let mut wizard = Wizard::new(checker, prompter);

        let ports = wizard.assign_ports(InstallerFlavor::Server, true).await.unwrap();
        assert_eq!(ports.len(), 8);
        assert_eq!(ports["LOC server local interface"], 16982);
        assert_eq!(ports["CAN server API interface"], 15001);
        assert_eq!(ports["Profile server other interfaces"], 50006);
    }

    #[tokio::test]
    async fn full_node_without_rpc_skips_rpc_port() {
        let probe = |_: IpAddr, _: u16| AsyncTask::ready(false);
        let options = CheckerOptions {
            test_mode: true,
            ..CheckerOptions::default()
        };
        let checker = PortReachabilityChecker::new(probe, LOCALHOST).with_options(options);
        let prompter = ScriptedPrompter::new(&[
            "50001", "50002", "50003", "50004", "50005", "50006", "50007",
        ]);
        let mut wizard = Wizard::new(checker, prompter);

        let ports = wizard.assign_ports(InstallerFlavor::FullNode, false).await.unwrap();
        assert_eq!(ports.len(), 9);
        assert!(!ports.contains_key(crate::ports::interface::CORE_WALLET_RPC));
    }

    #[test]
    fn rpc_settings_and_location_are_asked() {
        let probe = |_: IpAddr, _: u16| AsyncTask::ready(true);
        let checker = PortReachabilityChecker::new(probe, LOCALHOST);
        let prompter = ScriptedPrompter::new(&["y", "", "s3cret", "n", "91", "48.5", "-3.25"]);
        let mut wizard = Wizard::new(checker, prompter);

        let rpc = wizard.ask_for_rpc_settings().unwrap().expect("rpc enabled");
        assert_eq!(rpc.user, "IoP");
        assert_eq!(rpc.password, "s3cret");
        assert_eq!(wizard.ask_for_rpc_settings().unwrap(), None);

        let location = wizard.ask_for_location().unwrap();
        assert_eq!(location.latitude, 48.5);
        assert_eq!(location.longitude, -3.25);
    }

    #[test]
    fn plan_round_trips_through_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let plan = InstallationPlan {
            flavor: InstallerFlavor::FullNode,
            external_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            ports: BTreeMap::from([("Core wallet P2P interface".to_string(), 4877)]),
        };

        let path = plan.save(&dir.path().join("data")).unwrap();
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(PLAN_FILE));
        assert_eq!(InstallationPlan::load(&path).unwrap(), plan);
        assert_eq!(plan.port("Core wallet P2P interface"), Some(4877));
        assert!(fs::read_to_string(&path).unwrap().contains("flavor = \"full-node\""));
    }
}
