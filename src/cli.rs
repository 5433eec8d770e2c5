use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use iop_installer::ports::InstallerFlavor;

#[derive(Parser, Debug)]
#[command(version, about = "IoP full node and server installer")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Report ports above the configured threshold as open without checking
    #[arg(long, global = true)]
    pub test_mode: bool,

    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Interactive installation wizard (default if no sub-command)
    Wizard {
        /// Which installer to run
        #[arg(long, value_enum, default_value_t = Flavor::FullNode)]
        flavor: Flavor,

        /// OpenSSL executable for the profile server certificate
        #[arg(long, default_value = "openssl")]
        openssl: PathBuf,
    },
    /// Check whether a local TCP port is reachable from the Internet
    /// (Exit 0 = open, 1 = closed)
    CheckPort {
        port: u16,

        /// Public IP address of this machine, asked from the seed nodes if omitted
        #[arg(long)]
        ip: Option<IpAddr>,
    },
    /// Print the public IP address of this machine as seen by the seed nodes
    ExternalIp,
    /// Run a program and print its combined output (Exit = program exit code)
    Exec {
        executable: String,

        /// Pre-quoted argument string
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        args: String,

        /// Lines written to the program's stdin
        #[arg(long)]
        input: Vec<String>,

        /// Wait timeout in milliseconds, the configured default if omitted
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Generate a self-signed PFX certificate with OpenSSL
    GenCert {
        /// Output PFX file
        out: PathBuf,

        /// OpenSSL executable
        #[arg(long, default_value = "openssl")]
        openssl: PathBuf,
    },
    /// Manage boot-time start of installed servers
    Autorun {
        #[command(subcommand)]
        action: AutorunCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum AutorunCmd {
    /// Register a program to start at boot
    Install {
        name: String,

        /// Program to run
        #[arg(long)]
        bin: PathBuf,

        /// Pre-quoted argument string
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        args: String,

        /// Account to run the program under
        #[arg(long)]
        user: String,

        /// Password of the account (Windows only)
        #[arg(long)]
        password: Option<String>,
    },
    /// Unregister a boot-time program
    Remove { name: String },
    /// Start a registered program now
    Start { name: String },
    /// Stop a registered program
    Stop { name: String },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    FullNode,
    Server,
}

impl From<Flavor> for InstallerFlavor {
    fn from(flavor: Flavor) -> Self {
        match flavor {
            Flavor::FullNode => InstallerFlavor::FullNode,
            Flavor::Server => InstallerFlavor::Server,
        }
    }
}
