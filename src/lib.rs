//! Installer for IoP full nodes and servers.
//!
//! The building blocks are a runner for external console programs
//! ([`process::ManagedProcess`]) and a checker that verifies that local TCP
//! ports are reachable from the Internet
//! ([`port_check::PortReachabilityChecker`]). The rest of the crate uses them
//! to configure the installed servers and register them with the operating
//! system.

pub mod autorun;
pub mod certificate;
pub mod components;
pub mod config;
pub mod error;
pub mod port_check;
pub mod ports;
pub mod process;
pub mod seed;
pub mod system;
pub mod task;
pub mod wizard;

pub use error::InstallerError;
pub use port_check::{CheckerOptions, PortProbe, PortReachabilityChecker};
pub use process::{ManagedProcess, ProcessOutcome, ProcessState};
