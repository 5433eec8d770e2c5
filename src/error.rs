//! Installer error taxonomy.
//!
//! The process runner and the port checker never return these: they recover
//! locally into boolean results. Everything built on top of them (autorun,
//! certificates, configuration, the wizard) reports through `InstallerError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("system error: {0}")]
    System(String),

    #[error("insufficient privileges, run the installer as root")]
    PermissionDenied,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("port {port} is already used by '{owner}'")]
    PortInUse { port: u16, owner: String },

    #[error("prompt failed: {0}")]
    Prompt(String),

    /// An external command ran but did not exit with code 0 in time.
    #[error("command '{0}' failed")]
    CommandFailed(String),
}

impl From<toml::de::Error> for InstallerError {
    fn from(e: toml::de::Error) -> Self {
        InstallerError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for InstallerError {
    fn from(e: toml::ser::Error) -> Self {
        InstallerError::Config(e.to_string())
    }
}

impl From<inquire::InquireError> for InstallerError {
    fn from(e: inquire::InquireError) -> Self {
        InstallerError::Prompt(e.to_string())
    }
}
