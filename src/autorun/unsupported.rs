//! Platforms without an autorun mechanism

use super::AutorunEntry;
use crate::error::InstallerError;
use crate::system::SystemTools;

fn unsupported() -> InstallerError {
    InstallerError::System(format!(
        "Autorun is not supported on {}",
        std::env::consts::OS
    ))
}

pub(super) async fn install(_tools: &SystemTools, _entry: &AutorunEntry) -> Result<(), InstallerError> {
    Err(unsupported())
}

pub(super) async fn remove(_tools: &SystemTools, _name: &str) -> Result<(), InstallerError> {
    Err(unsupported())
}

pub(super) async fn start(_tools: &SystemTools, _name: &str) -> Result<(), InstallerError> {
    Err(unsupported())
}

pub(super) async fn stop(_tools: &SystemTools, _name: &str) -> Result<(), InstallerError> {
    Err(unsupported())
}
