//! Start installed servers together with the operating system
//!
//! - Linux: SysV init.d scripts registered through `update-rc.d`
//! - Windows: Task Scheduler tasks managed through `schtasks.exe`

pub mod initd;
pub mod schtasks;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::InstallerError;
use crate::system::SystemTools;

cfg_if::cfg_if! {
    if #[cfg(target_os = "windows")] {
        use schtasks as platform;
    } else if #[cfg(target_os = "linux")] {
        use initd as platform;
    } else {
        mod unsupported;
        use unsupported as platform;
    }
}

/// A program to be started at boot.
#[derive(Debug, Clone)]
pub struct AutorunEntry {
    /// Name of the init.d script or the scheduled task.
    pub name: String,
    pub executable: PathBuf,
    pub arguments: String,
    /// Account the program runs under.
    pub user: String,
    /// Password of `user`, needed by the Task Scheduler only.
    pub password: Option<String>,
    /// Additional template replacements, keyed by the literal pattern.
    pub replacements: BTreeMap<String, String>,
}

impl AutorunEntry {
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        arguments: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            arguments: arguments.into(),
            user: user.into(),
            password: None,
            replacements: BTreeMap::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_replacement(mut self, pattern: impl Into<String>, value: impl Into<String>) -> Self {
        self.replacements.insert(pattern.into(), value.into());
        self
    }

    /// Directory of the executable, used as the working directory.
    pub fn working_dir(&self) -> &Path {
        self.executable.parent().unwrap_or_else(|| Path::new("."))
    }

    /// `{USER}`, `{BIN}`, `{ARGS}`, `{PATH}` and `{NAME}` plus the extra
    /// replacements of this entry.
    pub fn template_replacements(&self) -> BTreeMap<String, String> {
        let mut replacements = BTreeMap::from([
            ("{USER}".to_string(), self.user.clone()),
            ("{BIN}".to_string(), self.executable.display().to_string()),
            ("{ARGS}".to_string(), self.arguments.clone()),
            ("{PATH}".to_string(), self.working_dir().display().to_string()),
            ("{NAME}".to_string(), self.name.clone()),
        ]);
        replacements.extend(self.replacements.clone());
        replacements
    }
}

/// Replace every literal pattern of `replacements` in `template`.
pub fn render_template(template: &str, replacements: &BTreeMap<String, String>) -> String {
    replacements
        .iter()
        .fold(template.to_string(), |content, (pattern, value)| {
            content.replace(pattern.as_str(), value)
        })
}

/// Register `entry` to start at boot.
pub async fn install(tools: &SystemTools, entry: &AutorunEntry) -> Result<(), InstallerError> {
    platform::install(tools, entry).await
}

/// Unregister the autorun entry `name`.
pub async fn remove(tools: &SystemTools, name: &str) -> Result<(), InstallerError> {
    platform::remove(tools, name).await
}

pub async fn start(tools: &SystemTools, name: &str) -> Result<(), InstallerError> {
    platform::start(tools, name).await
}

pub async fn stop(tools: &SystemTools, name: &str) -> Result<(), InstallerError> {
    platform::stop(tools, name).await
}
