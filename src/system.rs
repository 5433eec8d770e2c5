//! Thin wrappers around the system tools the installer shells out to.
//!
//! Every command runs through [`ManagedProcess`] and has to exit with code 0
//! within the configured timeout. Linux-only tools succeed without doing
//! anything on other platforms.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use log::{debug, error, trace};

use crate::error::InstallerError;
use crate::process::{DEFAULT_SUCCESS_EXIT_TIMEOUT, ManagedProcess};

const IS_LINUX: bool = cfg!(target_os = "linux");

/// `uid:gid` of the user who started the installer through sudo.
pub fn sudo_user_group() -> Option<String> {
    let uid = std::env::var("SUDO_UID").ok().filter(|v| !v.is_empty())?;
    let gid = std::env::var("SUDO_GID").ok().filter(|v| !v.is_empty())?;
    Some(format!("{}:{}", uid, gid))
}

/// Whether the installer runs with root privileges.
pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Fail with [`InstallerError::PermissionDenied`] unless running as root.
pub fn require_root() -> Result<(), InstallerError> {
    if !IS_LINUX || is_root() {
        return Ok(());
    }
    Err(InstallerError::PermissionDenied)
}

#[derive(Debug, Clone)]
pub struct SystemTools {
    timeout: Duration,
    sudo_user_group: Option<String>,
}

impl Default for SystemTools {
    fn default() -> Self {
        Self::new(DEFAULT_SUCCESS_EXIT_TIMEOUT)
    }
}

impl SystemTools {
    /// Tools that give each command `timeout` to succeed. Ownership changes
    /// go to the sudo user, if any.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sudo_user_group: sudo_user_group(),
        }
    }

    pub fn with_sudo_user_group(mut self, user_group: Option<String>) -> Self {
        self.sudo_user_group = user_group;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `executable` and return its output if it exited with code 0.
    pub async fn run(&self, executable: &str, arguments: &str) -> Result<Vec<String>, InstallerError> {
        self.run_with_timeout(executable, arguments, self.timeout).await
    }

    pub async fn run_with_timeout(
        &self,
        executable: &str,
        arguments: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, InstallerError> {
        self.run_process(ManagedProcess::new(executable, arguments), timeout)
            .await
    }

    /// Like [`Self::run`], but logs and errors show `display_arguments`
    /// instead of `arguments`.
    pub async fn run_redacted(
        &self,
        executable: &str,
        arguments: &str,
        display_arguments: &str,
    ) -> Result<Vec<String>, InstallerError> {
        let process =
            ManagedProcess::new(executable, arguments).with_display_arguments(display_arguments);
        self.run_process(process, self.timeout).await
    }

    async fn run_process(
        &self,
        mut process: ManagedProcess,
        timeout: Duration,
    ) -> Result<Vec<String>, InstallerError> {
        debug!("Starting '{}'.", process.command_line());

        if process.run_and_wait_for_success_exit(timeout).await {
            Ok(process.output().to_vec())
        } else {
            error!("'{}' failed: {:?}", process.command_line(), process.outcome());
            Err(InstallerError::CommandFailed(process.command_line()))
        }
    }

    /// Hand `path` over to the sudo user, recursively.
    pub async fn chown(&self, path: &Path) -> Result<(), InstallerError> {
        trace!("(path:'{}')", path.display());

        if !IS_LINUX {
            trace!("(-)[NOT_LINUX]");
            return Ok(());
        }

        let Some(user_group) = self.sudo_user_group.as_deref() else {
            trace!("(-)[NOT_SUDO]");
            return Ok(());
        };

        self.run("chown", &format!("-R {} \"{}\"", user_group, path.display()))
            .await?;
        debug!("Owner of '{}' changed.", path.display());
        Ok(())
    }

    pub async fn chmod(&self, path: &Path, access_rights: &str) -> Result<(), InstallerError> {
        trace!("(path:'{}',access_rights:'{}')", path.display(), access_rights);

        if !IS_LINUX {
            trace!("(-)[NOT_LINUX]");
            return Ok(());
        }

        self.run("chmod", &format!("{} \"{}\"", access_rights, path.display()))
            .await?;
        debug!("Access rights of '{}' changed.", path.display());
        Ok(())
    }

    /// Full path of `file_name` as reported by `which`.
    pub async fn which(&self, file_name: &str) -> Option<String> {
        trace!("(file_name:'{}')", file_name);

        if !IS_LINUX {
            trace!("(-)[NOT_LINUX]:None");
            return None;
        }

        let res = match self.run("which", file_name).await {
            Ok(output) => output
                .first()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty()),
            Err(_) => {
                error!("Which on '{}' failed.", file_name);
                None
            }
        };

        trace!("(-):{:?}", res);
        res
    }

    pub async fn update_rcd(&self, arguments: &str) -> Result<(), InstallerError> {
        trace!("(arguments:'{}')", arguments);

        if !IS_LINUX {
            trace!("(-)[NOT_LINUX]");
            return Ok(());
        }

        self.run("update-rc.d", arguments).await?;
        debug!("update-rc.d succeeded.");
        Ok(())
    }

    /// Install the runlevel links of an init.d script.
    pub async fn update_rcd_install(
        &self,
        script_name: &str,
        startup_arguments: &str,
    ) -> Result<(), InstallerError> {
        self.update_rcd(&format!("{} {}", script_name, startup_arguments))
            .await
    }

    pub async fn update_rcd_remove(&self, script_name: &str) -> Result<(), InstallerError> {
        self.update_rcd(&format!("-f {} remove", script_name)).await
    }

    /// Write `contents` to `path` and hand it over to the sudo user.
    ///
    /// A failed ownership change is logged but does not fail the write.
    pub async fn write_file_chown(&self, path: &Path, contents: &str) -> Result<(), InstallerError> {
        write_file_atomic(path, contents)?;
        if let Err(e) = self.chown(path).await {
            error!("Unable to change owner of '{}': {}", path.display(), e);
        }
        Ok(())
    }
}

/// Write a file through a temporary sibling and rename it into place.
pub fn write_file_atomic(path: &Path, content: &str) -> Result<(), InstallerError> {
    write_bytes_atomic(path, content.as_bytes())
}

pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), InstallerError> {
    let temp_path = path.with_extension("tmp");

    {
        let mut file = fs::File::create(&temp_path).map_err(|e| {
            InstallerError::System(format!(
                "Failed to create '{}': {}",
                temp_path.display(),
                e
            ))
        })?;

        file.write_all(content).map_err(|e| {
            InstallerError::System(format!("Failed to write '{}': {}", temp_path.display(), e))
        })?;

        file.sync_all().map_err(|e| {
            InstallerError::System(format!("Failed to sync '{}': {}", temp_path.display(), e))
        })?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        InstallerError::System(format!(
            "Failed to move '{}' to '{}': {}",
            temp_path.display(),
            path.display(),
            e
        ))
    })?;

    Ok(())
}
