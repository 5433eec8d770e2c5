//! Windows Task Scheduler tasks
//!
//! Tasks are created from an XML definition so that they start at boot
//! under the given account, without a time limit.

use std::path::{Path, PathBuf};

use log::{debug, trace};

use super::{AutorunEntry, render_template};
use crate::error::InstallerError;
use crate::system::{SystemTools, write_bytes_atomic};

const IS_WINDOWS: bool = cfg!(target_os = "windows");

const SCHTASKS: &str = "schtasks.exe";
const REDACTED: &str = "***";

pub const TASK_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <Triggers>
    <BootTrigger>
      <Enabled>true</Enabled>
    </BootTrigger>
  </Triggers>
  <Principals>
    <Principal id="Author">
      <UserId>{USER}</UserId>
      <LogonType>Password</LogonType>
      <RunLevel>LeastPrivilege</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <AllowHardTerminate>true</AllowHardTerminate>
    <StartWhenAvailable>true</StartWhenAvailable>
    <RunOnlyIfNetworkAvailable>false</RunOnlyIfNetworkAvailable>
    <AllowStartOnDemand>true</AllowStartOnDemand>
    <Enabled>true</Enabled>
    <Hidden>false</Hidden>
    <ExecutionTimeLimit>PT0S</ExecutionTimeLimit>
    <Priority>7</Priority>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>{BIN}</Command>
      <Arguments>{ARGS}</Arguments>
      <WorkingDirectory>{PATH}</WorkingDirectory>
    </Exec>
  </Actions>
</Task>
"#;

/// Scheduled tasks whose definitions are staged in `staging_dir`.
pub struct ScheduledTasks<'a> {
    tools: &'a SystemTools,
    staging_dir: PathBuf,
    /// `None` outside Windows, where every command is skipped.
    executable: Option<String>,
}

impl<'a> ScheduledTasks<'a> {
    pub fn new(tools: &'a SystemTools) -> Self {
        Self {
            tools,
            staging_dir: std::env::temp_dir(),
            executable: IS_WINDOWS.then(|| SCHTASKS.to_string()),
        }
    }

    /// Run `executable` instead of `schtasks.exe`, on every platform.
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Write the task definition of `entry` and return its path.
    ///
    /// The file is UTF-16LE with a byte order mark, as its XML declaration says.
    pub fn write_definition(&self, entry: &AutorunEntry) -> Result<PathBuf, InstallerError> {
        let path = self.staging_dir.join(format!("{}.xml", entry.name));
        let content = render_template(TASK_TEMPLATE, &entry.template_replacements());
        write_bytes_atomic(&path, &utf16le_with_bom(&content))?;
        Ok(path)
    }

    pub async fn create(&self, entry: &AutorunEntry) -> Result<(), InstallerError> {
        trace!(
            "(name:'{}',executable:'{}',user:'{}')",
            entry.name,
            entry.executable.display(),
            entry.user
        );

        let xml = self.write_definition(entry)?;
        let password = entry.password.as_deref().unwrap_or_default();
        let res = self
            .schtasks_redacted(
                &create_arguments(&xml, entry, password),
                &create_arguments(&xml, entry, REDACTED),
            )
            .await;

        if let Err(e) = std::fs::remove_file(&xml) {
            debug!("Unable to remove '{}': {}", xml.display(), e);
        }

        trace!("(-):{}", res.is_ok());
        res
    }

    pub async fn run(&self, name: &str) -> Result<(), InstallerError> {
        self.schtasks(&format!("/run /tn {}", name)).await
    }

    pub async fn end(&self, name: &str) -> Result<(), InstallerError> {
        self.schtasks(&format!("/end /tn {}", name)).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), InstallerError> {
        self.schtasks(&format!("/delete /f /tn {}", name)).await
    }

    async fn schtasks(&self, arguments: &str) -> Result<(), InstallerError> {
        self.schtasks_redacted(arguments, arguments).await
    }

    async fn schtasks_redacted(
        &self,
        arguments: &str,
        display_arguments: &str,
    ) -> Result<(), InstallerError> {
        let Some(executable) = self.executable.as_deref() else {
            trace!("(-)[NOT_WINDOWS]");
            return Ok(());
        };

        self.tools
            .run_redacted(executable, arguments, display_arguments)
            .await?;
        debug!("schtasks succeeded.");
        Ok(())
    }
}

fn create_arguments(xml: &Path, entry: &AutorunEntry, password: &str) -> String {
    format!(
        "/create /xml \"{}\" /tn {} /ru {} /rp \"{}\"",
        xml.display(),
        entry.name,
        entry.user,
        password
    )
}

fn utf16le_with_bom(content: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    bytes.extend(content.encode_utf16().flat_map(u16::to_le_bytes));
    bytes
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(super) async fn install(tools: &SystemTools, entry: &AutorunEntry) -> Result<(), InstallerError> {
    ScheduledTasks::new(tools).create(entry).await
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(super) async fn remove(tools: &SystemTools, name: &str) -> Result<(), InstallerError> {
    ScheduledTasks::new(tools).delete(name).await
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(super) async fn start(tools: &SystemTools, name: &str) -> Result<(), InstallerError> {
    ScheduledTasks::new(tools).run(name).await
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(super) async fn stop(tools: &SystemTools, name: &str) -> Result<(), InstallerError> {
    ScheduledTasks::new(tools).end(name).await
}
