//! SysV init.d scripts

use std::path::{Path, PathBuf};

use log::{debug, error, trace};

use super::{AutorunEntry, render_template};
use crate::error::InstallerError;
use crate::system::{SystemTools, write_file_atomic};

pub const INITD_DIR: &str = "/etc/init.d";

/// `update-rc.d` arguments used for the installed servers.
pub const DEFAULT_RUNLEVELS: &str = "start 99 2 3 4 5 . stop 1 0 1 6 .";

pub const SCRIPT_TEMPLATE: &str = r#"#!/bin/sh
### BEGIN INIT INFO
# Provides:          {NAME}
# Required-Start:    $remote_fs $syslog $network
# Required-Stop:     $remote_fs $syslog $network
# Default-Start:     2 3 4 5
# Default-Stop:      0 1 6
# Short-Description: {NAME}
### END INIT INFO

NAME="{NAME}"
USER="{USER}"
DIR="{PATH}"
BIN="{BIN}"
PIDFILE="/var/run/$NAME.pid"

case "$1" in
  start)
    echo "Starting $NAME"
    start-stop-daemon --start --background --make-pidfile --pidfile "$PIDFILE" \
      --chuid "$USER" --chdir "$DIR" --exec "$BIN" -- {ARGS}
    ;;
  stop)
    echo "Stopping $NAME"
    start-stop-daemon --stop --retry 30 --oknodo --pidfile "$PIDFILE"
    rm -f "$PIDFILE"
    ;;
  restart)
    "$0" stop
    "$0" start
    ;;
  status)
    start-stop-daemon --status --pidfile "$PIDFILE"
    ;;
  *)
    echo "Usage: $0 {start|stop|restart|status}"
    exit 1
    ;;
esac

exit 0
"#;

/// init.d scripts in one directory.
pub struct InitdScripts<'a> {
    tools: &'a SystemTools,
    dir: PathBuf,
}

impl<'a> InitdScripts<'a> {
    pub fn new(tools: &'a SystemTools) -> Self {
        Self {
            tools,
            dir: PathBuf::from(INITD_DIR),
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn script_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Render `template` into the script `name` and make it executable.
    pub async fn write_script(
        &self,
        name: &str,
        template: &str,
        entry: &AutorunEntry,
    ) -> Result<PathBuf, InstallerError> {
        let path = self.script_path(name);
        debug!("Creating init.d script '{}'.", path.display());

        let content = render_template(template, &entry.template_replacements());
        write_file_atomic(&path, &content)?;
        self.tools.chmod(&path, "a+x").await.map_err(|e| {
            error!("chmod on '{}' failed.", path.display());
            e
        })?;
        Ok(path)
    }

    /// Write the script and install its runlevel links.
    pub async fn install(
        &self,
        entry: &AutorunEntry,
        template: &str,
        update_rcd_args: &str,
    ) -> Result<(), InstallerError> {
        trace!("(name:'{}',update_rcd_args:'{}')", entry.name, update_rcd_args);

        self.write_script(&entry.name, template, entry).await?;
        self.tools
            .update_rcd_install(&entry.name, update_rcd_args)
            .await
            .map_err(|e| {
                error!("update-rc.d failed for '{}'.", entry.name);
                e
            })?;

        trace!("(-)");
        Ok(())
    }

    /// Remove the runlevel links and the script itself.
    pub async fn remove(&self, name: &str) -> Result<(), InstallerError> {
        trace!("(name:'{}')", name);

        self.tools.update_rcd_remove(name).await?;
        let path = self.script_path(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        trace!("(-)");
        Ok(())
    }

    /// Run `<dir>/<name> <action>`.
    pub async fn run(&self, name: &str, action: &str) -> Result<(), InstallerError> {
        trace!("(name:'{}',action:'{}')", name, action);

        let script = self.script_path(name);
        self.tools.run(&path_to_string(&script), action).await?;
        debug!("'{}' succeeded.", name);

        trace!("(-)");
        Ok(())
    }
}

fn path_to_string(path: &Path) -> String {
    path.display().to_string()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(super) async fn install(tools: &SystemTools, entry: &AutorunEntry) -> Result<(), InstallerError> {
    InitdScripts::new(tools)
        .install(entry, SCRIPT_TEMPLATE, DEFAULT_RUNLEVELS)
        .await
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(super) async fn remove(tools: &SystemTools, name: &str) -> Result<(), InstallerError> {
    InitdScripts::new(tools).remove(name).await
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(super) async fn start(tools: &SystemTools, name: &str) -> Result<(), InstallerError> {
    InitdScripts::new(tools).run(name, "start").await
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(super) async fn stop(tools: &SystemTools, name: &str) -> Result<(), InstallerError> {
    InitdScripts::new(tools).run(name, "stop").await
}
