//! Self-signed PFX certificate generation through OpenSSL

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, trace};

use crate::error::InstallerError;
use crate::system::SystemTools;

/// Time the generation script gets to finish.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(20);

const KEY_FILE: &str = "cert.key";
const CERT_FILE: &str = "cert.cer";
// The intermediate key only lives in the scratch directory.
const KEY_PASSWORD: &str = "1234";

#[derive(Debug, Clone)]
pub struct PfxCertificateRequest {
    pub openssl: PathBuf,
    pub pfx_file: PathBuf,
    pub key_size: u32,
    pub validity_days: u32,
    pub subject: String,
    /// Value of `OPENSSL_CONF` for the script, required on Windows.
    pub openssl_conf: Option<PathBuf>,
}

impl PfxCertificateRequest {
    pub fn new(openssl: impl Into<PathBuf>, pfx_file: impl Into<PathBuf>) -> Self {
        Self {
            openssl: openssl.into(),
            pfx_file: pfx_file.into(),
            key_size: 4096,
            validity_days: 365000,
            subject: "/C=FM".to_string(),
            openssl_conf: None,
        }
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn openssl_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.openssl_conf = Some(path.into());
        self
    }

    /// Shell script creating the certificate, with intermediate files in
    /// `work_dir`.
    pub fn unix_script(&self, work_dir: &Path) -> String {
        let key = work_dir.join(KEY_FILE);
        let cer = work_dir.join(CERT_FILE);
        format!(
            "\"{openssl}\" req -x509 -newkey rsa:{bits} -keyout \"{key}\" -out \"{cer}\" -days {days} -subj \"{subj}\" -passout pass:{pass}\n\
             \"{openssl}\" pkcs12 -export -out \"{pfx}\" -inkey \"{key}\" -in \"{cer}\" -passin pass:{pass} -passout \"pass:\"\n\
             rm -f \"{key}\"\n\
             rm -f \"{cer}\"\n",
            openssl = self.openssl.display(),
            bits = self.key_size,
            key = key.display(),
            cer = cer.display(),
            days = self.validity_days,
            subj = self.subject,
            pass = KEY_PASSWORD,
            pfx = self.pfx_file.display(),
        )
    }

    /// Batch script equivalent of [`Self::unix_script`].
    pub fn windows_script(&self, work_dir: &Path) -> String {
        let key = work_dir.join(KEY_FILE);
        let cer = work_dir.join(CERT_FILE);
        let conf = self
            .openssl_conf
            .as_ref()
            .map(|conf| format!("@set \"OPENSSL_CONF={}\"\n", conf.display()))
            .unwrap_or_default();
        format!(
            "{conf}\
             @\"{openssl}\" req -x509 -newkey rsa:{bits} -keyout \"{key}\" -out \"{cer}\" -days {days} -subj \"{subj}\" -passout pass:{pass}\n\
             @\"{openssl}\" pkcs12 -export -out \"{pfx}\" -inkey \"{key}\" -in \"{cer}\" -passin pass:{pass} -passout \"pass:\"\n\
             @del \"{key}\"\n\
             @del \"{cer}\"\n",
            conf = conf,
            openssl = self.openssl.display(),
            bits = self.key_size,
            key = key.display(),
            cer = cer.display(),
            days = self.validity_days,
            subj = self.subject,
            pass = KEY_PASSWORD,
            pfx = self.pfx_file.display(),
        )
    }

    /// Run the generation script and check that the PFX file exists.
    pub async fn generate(&self, tools: &SystemTools) -> Result<(), InstallerError> {
        trace!(
            "(openssl:'{}',pfx_file:'{}')",
            self.openssl.display(),
            self.pfx_file.display()
        );

        let work_dir = tempfile::Builder::new()
            .prefix("iop-gencert")
            .tempdir()?;

        #[cfg(windows)]
        let (script, contents, shell, arguments) = {
            let script = work_dir.path().join("gencert.cmd");
            let arguments = format!("/C \"{}\"", script.display());
            (script, self.windows_script(work_dir.path()), "cmd.exe", arguments)
        };
        #[cfg(not(windows))]
        let (script, contents, shell, arguments) = {
            let script = work_dir.path().join("gencert.sh");
            let arguments = format!("-x \"{}\"", script.display());
            (script, self.unix_script(work_dir.path()), "bash", arguments)
        };

        tools.write_file_chown(&script, &contents).await?;

        if let Err(e) = tools
            .run_with_timeout(shell, &arguments, GENERATION_TIMEOUT)
            .await
        {
            error!("Certificate generation script failed.");
            return Err(e);
        }

        if let Err(e) = tools.chown(&self.pfx_file).await {
            debug!("Unable to change owner of '{}': {}", self.pfx_file.display(), e);
        }

        if !self.pfx_file.exists() {
            return Err(InstallerError::System(format!(
                "Certificate generation did not create '{}'",
                self.pfx_file.display()
            )));
        }

        trace!("(-)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_script_keeps_intermediates_in_work_dir() {
        let request = PfxCertificateRequest::new("/usr/bin/openssl", "/var/iop/ps.pfx");
        let script = request.unix_script(Path::new("/tmp/gencert"));

        assert!(script.starts_with(
            "\"/usr/bin/openssl\" req -x509 -newkey rsa:4096 -keyout \"/tmp/gencert/cert.key\""
        ));
        assert!(script.contains("-days 365000 -subj \"/C=FM\""));
        assert!(script.contains("pkcs12 -export -out \"/var/iop/ps.pfx\""));
        assert!(script.ends_with("rm -f \"/tmp/gencert/cert.cer\"\n"));
    }

    #[test]
    fn windows_script_sets_openssl_conf() {
        let request = PfxCertificateRequest::new("C:\\openssl.exe", "C:\\ps.pfx")
            .openssl_conf("C:\\openssl.cfg")
            .validity_days(10);
        let script = request.windows_script(Path::new("C:\\tmp"));

        assert!(script.starts_with("@set \"OPENSSL_CONF=C:\\openssl.cfg\"\n@\"C:\\openssl.exe\" req"));
        assert!(script.contains("-days 10 "));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn generate_checks_for_pfx_file() {
        let dir = tempfile::tempdir().unwrap();
        let fake_openssl = dir.path().join("openssl");
        // Creates the -out file of the pkcs12 step only.
        std::fs::write(
            &fake_openssl,
            "#!/bin/sh\nif [ \"$1\" = pkcs12 ]; then touch \"$4\"; fi\n",
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake_openssl, std::fs::Permissions::from_mode(0o755))
                .unwrap();
        }

        let tools = SystemTools::default().with_sudo_user_group(None);
        let pfx = dir.path().join("server.pfx");
        PfxCertificateRequest::new(&fake_openssl, &pfx)
            .generate(&tools)
            .await
            .unwrap();
        assert!(pfx.exists());
    }
}
