//! Storage-array offload copy through a vendor plugin
//!
//! The plugin executable lives at `/plugins/<vendor>` and owns the actual copy. It prints
//! progress lines such as `progress: 42%` on stdout; anything else is logged.

use crate::error::PopulatorError;
use crate::progress::ProgressReporter;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::info;

pub const DEFAULT_PLUGIN_DIR: &str = "/plugins";

/// One offload copy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XcopyRequest {
    pub storage_vendor_product: String,
    pub source_vm_id: String,
    /// `[DATASTORE] VM_NAME/DISK.vmdk`
    pub source_vmdk: String,
    pub target_namespace: String,
    /// Claim being populated
    pub owner_name: String,
    pub secret_name: String,
    pub migration_host: Option<String>,
}

impl XcopyRequest {
    /// Plugin executable for the vendor
    pub fn plugin_path(&self, plugin_dir: &Path) -> Result<PathBuf, PopulatorError> {
        let vendor = self.storage_vendor_product.as_str();
        let valid = !vendor.is_empty()
            && vendor
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !vendor.starts_with('.');
        if !valid {
            return Err(PopulatorError::Config(format!("invalid storage vendor product {:?}", vendor)));
        }
        Ok(plugin_dir.join(vendor))
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--source-vm-id={}", self.source_vm_id),
            format!("--source-vmdk={}", self.source_vmdk),
            format!("--target-namespace={}", self.target_namespace),
            format!("--target-pvc={}", self.owner_name),
            format!("--secret-name={}", self.secret_name),
        ];
        if let Some(host) = &self.migration_host {
            args.push(format!("--migration-host={}", host));
        }
        args
    }

    /// Run the plugin to completion
    pub async fn run(&self, plugin_dir: &Path, reporter: &mut ProgressReporter) -> Result<(), PopulatorError> {
        let plugin = self.plugin_path(plugin_dir)?;
        if !plugin.exists() {
            return Err(PopulatorError::Config(format!("plugin {} not found", plugin.display())));
        }
        info!("Running {} for {}", plugin.display(), self.source_vmdk);

        let mut child = Command::new(&plugin)
            .args(self.args())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                match parse_progress(&line) {
                    Some(pct) => reporter.set_percent(pct).await,
                    None => info!("plugin: {}", line),
                }
            }
        }

        let status = child.wait().await?;
        match status.code() {
            Some(0) => {
                reporter.finish().await;
                Ok(())
            }
            code => Err(PopulatorError::Plugin {
                code: code.unwrap_or(-1),
                message: format!("{} exited with {}", plugin.display(), status),
            }),
        }
    }
}

/// Parse `progress: 42%` (or `progress=42`)
pub fn parse_progress(line: &str) -> Option<u8> {
    let rest = line.trim().strip_prefix("progress")?;
    let value = rest.trim_start_matches([':', '=', ' ']).trim_end_matches('%').trim();
    value.parse::<u8>().ok().map(|p| p.min(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> XcopyRequest {
        XcopyRequest {
            storage_vendor_product: "vantara".to_string(),
            source_vm_id: "vm-42".to_string(),
            source_vmdk: "[datastore1] web/web.vmdk".to_string(),
            target_namespace: "mtv".to_string(),
            owner_name: "web-disk-0".to_string(),
            secret_name: "vsphere-secret".to_string(),
            migration_host: Some("esx-1".to_string()),
        }
    }

    #[test]
    fn test_plugin_path_rejects_traversal() {
        let dir = Path::new("/plugins");
        assert_eq!(request().plugin_path(dir).unwrap(), PathBuf::from("/plugins/vantara"));

        for bad in ["../bin/sh", "a/b", "", ".hidden"] {
            let mut req = request();
            req.storage_vendor_product = bad.to_string();
            assert!(req.plugin_path(dir).is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn test_args() {
        let args = request().args();
        assert!(args.contains(&"--source-vmdk=[datastore1] web/web.vmdk".to_string()));
        assert!(args.contains(&"--target-pvc=web-disk-0".to_string()));
        assert_eq!(args.last().unwrap(), "--migration-host=esx-1");
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("progress: 42%"), Some(42));
        assert_eq!(parse_progress("progress=7"), Some(7));
        assert_eq!(parse_progress("copying extent 3"), None);
        assert_eq!(parse_progress("progress: lots"), None);
    }
}
