use anyhow::{bail, Context, Result};
use tokio::process::Command;

use super::Shell;
use crate::config::DeviceConfig;

/// Addressing for one device behind an adb server.
#[derive(Debug, Clone, Default)]
pub struct AdbTarget {
    pub serial: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl AdbTarget {
    pub fn from_config(cfg: &DeviceConfig) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        Self {
            serial: non_empty(&cfg.serial),
            host: non_empty(&cfg.adb_host),
            port: cfg.adb_port,
        }
    }

    /// Base `adb` invocation with server and device selection applied.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new("adb");
        cmd.args(self.args());
        cmd.kill_on_drop(true);
        cmd
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(host) = &self.host {
            args.push("-H".to_string());
            args.push(host.clone());
        }
        if let Some(port) = self.port {
            args.push("-P".to_string());
            args.push(port.to_string());
        }
        if let Some(serial) = &self.serial {
            args.push("-s".to_string());
            args.push(serial.clone());
        }
        args
    }
}

/// Runs shell commands on the device through `adb shell`.
pub struct AdbShell {
    target: AdbTarget,
}

impl AdbShell {
    pub fn new(target: AdbTarget) -> Self {
        Self { target }
    }
}

impl Shell for AdbShell {
    async fn exec(&self, command: &str) -> Result<String> {
        let output = self
            .target
            .command()
            .arg("shell")
            .arg(command)
            .output()
            .await
            .with_context(|| format!("running adb shell {command:?}"))?;

        if !output.status.success() {
            bail!(
                "adb shell {command:?} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_include_only_configured_selectors() {
        assert!(AdbTarget::default().args().is_empty());

        let target = AdbTarget {
            serial: Some("emulator-5554".to_string()),
            host: Some("10.0.0.2".to_string()),
            port: Some(5037),
        };
        assert_eq!(
            target.args(),
            vec!["-H", "10.0.0.2", "-P", "5037", "-s", "emulator-5554"]
        );
    }

    #[test]
    fn test_from_config_skips_empty_fields() {
        let cfg = DeviceConfig {
            serial: "abc123".to_string(),
            ..Default::default()
        };
        let target = AdbTarget::from_config(&cfg);
        assert_eq!(target.serial.as_deref(), Some("abc123"));
        assert!(target.host.is_none());
        assert!(target.port.is_none());
    }
}
