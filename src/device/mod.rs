pub mod adb;
pub mod ui;

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use crate::logcat::entry::ALL_MEMORY_METRICS;
use crate::logcat::parse::{parse_memory_columns, MemoryReading, MEMORY_TAG, PERFORMANCE_TAG};

/// Property prefix whose entries are surfaced as report tags.
pub const TAG_PREFIX: &str = "persist.devbench.";

/// Properties identifying the installed build, hashed into `revisionId`.
const REVISION_PROPERTIES: [&str; 2] = ["ro.build.fingerprint", "ro.build.version.incremental"];

/// Leading characters of each revision property fed to the hash.
const REVISION_PREFIX_LEN: usize = 16;

const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Device property map from `getprop`.
pub type Properties = BTreeMap<String, String>;

/// Identity tags attached to every reported point.
pub type DeviceTags = BTreeMap<String, String>;

/// Shell runs commands on the device.
pub trait Shell: Send + Sync {
    /// Run `command` and return its standard output.
    fn exec(&self, command: &str) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// A connected device and the operations the harness performs on it.
pub struct Device<S> {
    shell: Arc<S>,
    properties: Properties,
}

impl<S: Shell> Device<S> {
    /// Connect and load device properties.
    pub async fn connect(shell: Arc<S>) -> Result<Self> {
        let output = shell.exec("getprop").await.context("reading device properties")?;
        let properties = parse_properties(&output);
        if properties.is_empty() {
            bail!("device returned no properties");
        }

        tracing::info!(
            properties = properties.len(),
            model = properties.get("ro.product.model").map(String::as_str).unwrap_or("unknown"),
            "device connected",
        );

        Ok(Self::with_properties(shell, properties))
    }

    pub fn with_properties(shell: Arc<S>, properties: Properties) -> Self {
        Self { shell, properties }
    }

    pub fn shell(&self) -> &Arc<S> {
        &self.shell
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Identity tags derived from the device properties.
    pub fn tags(&self) -> DeviceTags {
        device_tags(&self.properties)
    }

    /// Clear the device log buffer.
    pub async fn clear_log(&self) -> Result<()> {
        self.shell
            .exec("logcat -c")
            .await
            .context("clearing device log")?;
        Ok(())
    }

    /// Write one record into the device log.
    pub async fn write_log(&self, priority: char, tag: &str, message: &str) -> Result<()> {
        let command = format!("log -p {} -t {tag} \"{message}\"", priority.to_ascii_lowercase());
        self.shell
            .exec(&command)
            .await
            .with_context(|| format!("writing {tag} log record"))?;
        Ok(())
    }

    /// Write a performance mark on behalf of `context`.
    pub async fn mark(&self, context: &str, name: &str, epoch_ms: u64) -> Result<()> {
        let message = format!("{context}|mark|{name}|0|0|{epoch_ms}");
        self.write_log('I', PERFORMANCE_TAG, &message).await
    }

    /// Read memory usage for `pid` and write it back into the log as
    /// memory records for `context`.
    pub async fn log_memory(&self, pid: u32, context: &str) -> Result<MemoryReading> {
        let output = self
            .shell
            .exec(&format!("b2g-info | grep \"{pid}\""))
            .await
            .context("reading process memory")?;

        let reading = parse_memory_columns(&output, pid)
            .with_context(|| format!("process {pid} not found in process info output"))?;

        for metric in ALL_MEMORY_METRICS {
            let message = format!("{context}|{metric}|{}", reading.get(metric));
            self.write_log('I', MEMORY_TAG, &message).await?;
        }

        tracing::debug!(pid, context, uss = reading.uss, pss = reading.pss, rss = reading.rss, "logged memory");

        Ok(reading)
    }

    pub async fn kill(&self, pid: u32) -> Result<()> {
        self.shell
            .exec(&format!("kill {pid}"))
            .await
            .with_context(|| format!("killing process {pid}"))?;
        Ok(())
    }

    /// Reboot and wait until the device reports boot completion.
    pub async fn reboot(&self) -> Result<()> {
        // The shell connection drops as the device goes down.
        if let Err(e) = self.shell.exec("reboot").await {
            tracing::debug!(error = %e, "reboot command returned an error");
        }

        self.wait_for_boot().await
    }

    /// Restart the B2G system process.
    pub async fn restart_b2g(&self) -> Result<()> {
        self.shell
            .exec("stop b2g; start b2g")
            .await
            .context("restarting b2g")?;
        Ok(())
    }

    async fn wait_for_boot(&self) -> Result<()> {
        let mut went_down = false;

        loop {
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;

            match self.shell.exec("getprop sys.boot_completed").await {
                Ok(out) if out.trim() == "1" => {
                    if went_down {
                        tracing::debug!("device boot completed");
                        return Ok(());
                    }
                }
                _ => went_down = true,
            }
        }
    }
}

/// Parse `getprop` output lines of the form `[key]: [value]`.
pub fn parse_properties(output: &str) -> Properties {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim().strip_prefix('[')?;
            let (key, value) = line.split_once("]: [")?;
            let value = value.strip_suffix(']')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Collect `persist.devbench.*` properties and the build revision hash.
pub fn device_tags(properties: &Properties) -> DeviceTags {
    let mut tags: DeviceTags = properties
        .iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(TAG_PREFIX)?;
            (!name.is_empty()).then(|| (name.to_string(), value.clone()))
        })
        .collect();

    if let Some(revision) = revision_id(properties) {
        tags.insert("revisionId".to_string(), revision);
    }

    tags
}

fn revision_id(properties: &Properties) -> Option<String> {
    let parts: Vec<&str> = REVISION_PROPERTIES
        .iter()
        .filter_map(|key| properties.get(*key))
        .map(|value| match value.char_indices().nth(REVISION_PREFIX_LEN) {
            Some((idx, _)) => &value[..idx],
            None => value.as_str(),
        })
        .collect();

    if parts.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();

    let mut id = String::with_capacity(40);
    for byte in digest.iter().take(20) {
        let _ = write!(id, "{byte:02x}");
    }
    Some(id)
}
