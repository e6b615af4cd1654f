use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for a benchmark run.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Device connection and UI command configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Phase selection and trial settings.
    #[serde(default)]
    pub phase: PhaseSection,

    /// Report sink configuration.
    #[serde(default)]
    pub report: ReportConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Device connection configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Device serial passed to adb. Empty selects the only attached device.
    #[serde(default)]
    pub serial: String,

    /// adb server host. Empty uses adb's default.
    #[serde(default)]
    pub adb_host: String,

    /// adb server port.
    #[serde(default)]
    pub adb_port: Option<u16>,

    /// Optional file receiving a copy of every raw log line.
    #[serde(default)]
    pub logcat_capture: Option<PathBuf>,

    /// Shell command that launches an app. Supports `{app}` and
    /// `{entry_point}` placeholders.
    #[serde(default)]
    pub launch_command: String,

    /// Shell command that asks the platform to minimize memory.
    #[serde(default)]
    pub gc_command: String,
}

/// Scenario that a phase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    ColdLaunch,
    Reboot,
    RestartB2g,
}

impl PhaseKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ColdLaunch => "cold_launch",
            Self::Reboot => "reboot",
            Self::RestartB2g => "restart_b2g",
        }
    }

    /// Human-readable phase title for logs.
    pub fn title(self, app: &str) -> String {
        match self {
            Self::ColdLaunch => format!("Cold Launch: {app}"),
            Self::Reboot => "Reboot".to_string(),
            Self::RestartB2g => "Restart B2G".to_string(),
        }
    }
}

impl Default for PhaseKind {
    fn default() -> Self {
        Self::ColdLaunch
    }
}

/// Phase and scenario configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PhaseSection {
    /// Scenario to run. Default: cold_launch.
    #[serde(default)]
    pub kind: PhaseKind,

    /// Number of trials. Default: 1.
    #[serde(default = "default_runs")]
    pub runs: u32,

    /// Per-attempt timeout. Default: 60s.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Retries allowed per trial after a timeout. Default: 1.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// App origin to cold launch, e.g. "clock.gaiamobile.org".
    #[serde(default)]
    pub app: String,

    /// Entry point for apps exposing several.
    #[serde(default)]
    pub entry_point: Option<String>,

    /// Pause before each launch. Default: 10s.
    #[serde(default = "default_launch_delay", with = "humantime_serde")]
    pub launch_delay: Duration,

    /// Home screen context. Default: "verticalhome.gaiamobile.org".
    #[serde(default = "default_homescreen")]
    pub homescreen: String,

    /// System context. Default: "system.gaiamobile.org".
    #[serde(default = "default_system")]
    pub system: String,

    /// Test name reported as the `test` tag. Default: the phase kind.
    #[serde(default)]
    pub test: String,

    /// Capture memory after each launch. Default: true.
    #[serde(default = "default_true")]
    pub memory: bool,

    /// Run `device.gc_command` after each trial. Default: false.
    #[serde(default)]
    pub trigger_gc: bool,
}

impl PhaseSection {
    /// Configured test name, falling back to the phase kind.
    pub fn test_name(&self) -> &str {
        if self.test.is_empty() {
            self.kind.as_str()
        } else {
            &self.test
        }
    }
}

/// Report sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Newline-delimited JSON file points are appended to.
    /// Default: "metrics.ldjson".
    #[serde(default = "default_metrics_file")]
    pub metrics_file: PathBuf,

    /// Optional InfluxDB-compatible sink.
    #[serde(default)]
    pub influx: InfluxConfig,
}

/// InfluxDB write configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    /// Enable the Influx sink.
    #[serde(default)]
    pub enabled: bool,

    /// Base URL, e.g. "http://localhost:8086".
    #[serde(default)]
    pub address: String,

    /// Target database.
    #[serde(default)]
    pub database: String,

    /// Basic auth username. Empty disables auth.
    #[serde(default)]
    pub username: String,

    /// Basic auth password.
    #[serde(default)]
    pub password: String,

    /// Body compression: "none" or "gzip". Default: "none".
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_influx_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address for /metrics and /healthz. Empty disables the server.
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_runs() -> u32 {
    1
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_retries() -> u32 {
    1
}

fn default_launch_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_homescreen() -> String {
    "verticalhome.gaiamobile.org".to_string()
}

fn default_system() -> String {
    "system.gaiamobile.org".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_file() -> PathBuf {
    PathBuf::from("metrics.ldjson")
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_influx_timeout() -> Duration {
    Duration::from_secs(10)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            device: DeviceConfig::default(),
            phase: PhaseSection::default(),
            report: ReportConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for PhaseSection {
    fn default() -> Self {
        Self {
            kind: PhaseKind::default(),
            runs: default_runs(),
            timeout: default_timeout(),
            retries: default_retries(),
            app: String::new(),
            entry_point: None,
            launch_delay: default_launch_delay(),
            homescreen: default_homescreen(),
            system: default_system(),
            test: String::new(),
            memory: true,
            trigger_gc: false,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            metrics_file: default_metrics_file(),
            influx: InfluxConfig::default(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            database: String::new(),
            username: String::new(),
            password: String::new(),
            compression: default_compression(),
            timeout: default_influx_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let phase = &self.phase;

        if phase.runs == 0 {
            bail!("phase.runs must be positive");
        }

        if phase.timeout.is_zero() {
            bail!("phase.timeout must be positive");
        }

        if phase.homescreen.is_empty() || phase.system.is_empty() {
            bail!("phase.homescreen and phase.system are required");
        }

        if phase.kind == PhaseKind::ColdLaunch {
            if phase.app.is_empty() {
                bail!("phase.app is required for cold_launch");
            }
            if self.device.launch_command.is_empty() {
                bail!("device.launch_command is required for cold_launch");
            }
        }

        if phase.trigger_gc && self.device.gc_command.is_empty() {
            bail!("device.gc_command is required when phase.trigger_gc is set");
        }

        let influx = &self.report.influx;
        if influx.enabled {
            if influx.address.is_empty() {
                bail!("report.influx.address is required when enabled");
            }
            if influx.database.is_empty() {
                bail!("report.influx.database is required when enabled");
            }
            url::Url::parse(&influx.address)
                .with_context(|| format!("invalid report.influx.address {:?}", influx.address))?;
        }

        match influx.compression.as_str() {
            "none" | "gzip" => {}
            other => bail!(
                "unsupported report.influx.compression {other:?} (expected none or gzip)"
            ),
        }

        if self.report.metrics_file.as_os_str().is_empty() {
            bail!("report.metrics_file is required");
        }

        Ok(())
    }
}
