use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use devbench::config::Config;
use devbench::device::adb::{AdbShell, AdbTarget};
use devbench::device::ui::ShellUiDriver;
use devbench::device::Device;
use devbench::dispatcher::registry::ParserDefinition;
use devbench::dispatcher::Dispatcher;
use devbench::export::health::HarnessMetrics;
use devbench::logcat::{ConnectionManager, LineSource, LogcatSource};
use devbench::phase::{now_ms, run_phase, PhaseConfig, PhaseContext, ScenarioOptions};
use devbench::report::stats::render_table;
use devbench::report::Reporter;

/// Device performance benchmarking harness.
#[derive(Parser)]
#[command(name = "devbench", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Override the number of trials.
    #[arg(long)]
    runs: Option<u32>,

    /// Override the retries allowed per trial.
    #[arg(long)]
    retries: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("devbench {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let mut cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let level = log_level(cli.log_level.as_deref(), &cfg);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if let Some(runs) = cli.runs {
        cfg.phase.runs = runs;
    }
    if let Some(retries) = cli.retries {
        cfg.phase.retries = retries;
    }
    cfg.validate()?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        phase = cfg.phase.kind.as_str(),
        "starting devbench",
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

/// The `--log-level` flag wins over the config file.
fn log_level<'a>(flag: Option<&'a str>, cfg: &'a Config) -> &'a str {
    flag.unwrap_or(&cfg.log_level)
}

async fn run(cfg: Config) -> Result<()> {
    let metrics = Arc::new(HarnessMetrics::new(&cfg.health.addr)?);
    metrics.start().await?;

    let target = AdbTarget::from_config(&cfg.device);
    let shell = Arc::new(AdbShell::new(target.clone()));
    let device = Arc::new(Device::connect(Arc::clone(&shell)).await?);
    let ui = Arc::new(ShellUiDriver::new(
        Arc::clone(&shell),
        cfg.device.launch_command.clone(),
        cfg.device.gc_command.clone(),
    ));

    let source = LogcatSource::new(target, cfg.device.logcat_capture.clone());
    let connections = Arc::new(ConnectionManager::new(LineSource::Logcat(source)));
    let dispatcher = Dispatcher::with_metrics(connections, Arc::clone(&metrics));
    dispatcher.register_parser(ParserDefinition::performance());
    dispatcher.register_parser(ParserDefinition::memory());

    let phase = PhaseConfig::from_config(&cfg.phase, now_ms());
    let options = ScenarioOptions::from_config(&cfg.phase);
    let ctx = PhaseContext::new(device, ui, dispatcher, options, &phase);

    let reporter = Reporter::from_config(&cfg.report)?.with_metrics(Arc::clone(&metrics));
    tracing::info!(sinks = ?reporter.sink_names(), title = %phase.title, "running phase");

    let result = tokio::select! {
        result = run_phase(cfg.phase.kind, phase, ctx, reporter, Some(Arc::clone(&metrics))) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            metrics.stop().await?;
            anyhow::bail!("interrupted");
        }
    };

    metrics.stop().await?;

    let outcome = result?;
    print!("{}", render_table(&outcome.stats));

    tracing::info!(points = outcome.points.len(), "devbench finished");

    Ok(())
}
