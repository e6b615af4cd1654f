use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use super::{now_ms, CaptureFn, PhaseContext, Scenario, FULLY_LOADED};
use crate::device::ui::UiDriver;
use crate::device::Shell;
use crate::logcat::entry::{EntryType, ParsedEntry};
use crate::report::format::{FormatError, FormattedPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// Full device reboot.
    Reboot,
    /// Restart of the B2G system process only.
    B2g,
}

impl RestartMode {
    pub const fn suite(self) -> &'static str {
        match self {
            Self::Reboot => "reboot",
            Self::B2g => "restartb2g",
        }
    }

    pub const fn start_mark(self) -> &'static str {
        match self {
            Self::Reboot => "deviceReboot",
            Self::B2g => "deviceB2GStart",
        }
    }
}

/// Measures how long the home screen and system take to load after a
/// reboot or a B2G restart.
///
/// The device clock is unreliable across a restart, so captured entries
/// are stamped with host time instead.
pub struct Restart {
    mode: RestartMode,
    /// Host time the restart was issued at.
    start_ms: Arc<AtomicU64>,
}

impl Restart {
    pub fn new(mode: RestartMode) -> Self {
        Self {
            mode,
            start_ms: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<S: Shell, U: UiDriver> Scenario<S, U> for Restart {
    fn name(&self) -> &str {
        self.mode.suite()
    }

    fn start_mark(&self) -> &str {
        self.mode.start_mark()
    }

    async fn setup(&self, _ctx: &PhaseContext<S, U>) -> Result<()> {
        Ok(())
    }

    fn capture(&self, ctx: &PhaseContext<S, U>) -> CaptureFn {
        let latches = Arc::clone(ctx.latches());
        let start_ms = Arc::clone(&self.start_ms);
        let start_mark = self.mode.start_mark();
        let homescreen = ctx.options().homescreen.clone();
        let system = ctx.options().system.clone();

        Arc::new(move |mut entry: ParsedEntry| {
            let ParsedEntry::Performance(perf) = &mut entry else {
                return Some(entry);
            };

            let ignore = latches.both_loaded() && perf.entry_type == EntryType::Mark;

            perf.epoch = if perf.name == start_mark {
                start_ms.load(Ordering::SeqCst) as f64
            } else {
                now_ms() as f64
            };

            if ignore {
                return None;
            }

            if perf.name == FULLY_LOADED {
                if perf.context == homescreen {
                    latches.set_homescreen_loaded();
                } else if perf.context == system {
                    latches.set_system_loaded();
                }
            }

            Some(entry)
        })
    }

    async fn test_run(&self, ctx: &PhaseContext<S, U>) -> Result<()> {
        let opts = ctx.options();

        ctx.latches().reset();
        ctx.clear_pids();
        ctx.device().clear_log().await?;

        self.start_ms.store(now_ms(), Ordering::SeqCst);
        match self.mode {
            RestartMode::Reboot => ctx.device().reboot().await?,
            RestartMode::B2g => ctx.device().restart_b2g().await?,
        }
        ctx.device()
            .mark(&opts.system, self.mode.start_mark(), now_ms())
            .await?;

        // The old log connection does not survive the restart.
        ctx.restart_stream();
        ctx.wait_for_b2g_start().await?;

        let system_pid = ctx.pid(&opts.system).context("system pid not captured")?;
        let homescreen_pid = ctx
            .pid(&opts.homescreen)
            .context("homescreen pid not captured")?;

        tokio::try_join!(
            ctx.log_memory_and_wait(system_pid, &opts.system),
            ctx.log_memory_and_wait(homescreen_pid, &opts.homescreen),
        )?;

        Ok(())
    }

    fn handle_run(
        &self,
        ctx: &PhaseContext<S, U>,
        entries: &[ParsedEntry],
    ) -> Result<Vec<FormattedPoint>, FormatError> {
        ctx.format(entries, self.mode.suite(), self.mode.start_mark())
    }
}
