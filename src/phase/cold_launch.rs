use anyhow::Result;

use super::{HookFuture, PhaseContext, PostTrialHook, Scenario, FULLY_LOADED};
use crate::device::ui::UiDriver;
use crate::device::Shell;
use crate::logcat::entry::{ParsedEntry, PerformanceEntry};
use crate::report::format::{FormatError, FormattedPoint};

/// Suite name of cold launch points.
pub const SUITE: &str = "coldlaunch";

/// Mark the system emits when it starts launching an app.
pub const START_MARK: &str = "appLaunch";

/// Launches an app from a fresh process and measures it until fully
/// loaded, optionally followed by a memory reading.
pub struct ColdLaunch;

impl ColdLaunch {
    /// Launch the app and wait for it to report fully loaded.
    async fn launch<S: Shell, U: UiDriver>(
        &self,
        ctx: &PhaseContext<S, U>,
    ) -> Result<PerformanceEntry> {
        let opts = ctx.options();
        let loaded = ctx.watch_entry(FULLY_LOADED, &opts.app);

        // Give the preallocated process and the system time to settle.
        if !opts.launch_delay.is_zero() {
            tokio::time::sleep(opts.launch_delay).await;
        }

        ctx.ui().launch_app(&opts.app, opts.entry_point.as_deref()).await?;
        ctx.wait(loaded).await
    }

    /// Launch once and close, so first-run work is out of the way.
    async fn prime<S: Shell, U: UiDriver>(&self, ctx: &PhaseContext<S, U>) -> Result<()> {
        tracing::info!(app = %ctx.options().app, "Priming application");

        let entry = self.launch(ctx).await?;
        capture_app_pid(ctx, &entry);
        close_app(ctx).await
    }
}

impl<S: Shell, U: UiDriver> Scenario<S, U> for ColdLaunch {
    fn name(&self) -> &str {
        SUITE
    }

    fn start_mark(&self) -> &str {
        START_MARK
    }

    async fn setup(&self, ctx: &PhaseContext<S, U>) -> Result<()> {
        let opts = ctx.options();

        ctx.device().clear_log().await?;
        ctx.latches().reset();

        let homescreen = ctx.watch_entry(FULLY_LOADED, &opts.homescreen);
        ctx.device().restart_b2g().await?;
        ctx.await_homescreen(homescreen).await?;

        self.prime(ctx).await
    }

    async fn test_run(&self, ctx: &PhaseContext<S, U>) -> Result<()> {
        let entry = self.launch(ctx).await?;
        let pid = capture_app_pid(ctx, &entry);

        if ctx.options().memory {
            ctx.log_memory_and_wait(pid, &entry.context).await?;
        }

        Ok(())
    }

    async fn retry(&self, ctx: &PhaseContext<S, U>) -> Result<()> {
        close_app(ctx).await
    }

    fn handle_run(
        &self,
        ctx: &PhaseContext<S, U>,
        entries: &[ParsedEntry],
    ) -> Result<Vec<FormattedPoint>, FormatError> {
        let app = ctx.options().app.as_str();
        let own: Vec<ParsedEntry> = entries
            .iter()
            .filter(|entry| entry.context() == app)
            .cloned()
            .collect();

        ctx.format(&own, SUITE, START_MARK)
    }
}

/// Record the app pid from its fully loaded entry unless already known.
/// Entries from the home screen process are never taken as the app's.
fn capture_app_pid<S: Shell, U: UiDriver>(ctx: &PhaseContext<S, U>, entry: &PerformanceEntry) -> u32 {
    let opts = ctx.options();

    if let Some(pid) = ctx.pid(&opts.app) {
        return pid;
    }

    if ctx.pid(&opts.homescreen) != Some(entry.pid) {
        tracing::debug!(pid = entry.pid, app = %opts.app, "captured application pid");
        ctx.set_pid(&opts.app, entry.pid);
    }

    entry.pid
}

/// Kill the launched app, if one is running.
async fn close_app<S: Shell, U: UiDriver>(ctx: &PhaseContext<S, U>) -> Result<()> {
    let Some(pid) = ctx.take_pid(&ctx.options().app) else {
        return Ok(());
    };

    ctx.device().kill(pid).await
}

/// Closes the app after every trial.
pub struct CloseApp;

impl<S: Shell, U: UiDriver> PostTrialHook<S, U> for CloseApp {
    fn name(&self) -> &str {
        "close-app"
    }

    fn run<'a>(&'a self, ctx: &'a PhaseContext<S, U>) -> HookFuture<'a> {
        Box::pin(close_app(ctx))
    }
}
