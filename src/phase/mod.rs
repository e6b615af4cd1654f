pub mod cold_launch;
pub mod restart;
pub mod wait;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use self::cold_launch::{CloseApp, ColdLaunch};
use self::restart::{Restart, RestartMode};
use self::wait::{first_of, EntryWait, MemoryWait};
use crate::config::{PhaseKind, PhaseSection};
use crate::device::ui::UiDriver;
use crate::device::{Device, DeviceTags, Shell};
use crate::dispatcher::Dispatcher;
use crate::export::health::HarnessMetrics;
use crate::logcat::entry::{MemoryEntry, ParsedEntry, PerformanceEntry, ALL_MEMORY_METRICS};
use crate::report::format::{self, FormatContext, FormatError, FormattedPoint};
use crate::report::stats::{calculate_stats, render_table, PhaseStats};
use crate::report::Reporter;

/// Mark emitted by the home screen and system once they finish loading.
pub const FULLY_LOADED: &str = "fullyLoaded";

/// System mark for the end of the boot logo.
pub const OS_LOGO_END: &str = "osLogoEnd";

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Trial loop settings, fixed for the life of a phase.
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub title: String,
    pub runs: u32,
    pub timeout: Duration,
    pub retries: u32,
    pub test: String,
    /// Phase wall-clock start, used for point timestamps.
    pub start_ms: u64,
}

impl PhaseConfig {
    pub fn from_config(cfg: &PhaseSection, start_ms: u64) -> Self {
        Self {
            title: cfg.kind.title(&cfg.app),
            runs: cfg.runs,
            timeout: cfg.timeout,
            retries: cfg.retries,
            test: cfg.test_name().to_string(),
            start_ms,
        }
    }
}

/// Settings the scenarios read.
#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    pub app: String,
    pub entry_point: Option<String>,
    pub launch_delay: Duration,
    pub homescreen: String,
    pub system: String,
    pub memory: bool,
    pub trigger_gc: bool,
}

impl ScenarioOptions {
    pub fn from_config(cfg: &PhaseSection) -> Self {
        Self {
            app: cfg.app.clone(),
            entry_point: cfg.entry_point.clone().filter(|e| !e.is_empty()),
            launch_delay: cfg.launch_delay,
            homescreen: cfg.homescreen.clone(),
            system: cfg.system.clone(),
            memory: cfg.memory,
            trigger_gc: cfg.trigger_gc,
        }
    }
}

/// Entries captured during one trial attempt, in delivery order.
#[derive(Debug, Clone, Default)]
pub struct TrialBuffer {
    entries: Vec<ParsedEntry>,
}

impl TrialBuffer {
    pub fn push(&mut self, entry: ParsedEntry) {
        self.entries.push(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[ParsedEntry] {
        &self.entries
    }
}

/// "Fully loaded" flags for the home screen and the system.
#[derive(Debug, Default)]
pub struct Latches {
    homescreen: AtomicBool,
    system: AtomicBool,
}

impl Latches {
    pub fn reset(&self) {
        self.homescreen.store(false, Ordering::SeqCst);
        self.system.store(false, Ordering::SeqCst);
    }

    pub fn homescreen_loaded(&self) -> bool {
        self.homescreen.load(Ordering::SeqCst)
    }

    pub fn system_loaded(&self) -> bool {
        self.system.load(Ordering::SeqCst)
    }

    pub fn set_homescreen_loaded(&self) {
        self.homescreen.store(true, Ordering::SeqCst);
    }

    pub fn set_system_loaded(&self) {
        self.system.store(true, Ordering::SeqCst);
    }

    pub fn both_loaded(&self) -> bool {
        self.homescreen_loaded() && self.system_loaded()
    }
}

/// Filters or rewrites an entry before it enters the trial buffer.
pub type CaptureFn = Arc<dyn Fn(ParsedEntry) -> Option<ParsedEntry> + Send + Sync>;

/// State shared between the engine, the scenario and post-trial hooks.
pub struct PhaseContext<S, U> {
    device: Arc<Device<S>>,
    ui: Arc<U>,
    dispatcher: Dispatcher,
    options: ScenarioOptions,
    test: String,
    start_ms: u64,
    device_tags: DeviceTags,
    buffer: Arc<Mutex<TrialBuffer>>,
    cancel: Mutex<CancellationToken>,
    trial: AtomicU32,
    pids: Mutex<HashMap<String, u32>>,
    latches: Arc<Latches>,
    capture: Mutex<Option<CaptureFn>>,
}

impl<S: Shell, U: UiDriver> PhaseContext<S, U> {
    pub fn new(
        device: Arc<Device<S>>,
        ui: Arc<U>,
        dispatcher: Dispatcher,
        options: ScenarioOptions,
        config: &PhaseConfig,
    ) -> Self {
        let device_tags = device.tags();

        Self {
            device,
            ui,
            dispatcher,
            options,
            test: config.test.clone(),
            start_ms: config.start_ms,
            device_tags,
            buffer: Arc::new(Mutex::new(TrialBuffer::default())),
            cancel: Mutex::new(CancellationToken::new()),
            trial: AtomicU32::new(0),
            pids: Mutex::new(HashMap::new()),
            latches: Arc::new(Latches::default()),
            capture: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &Device<S> {
        &self.device
    }

    pub fn ui(&self) -> &U {
        &self.ui
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn options(&self) -> &ScenarioOptions {
        &self.options
    }

    pub fn latches(&self) -> &Arc<Latches> {
        &self.latches
    }

    pub fn device_tags(&self) -> &DeviceTags {
        &self.device_tags
    }

    /// Current trial, starting at 1.
    pub fn trial(&self) -> u32 {
        self.trial.load(Ordering::SeqCst)
    }

    /// Token of the current attempt.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    pub fn pid(&self, context: &str) -> Option<u32> {
        self.pids.lock().get(context).copied()
    }

    pub fn set_pid(&self, context: &str, pid: u32) {
        self.pids.lock().insert(context.to_string(), pid);
    }

    pub fn take_pid(&self, context: &str) -> Option<u32> {
        self.pids.lock().remove(context)
    }

    pub fn clear_pids(&self) {
        self.pids.lock().clear();
    }

    /// Deep copy of the current attempt's entries.
    pub fn buffer_snapshot(&self) -> Vec<ParsedEntry> {
        self.buffer.lock().entries().to_vec()
    }

    /// Route every dispatched entry through `capture` into the trial buffer.
    pub fn install_capture(&self, capture: CaptureFn) {
        *self.capture.lock() = Some(Arc::clone(&capture));
        self.attach_capture(capture);
    }

    /// Restart the log stream and attach the capture again.
    pub fn restart_stream(&self) {
        self.dispatcher.restart();

        let capture = self.capture.lock().clone();
        if let Some(capture) = capture {
            self.attach_capture(capture);
        }
    }

    fn attach_capture(&self, capture: CaptureFn) {
        let buffer = Arc::clone(&self.buffer);
        self.dispatcher.on_any(move |entry| {
            if let Some(entry) = capture(entry.clone()) {
                tracing::debug!(
                    kind = %entry.kind(),
                    name = entry.name(),
                    context = entry.context(),
                    "captured entry",
                );
                buffer.lock().push(entry);
            }
        });
    }

    /// Start watching for a performance entry.
    pub fn watch_entry(&self, name: &str, context: &str) -> EntryWait {
        EntryWait::new(&self.dispatcher, name, context)
    }

    /// Start watching for a full memory reading of `context`.
    pub fn watch_memory(&self, context: &str) -> MemoryWait {
        MemoryWait::new(&self.dispatcher, context, &ALL_MEMORY_METRICS)
    }

    /// Await a watched entry, bounded by the attempt's token.
    pub async fn wait(&self, wait: EntryWait) -> Result<PerformanceEntry> {
        let cancel = self.cancel_token();
        Ok(wait.wait(&cancel).await?)
    }

    pub async fn wait_for_entry(&self, name: &str, context: &str) -> Result<PerformanceEntry> {
        let wait = self.watch_entry(name, context);
        self.wait(wait).await
    }

    /// Log memory for `pid` as `context` and wait for all of it to come
    /// back through the stream.
    pub async fn log_memory_and_wait(&self, pid: u32, context: &str) -> Result<Vec<MemoryEntry>> {
        let wait = self.watch_memory(context);
        self.device.log_memory(pid, context).await?;

        let cancel = self.cancel_token();
        Ok(wait.wait(&cancel).await?)
    }

    /// Resolve once the home screen is fully loaded, recording its pid.
    pub async fn wait_for_homescreen(&self) -> Result<()> {
        if self.latches.homescreen_loaded() {
            return Ok(());
        }

        let wait = self.watch_entry(FULLY_LOADED, &self.options.homescreen);
        self.await_homescreen(wait).await
    }

    /// Complete a home screen wait created before the triggering action.
    pub async fn await_homescreen(&self, wait: EntryWait) -> Result<()> {
        tracing::debug!(context = %self.options.homescreen, "waiting for homescreen");

        let entry = self.wait(wait).await?;
        self.latches.set_homescreen_loaded();
        self.set_pid(&self.options.homescreen, entry.pid);
        Ok(())
    }

    /// Resolve once the system is fully loaded or has finished its boot
    /// logo, recording its pid.
    pub async fn wait_for_system(&self) -> Result<()> {
        if self.latches.system_loaded() {
            return Ok(());
        }

        tracing::debug!(context = %self.options.system, "waiting for system");

        let loaded = self.watch_entry(FULLY_LOADED, &self.options.system);
        let logo = self.watch_entry(OS_LOGO_END, &self.options.system);
        let cancel = self.cancel_token();
        let entry = first_of(loaded, logo, &cancel).await?;

        self.latches.set_system_loaded();
        self.set_pid(&self.options.system, entry.pid);
        Ok(())
    }

    /// Wait for both the home screen and the system.
    pub async fn wait_for_b2g_start(&self) -> Result<()> {
        tokio::try_join!(self.wait_for_homescreen(), self.wait_for_system())?;
        Ok(())
    }

    /// Format entries for the current trial.
    pub fn format(
        &self,
        entries: &[ParsedEntry],
        phase: &str,
        start_mark: &str,
    ) -> Result<Vec<FormattedPoint>, FormatError> {
        let ctx = FormatContext {
            start_ms: self.start_ms,
            trial: self.trial(),
            test: &self.test,
            phase,
            start_mark,
            device_tags: &self.device_tags,
        };
        format::format(entries, &ctx)
    }

    fn set_trial(&self, trial: u32) {
        self.trial.store(trial, Ordering::SeqCst);
    }

    /// Cancel the previous attempt and reset per-attempt state.
    fn begin_attempt(&self) {
        {
            let mut cancel = self.cancel.lock();
            cancel.cancel();
            *cancel = CancellationToken::new();
        }
        self.buffer.lock().clear();
        self.latches.reset();
    }

    fn cancel_attempt(&self) {
        self.cancel.lock().cancel();
    }
}

/// Scenario hooks driven by the trial engine.
pub trait Scenario<S: Shell, U: UiDriver>: Send + Sync {
    /// Suite name used as the `phase` tag.
    fn name(&self) -> &str;

    /// Entry the trial's values are measured from.
    fn start_mark(&self) -> &str;

    /// Bring the device to a ready state before the first trial.
    fn setup(&self, ctx: &PhaseContext<S, U>) -> impl Future<Output = Result<()>> + Send;

    /// Filter for entries entering the trial buffer. Keeps everything by
    /// default.
    fn capture(&self, _ctx: &PhaseContext<S, U>) -> CaptureFn {
        Arc::new(|entry: ParsedEntry| Some(entry))
    }

    /// Trigger the measured action and resolve once it has completed.
    fn test_run(&self, ctx: &PhaseContext<S, U>) -> impl Future<Output = Result<()>> + Send;

    /// Recover the device before a retried attempt.
    fn retry(&self, _ctx: &PhaseContext<S, U>) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Turn one trial's entries into points.
    fn handle_run(
        &self,
        ctx: &PhaseContext<S, U>,
        entries: &[ParsedEntry],
    ) -> Result<Vec<FormattedPoint>, FormatError>;
}

pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Runs after each completed trial, before its results are formatted.
pub trait PostTrialHook<S, U>: Send + Sync {
    fn name(&self) -> &str;

    fn run<'a>(&'a self, ctx: &'a PhaseContext<S, U>) -> HookFuture<'a>;
}

/// Asks the device to minimize memory between trials.
pub struct TriggerGc;

impl<S: Shell, U: UiDriver> PostTrialHook<S, U> for TriggerGc {
    fn name(&self) -> &str {
        "trigger-gc"
    }

    fn run<'a>(&'a self, ctx: &'a PhaseContext<S, U>) -> HookFuture<'a> {
        Box::pin(ctx.ui().trigger_gc())
    }
}

/// Hooks selected by the scenario options, after the scenario's own.
fn configured_hooks<S: Shell, U: UiDriver>(
    mut hooks: Vec<Box<dyn PostTrialHook<S, U>>>,
    options: &ScenarioOptions,
) -> Vec<Box<dyn PostTrialHook<S, U>>> {
    if options.trigger_gc {
        hooks.push(Box::new(TriggerGc));
    }
    hooks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Idle,
    Running { trial: u32, attempt: u32 },
    AwaitingCompletion { trial: u32, attempt: u32 },
    Retrying { trial: u32, attempt: u32 },
    TrialComplete { trial: u32 },
    End,
    Fatal,
}

#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("phase setup failed: {error:#}")]
    Setup { error: anyhow::Error },
    #[error("test timeout exceeded {}ms on run {trial} after {attempts} attempts", .timeout.as_millis())]
    Timeout {
        trial: u32,
        attempts: u32,
        timeout: Duration,
    },
    #[error("run {trial} failed: {error:#}")]
    Trial { trial: u32, error: anyhow::Error },
    #[error("post-trial hook {hook} failed on run {trial}: {error:#}")]
    Hook {
        trial: u32,
        hook: String,
        error: anyhow::Error,
    },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("reporting run {trial} failed: {error:#}")]
    Report { trial: u32, error: anyhow::Error },
}

impl PhaseError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Results of a phase that ran every trial.
#[derive(Debug)]
pub struct PhaseOutcome {
    /// Buffer of each completed trial.
    pub history: Vec<Vec<ParsedEntry>>,
    pub points: Vec<FormattedPoint>,
    pub stats: PhaseStats,
}

/// Runs the configured number of trials of one scenario.
pub struct TrialEngine<S, U, P> {
    config: PhaseConfig,
    scenario: P,
    ctx: PhaseContext<S, U>,
    hooks: Vec<Box<dyn PostTrialHook<S, U>>>,
    reporter: Reporter,
    metrics: Option<Arc<HarnessMetrics>>,
    state: Mutex<TrialState>,
    history: Vec<Vec<ParsedEntry>>,
    points: Vec<FormattedPoint>,
    terminated: bool,
}

impl<S: Shell, U: UiDriver, P: Scenario<S, U>> TrialEngine<S, U, P> {
    pub fn new(config: PhaseConfig, scenario: P, ctx: PhaseContext<S, U>, reporter: Reporter) -> Self {
        Self {
            config,
            scenario,
            ctx,
            hooks: Vec::new(),
            reporter,
            metrics: None,
            state: Mutex::new(TrialState::Idle),
            history: Vec::new(),
            points: Vec::new(),
            terminated: false,
        }
    }

    pub fn with_hooks(mut self, hooks: Vec<Box<dyn PostTrialHook<S, U>>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HarnessMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> TrialState {
        *self.state.lock()
    }

    pub fn context(&self) -> &PhaseContext<S, U> {
        &self.ctx
    }

    /// Run setup and every trial, then detach from the log stream.
    ///
    /// The first fatal error ends the phase; trials reported before it stay
    /// reported. The engine is left in `End` or `Fatal`.
    pub async fn run(&mut self) -> Result<PhaseOutcome, PhaseError> {
        let result = self.run_trials().await;
        self.terminate();

        match result {
            Ok(()) => {
                self.set_state(TrialState::End);

                let stats = calculate_stats(&self.points);
                tracing::info!(
                    phase = %self.config.title,
                    runs = self.history.len(),
                    "phase complete\n{}",
                    render_table(&stats),
                );

                Ok(PhaseOutcome {
                    history: std::mem::take(&mut self.history),
                    points: std::mem::take(&mut self.points),
                    stats,
                })
            }
            Err(e) => {
                self.set_state(TrialState::Fatal);
                tracing::error!(phase = %self.config.title, error = %e, "phase aborted");
                Err(e)
            }
        }
    }

    async fn run_trials(&mut self) -> Result<(), PhaseError> {
        self.ctx.dispatcher.start();

        tracing::info!(phase = %self.config.title, "Preparing to start testing");

        match tokio::time::timeout(self.config.timeout, self.scenario.setup(&self.ctx)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => return Err(PhaseError::Setup { error }),
            Err(_) => {
                return Err(PhaseError::Setup {
                    error: anyhow!("setup timed out after {:?}", self.config.timeout),
                })
            }
        }

        let capture = self.scenario.capture(&self.ctx);
        self.ctx.install_capture(capture);

        for trial in 1..=self.config.runs {
            self.run_trial(trial).await?;
        }

        Ok(())
    }

    async fn run_trial(&mut self, trial: u32) -> Result<(), PhaseError> {
        self.ctx.set_trial(trial);
        tracing::info!(phase = %self.config.title, trial, "Starting run");

        let mut attempt = 1;
        let started = loop {
            let started = Instant::now();
            self.ctx.begin_attempt();
            if let Some(m) = &self.metrics {
                m.trial_attempts.inc();
            }

            match tokio::time::timeout(self.config.timeout, self.attempt(trial, attempt)).await {
                Ok(Ok(())) => break started,
                Ok(Err(error)) => return Err(PhaseError::Trial { trial, error }),
                Err(_) => {
                    self.ctx.cancel_attempt();
                    if let Some(m) = &self.metrics {
                        m.trial_timeouts.inc();
                    }

                    if attempt > self.config.retries {
                        return Err(PhaseError::Timeout {
                            trial,
                            attempts: attempt,
                            timeout: self.config.timeout,
                        });
                    }

                    attempt += 1;
                    tracing::warn!(
                        phase = %self.config.title,
                        trial,
                        attempt,
                        "Run {trial} timed out, retry attempt {attempt}",
                    );
                    self.set_state(TrialState::Retrying { trial, attempt });
                }
            }
        };

        self.set_state(TrialState::TrialComplete { trial });

        for hook in &self.hooks {
            hook.run(&self.ctx).await.map_err(|error| PhaseError::Hook {
                trial,
                hook: hook.name().to_string(),
                error,
            })?;
        }

        let entries = self.ctx.buffer_snapshot();
        let points = self.scenario.handle_run(&self.ctx, &entries)?;

        self.reporter
            .report(&points)
            .await
            .map_err(|error| PhaseError::Report { trial, error })?;

        if let Some(m) = &self.metrics {
            m.trials_completed.inc();
            m.trial_duration.observe(started.elapsed().as_secs_f64());
        }

        tracing::info!(
            phase = %self.config.title,
            trial,
            entries = entries.len(),
            points = points.len(),
            "Run {trial} complete",
        );

        self.history.push(entries);
        self.points.extend(points);

        Ok(())
    }

    /// One attempt of a trial; retried attempts first clear the device log
    /// and run the scenario's retry hook.
    async fn attempt(&self, trial: u32, attempt: u32) -> Result<()> {
        self.set_state(TrialState::Running { trial, attempt });

        if attempt > 1 {
            self.ctx.device.clear_log().await?;
            self.scenario
                .retry(&self.ctx)
                .await
                .context("retry hook failed")?;
        }

        self.set_state(TrialState::AwaitingCompletion { trial, attempt });
        self.scenario.test_run(&self.ctx).await
    }

    fn set_state(&self, next: TrialState) {
        let mut state = self.state.lock();
        tracing::trace!(from = ?*state, to = ?next, "trial state");
        *state = next;
    }

    /// Cancel outstanding waits and release the stream. Safe to call twice.
    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        self.ctx.cancel_attempt();
        self.ctx.dispatcher.end();
    }
}

/// Run the phase selected by `kind` to completion.
pub async fn run_phase<S: Shell, U: UiDriver>(
    kind: PhaseKind,
    config: PhaseConfig,
    ctx: PhaseContext<S, U>,
    reporter: Reporter,
    metrics: Option<Arc<HarnessMetrics>>,
) -> Result<PhaseOutcome, PhaseError> {
    match kind {
        PhaseKind::ColdLaunch => {
            let hooks = configured_hooks(vec![Box::new(CloseApp)], ctx.options());
            let engine = TrialEngine::new(config, ColdLaunch, ctx, reporter).with_hooks(hooks);
            drive(engine, metrics).await
        }
        PhaseKind::Reboot => {
            let hooks = configured_hooks(Vec::new(), ctx.options());
            let engine = TrialEngine::new(config, Restart::new(RestartMode::Reboot), ctx, reporter)
                .with_hooks(hooks);
            drive(engine, metrics).await
        }
        PhaseKind::RestartB2g => {
            let hooks = configured_hooks(Vec::new(), ctx.options());
            let engine = TrialEngine::new(config, Restart::new(RestartMode::B2g), ctx, reporter)
                .with_hooks(hooks);
            drive(engine, metrics).await
        }
    }
}

async fn drive<S: Shell, U: UiDriver, P: Scenario<S, U>>(
    mut engine: TrialEngine<S, U, P>,
    metrics: Option<Arc<HarnessMetrics>>,
) -> Result<PhaseOutcome, PhaseError> {
    if let Some(m) = metrics {
        engine = engine.with_metrics(m);
    }
    engine.run().await
}
