pub mod entry;
pub mod parse;
pub mod stats;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::device::adb::AdbTarget;

/// Capacity of the shared line broadcast channel.
pub const LINE_CHANNEL_CAPACITY: usize = 65_536;

/// Raw line sender handed to a running source.
pub type LineSender = broadcast::Sender<Arc<str>>;

/// LineSource produces raw device log lines.
///
/// Uses enum dispatch so the connection manager can spawn any source
/// without boxing its future.
pub enum LineSource {
    Logcat(LogcatSource),
    Channel(ChannelSource),
}

impl LineSource {
    /// Returns the source name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Logcat(s) => s.name(),
            Self::Channel(s) => s.name(),
        }
    }

    /// Forward lines into `lines` until cancelled or the source ends.
    pub async fn run(&self, lines: LineSender, cancel: CancellationToken) -> Result<()> {
        match self {
            Self::Logcat(s) => s.run(lines, cancel).await,
            Self::Channel(s) => s.run(lines, cancel).await,
        }
    }
}

/// Streams `adb logcat -v threadtime` from the device.
pub struct LogcatSource {
    target: AdbTarget,
    capture: Option<PathBuf>,
}

impl LogcatSource {
    /// Creates a logcat source; `capture` tees raw lines to a local file.
    pub fn new(target: AdbTarget, capture: Option<PathBuf>) -> Self {
        Self { target, capture }
    }

    pub fn name(&self) -> &str {
        "logcat"
    }

    async fn run(&self, lines: LineSender, cancel: CancellationToken) -> Result<()> {
        let mut cmd = self.target.command();
        cmd.args(["logcat", "-v", "threadtime"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().context("spawning adb logcat")?;
        let stdout = child
            .stdout
            .take()
            .context("adb logcat stdout unavailable")?;

        let mut capture = match &self.capture {
            Some(path) => Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("opening logcat capture {}", path.display()))?,
            ),
            None => None,
        };

        let mut reader = BufReader::new(stdout).lines();

        tracing::debug!("logcat stream opened");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = reader.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(file) = capture.as_mut() {
                            file.write_all(line.as_bytes()).await.context("writing logcat capture")?;
                            file.write_all(b"\n").await.context("writing logcat capture")?;
                        }

                        // No receivers is fine: the dispatcher may be between trials.
                        let _ = lines.send(Arc::from(line));
                    }
                    Ok(None) => {
                        tracing::warn!("logcat stream ended");
                        break;
                    }
                    Err(e) => {
                        let _ = child.kill().await;
                        return Err(e).context("reading logcat stream");
                    }
                },
            }
        }

        if let Some(file) = capture.as_mut() {
            file.flush().await.context("flushing logcat capture")?;
        }

        let _ = child.kill().await;

        Ok(())
    }
}

/// In-process line feed, used for replaying captured logs and for tests.
///
/// Lines pushed while no connection is open are dropped, like a live device
/// log that nobody is reading.
#[derive(Clone)]
pub struct ChannelSource {
    feed: broadcast::Sender<Arc<str>>,
}

impl ChannelSource {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(LINE_CHANNEL_CAPACITY);
        Self { feed }
    }

    pub fn name(&self) -> &str {
        "channel"
    }

    /// Push one raw line. Returns the number of open connections that saw it.
    pub fn push(&self, line: impl Into<Arc<str>>) -> usize {
        self.feed.send(line.into()).unwrap_or(0)
    }

    async fn run(&self, lines: LineSender, cancel: CancellationToken) -> Result<()> {
        let mut feed = self.feed.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = feed.recv() => match line {
                    Ok(line) => {
                        let _ = lines.send(line);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "channel source lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference-counted owner of the single device log connection.
///
/// The first `acquire` opens the source; later callers attach to the open
/// connection. The last `release` cancels the source task.
pub struct ConnectionManager {
    source: Arc<LineSource>,
    state: Mutex<ConnectionState>,
}

#[derive(Default)]
struct ConnectionState {
    refs: usize,
    open: Option<Connection>,
}

struct Connection {
    lines: LineSender,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(source: LineSource) -> Self {
        Self {
            source: Arc::new(source),
            state: Mutex::new(ConnectionState::default()),
        }
    }

    /// Attach to the connection, opening it if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn acquire(&self) -> broadcast::Receiver<Arc<str>> {
        let mut state = self.state.lock();
        state.refs += 1;

        if let Some(conn) = &state.open {
            tracing::debug!(refs = state.refs, "reusing log connection");
            return conn.lines.subscribe();
        }

        let (lines, rx) = broadcast::channel(LINE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let source = Arc::clone(&self.source);
        let task_lines = lines.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = source.run(task_lines, task_cancel).await {
                tracing::error!(source = source.name(), error = %e, "log source failed");
            }
        });

        tracing::debug!(source = self.source.name(), "log connection opened");

        state.open = Some(Connection { lines, cancel });
        rx
    }

    /// Drop one reference; the last one closes the connection.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.refs == 0 {
            return;
        }

        state.refs -= 1;
        if state.refs == 0 {
            if let Some(conn) = state.open.take() {
                conn.cancel.cancel();
                tracing::debug!(source = self.source.name(), "log connection closed");
            }
        }
    }

    /// Number of live references.
    pub fn refs(&self) -> usize {
        self.state.lock().refs
    }

    /// Whether a connection is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open.is_some()
    }
}
