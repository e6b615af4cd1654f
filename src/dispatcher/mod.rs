pub mod registry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use self::registry::{Classification, ParserDefinition, ParserRegistry};
use crate::export::health::HarnessMetrics;
use crate::logcat::entry::{EntryKind, ParsedEntry};
use crate::logcat::parse::LogRecord;
use crate::logcat::stats::{EntryStats, EntryStatsSnapshot};
use crate::logcat::ConnectionManager;

/// Callback for typed entries.
pub type EntryHandler = Arc<dyn Fn(&ParsedEntry) + Send + Sync>;

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Listener {
    id: u64,
    /// `None` receives every kind.
    kind: Option<EntryKind>,
    handler: EntryHandler,
}

struct Inner {
    connections: Arc<ConnectionManager>,
    registry: RwLock<ParserRegistry>,
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
    live: AtomicBool,
    generation: AtomicU64,
    pump: Mutex<Option<CancellationToken>>,
    stats: EntryStats,
    metrics: Option<Arc<HarnessMetrics>>,
}

/// Classifies device log lines into typed entries and fans them out to
/// listeners.
///
/// Cloning yields another handle to the same dispatcher. `stop()` detaches
/// every listener and releases the log connection; lines already in flight
/// from a previous connection are discarded by a generation check.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self::build(connections, None)
    }

    pub fn with_metrics(connections: Arc<ConnectionManager>, metrics: Arc<HarnessMetrics>) -> Self {
        Self::build(connections, Some(metrics))
    }

    fn build(connections: Arc<ConnectionManager>, metrics: Option<Arc<HarnessMetrics>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections,
                registry: RwLock::new(ParserRegistry::new()),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                live: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                pump: Mutex::new(None),
                stats: EntryStats::new(),
                metrics,
            }),
        }
    }

    /// Append a parser to the registry.
    pub fn register_parser(&self, def: ParserDefinition) {
        self.inner.registry.write().register(def);
    }

    /// Attach to the shared log connection and start dispatching.
    ///
    /// A no-op while already started. Must be called from within a tokio
    /// runtime.
    pub fn start(&self) {
        let mut pump = self.inner.pump.lock();
        if pump.is_some() {
            return;
        }

        let mut rx = self.inner.connections.acquire();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.live.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        *pump = Some(cancel.clone());

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = rx.recv() => line,
                };

                let Some(inner) = inner.upgrade() else {
                    break;
                };

                match line {
                    Ok(line) => {
                        if !inner.accepts(generation) {
                            if let Some(m) = &inner.metrics {
                                m.late_lines_dropped.inc();
                            }
                            break;
                        }
                        inner.dispatch_line(&line);
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "dispatcher lagged behind log stream");
                        if let Some(m) = &inner.metrics {
                            m.lines_lagged.inc_by(n as f64);
                        }
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("log connection closed");
                        break;
                    }
                }
            }
        });

        tracing::debug!(generation, "dispatcher started");
    }

    /// Detach all listeners and release the log connection.
    ///
    /// Idempotent: shared state is cleared on every call.
    pub fn stop(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().clear();

        if let Some(cancel) = self.inner.pump.lock().take() {
            cancel.cancel();
            self.inner.connections.release();
            tracing::debug!("dispatcher stopped");
        }
    }

    /// Stop and start again. Listeners from before the restart are gone.
    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    /// Stop for good and log dispatch counters.
    pub fn end(&self) {
        self.stop();

        let snap = self.inner.stats.snapshot();
        tracing::info!(
            lines = snap.lines,
            performance = snap.count(EntryKind::Performance),
            memory = snap.count(EntryKind::Memory),
            unmatched = snap.unmatched,
            errors = snap.errors,
            "dispatcher ended",
        );
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Register a persistent listener for one entry kind.
    pub fn on_entry(
        &self,
        kind: EntryKind,
        handler: impl Fn(&ParsedEntry) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.add_listener(Some(kind), Arc::new(handler))
    }

    /// Register a persistent listener for every entry kind.
    pub fn on_any(&self, handler: impl Fn(&ParsedEntry) + Send + Sync + 'static) -> SubscriptionId {
        self.add_listener(None, Arc::new(handler))
    }

    /// Register a listener that is removed when the guard drops.
    pub fn subscribe(
        &self,
        kind: EntryKind,
        handler: impl Fn(&ParsedEntry) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.add_listener(Some(kind), Arc::new(handler));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.inner.remove_listener(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Classify one raw line and emit the resulting entry, if any.
    pub fn dispatch_line(&self, line: &str) {
        self.inner.dispatch_line(line);
    }

    /// Read and reset dispatch counters.
    pub fn stats(&self) -> EntryStatsSnapshot {
        self.inner.stats.snapshot()
    }

    fn add_listener(&self, kind: Option<EntryKind>, handler: EntryHandler) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push(Listener { id, kind, handler });
        SubscriptionId(id)
    }
}

impl Inner {
    fn accepts(&self, generation: u64) -> bool {
        self.live.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn dispatch_line(&self, line: &str) {
        self.stats.record_line();
        if let Some(m) = &self.metrics {
            m.lines_received.inc();
        }

        let Some(record) = LogRecord::parse(line) else {
            self.stats.record_unmatched();
            return;
        };

        let entry = {
            let registry = self.registry.read();
            match registry.classify(&record) {
                Classification::Unmatched => {
                    self.stats.record_unmatched();
                    None
                }
                Classification::Failed { parser, error } => {
                    tracing::warn!(parser, error = %error, "dropping malformed log entry");
                    self.stats.record_error();
                    if let Some(m) = &self.metrics {
                        m.parse_errors.with_label_values(&[parser]).inc();
                    }
                    None
                }
                Classification::Parsed(entry) => Some(entry),
            }
        };

        if let Some(entry) = entry {
            self.emit(&entry);
        }
    }

    fn emit(&self, entry: &ParsedEntry) {
        let kind = entry.kind();
        self.stats.record(kind);
        if let Some(m) = &self.metrics {
            m.entries_emitted.with_label_values(&[kind.as_str()]).inc();
        }

        // Handlers run outside the lock so they may add or remove listeners.
        let handlers: Vec<EntryHandler> = self
            .listeners
            .lock()
            .iter()
            .filter(|l| l.kind.map_or(true, |k| k == kind))
            .map(|l| Arc::clone(&l.handler))
            .collect();

        for handler in handlers {
            handler(entry);
        }
    }

    fn remove_listener(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id.0);
        listeners.len() != before
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(cancel) = self.pump.get_mut().take() {
            cancel.cancel();
            self.connections.release();
        }
    }
}

/// Listener guard; dropping it detaches the listener.
pub struct Subscription {
    id: SubscriptionId,
    inner: Weak<Inner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_listener(self.id);
        }
    }
}
