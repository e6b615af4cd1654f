use std::collections::BTreeMap;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Dispatcher, Subscription};
use crate::logcat::entry::{EntryKind, MemoryEntry, MemoryMetric, PerformanceEntry};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WaitError {
    #[error("wait cancelled")]
    Cancelled,
    #[error("dispatcher detached while waiting for {what}")]
    Detached { what: String },
}

/// Single-shot wait for the first performance entry with a given name and
/// context.
///
/// The listener is registered on construction, so entries emitted between
/// `new` and `wait` are not missed. It is detached when the wait is dropped.
pub struct EntryWait {
    what: String,
    rx: oneshot::Receiver<PerformanceEntry>,
    sub: Subscription,
}

impl EntryWait {
    pub fn new(dispatcher: &Dispatcher, name: &str, context: &str) -> Self {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let (name, context) = (name.to_string(), context.to_string());
        let what = format!("{name} in {context}");

        let sub = dispatcher.subscribe(EntryKind::Performance, move |entry| {
            let Some(perf) = entry.as_performance() else {
                return;
            };
            if perf.name != name || perf.context != context {
                return;
            }
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(perf.clone());
            }
        });

        Self { what, rx, sub }
    }

    pub async fn wait(self, cancel: &CancellationToken) -> Result<PerformanceEntry, WaitError> {
        let Self { what, rx, sub } = self;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(WaitError::Cancelled),
            entry = rx => entry.map_err(|_| WaitError::Detached { what }),
        };

        drop(sub);
        result
    }
}

/// Resolve with whichever wait fires first; both are detached on return.
pub async fn first_of(
    a: EntryWait,
    b: EntryWait,
    cancel: &CancellationToken,
) -> Result<PerformanceEntry, WaitError> {
    tokio::select! {
        entry = a.wait(cancel) => entry,
        entry = b.wait(cancel) => entry,
    }
}

struct MemoryProgress {
    seen: BTreeMap<MemoryMetric, MemoryEntry>,
    tx: Option<oneshot::Sender<Vec<MemoryEntry>>>,
}

/// Conjunctive wait: resolves exactly once, when the last of the required
/// memory metrics has been seen for a context.
///
/// Repeated or unrequested metrics are ignored. The first reading of each
/// metric is the one returned.
pub struct MemoryWait {
    what: String,
    rx: oneshot::Receiver<Vec<MemoryEntry>>,
    sub: Subscription,
}

impl MemoryWait {
    pub fn new(dispatcher: &Dispatcher, context: &str, required: &[MemoryMetric]) -> Self {
        let (tx, rx) = oneshot::channel();
        let what = format!("memory in {context}");
        let context = context.to_string();
        let required: Vec<MemoryMetric> = required.to_vec();

        let progress = Mutex::new(MemoryProgress {
            seen: BTreeMap::new(),
            tx: Some(tx),
        });

        if required.is_empty() {
            if let Some(tx) = progress.lock().tx.take() {
                let _ = tx.send(Vec::new());
            }
        }

        let sub = dispatcher.subscribe(EntryKind::Memory, move |entry| {
            let Some(mem) = entry.as_memory() else {
                return;
            };
            if mem.context != context || !required.contains(&mem.name) {
                return;
            }

            let mut progress = progress.lock();
            if progress.tx.is_none() || progress.seen.contains_key(&mem.name) {
                return;
            }
            progress.seen.insert(mem.name, mem.clone());

            if progress.seen.len() == required.len() {
                let entries = required
                    .iter()
                    .filter_map(|metric| progress.seen.get(metric).cloned())
                    .collect();
                if let Some(tx) = progress.tx.take() {
                    let _ = tx.send(entries);
                }
            }
        });

        Self { what, rx, sub }
    }

    pub async fn wait(self, cancel: &CancellationToken) -> Result<Vec<MemoryEntry>, WaitError> {
        let Self { what, rx, sub } = self;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(WaitError::Cancelled),
            entries = rx => entries.map_err(|_| WaitError::Detached { what }),
        };

        drop(sub);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::dispatcher::registry::ParserDefinition;
    use crate::logcat::entry::ALL_MEMORY_METRICS;
    use crate::logcat::{ChannelSource, ConnectionManager, LineSource};

    fn dispatcher() -> Dispatcher {
        let source = ChannelSource::new();
        let connections = Arc::new(ConnectionManager::new(LineSource::Channel(source)));
        let dispatcher = Dispatcher::new(connections);
        dispatcher.register_parser(ParserDefinition::performance());
        dispatcher.register_parser(ParserDefinition::memory());
        dispatcher
    }

    fn mark(context: &str, name: &str, pid: u32) -> String {
        format!(
            "01-15 10:22:33.123  {pid}  {pid} I PerformanceTiming: {context}|mark|{name}|0|0|1450000000000"
        )
    }

    fn memory(context: &str, metric: &str, mb: f64) -> String {
        format!("01-15 10:22:33.200  1812  1812 I PerformanceMemory: {context}|{metric}|{mb}")
    }

    #[tokio::test]
    async fn test_entry_wait_matches_name_and_context() {
        let dispatcher = dispatcher();
        let cancel = CancellationToken::new();
        let wait = EntryWait::new(&dispatcher, "fullyLoaded", "clock.gaiamobile.org");

        dispatcher.dispatch_line(&mark("verticalhome.gaiamobile.org", "fullyLoaded", 1));
        dispatcher.dispatch_line(&mark("clock.gaiamobile.org", "visuallyLoaded", 2));
        dispatcher.dispatch_line(&mark("clock.gaiamobile.org", "fullyLoaded", 1812));
        dispatcher.dispatch_line(&mark("clock.gaiamobile.org", "fullyLoaded", 1813));

        let entry = wait.wait(&cancel).await.expect("resolved");
        assert_eq!(entry.pid, 1812);
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_entry_wait_cancelled() {
        let dispatcher = dispatcher();
        let cancel = CancellationToken::new();
        let wait = EntryWait::new(&dispatcher, "fullyLoaded", "clock.gaiamobile.org");

        cancel.cancel();
        assert_eq!(wait.wait(&cancel).await, Err(WaitError::Cancelled));
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_entry_wait_detached_by_stop() {
        let dispatcher = dispatcher();
        let cancel = CancellationToken::new();
        let wait = EntryWait::new(&dispatcher, "fullyLoaded", "clock.gaiamobile.org");

        dispatcher.stop();

        let err = wait.wait(&cancel).await.expect_err("detached");
        assert!(matches!(err, WaitError::Detached { .. }));
    }

    #[tokio::test]
    async fn test_first_of_resolves_on_either_and_detaches_both() {
        let dispatcher = dispatcher();
        let cancel = CancellationToken::new();
        let loaded = EntryWait::new(&dispatcher, "fullyLoaded", "system.gaiamobile.org");
        let logo = EntryWait::new(&dispatcher, "osLogoEnd", "system.gaiamobile.org");
        assert_eq!(dispatcher.listener_count(), 2);

        dispatcher.dispatch_line(&mark("system.gaiamobile.org", "osLogoEnd", 900));

        let entry = first_of(loaded, logo, &cancel).await.expect("resolved");
        assert_eq!(entry.name, "osLogoEnd");
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_wait_any_order_with_duplicates() {
        let dispatcher = dispatcher();
        let cancel = CancellationToken::new();
        let wait = MemoryWait::new(&dispatcher, "clock.gaiamobile.org", &ALL_MEMORY_METRICS);

        dispatcher.dispatch_line(&memory("clock.gaiamobile.org", "rss", 27.9));
        dispatcher.dispatch_line(&memory("clock.gaiamobile.org", "rss", 30.0));
        dispatcher.dispatch_line(&memory("verticalhome.gaiamobile.org", "uss", 1.0));
        dispatcher.dispatch_line(&memory("clock.gaiamobile.org", "uss", 10.0));
        dispatcher.dispatch_line(&memory("clock.gaiamobile.org", "pss", 14.0));

        let entries = wait.wait(&cancel).await.expect("resolved");
        let names: Vec<MemoryMetric> = entries.iter().map(|e| e.name).collect();
        assert_eq!(names, ALL_MEMORY_METRICS.to_vec());
        assert_eq!(entries[2].value, 27.9 * 1024.0 * 1024.0);
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_wait_two_of_three_never_resolves() {
        let dispatcher = dispatcher();
        let cancel = CancellationToken::new();
        let wait = MemoryWait::new(&dispatcher, "clock.gaiamobile.org", &ALL_MEMORY_METRICS);

        dispatcher.dispatch_line(&memory("clock.gaiamobile.org", "uss", 10.0));
        dispatcher.dispatch_line(&memory("clock.gaiamobile.org", "pss", 14.0));
        dispatcher.dispatch_line(&memory("clock.gaiamobile.org", "pss", 14.0));

        let res = tokio::time::timeout(Duration::from_secs(5), wait.wait(&cancel)).await;
        assert!(res.is_err(), "wait must not resolve on two of three");
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_wait_with_nothing_required() {
        let dispatcher = dispatcher();
        let cancel = CancellationToken::new();
        let wait = MemoryWait::new(&dispatcher, "clock.gaiamobile.org", &[]);

        assert!(wait.wait(&cancel).await.expect("resolved").is_empty());
    }
}
