use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use devbench::device::DeviceTags;
use devbench::dispatcher::registry::ParserDefinition;
use devbench::dispatcher::Dispatcher;
use devbench::logcat::entry::{EntryType, MemoryEntry, MemoryMetric, ParsedEntry, PerformanceEntry};
use devbench::logcat::parse::LogRecord;
use devbench::logcat::{ChannelSource, ConnectionManager, LineSource};
use devbench::report::format::{format, FormatContext};

const NOISE: &str =
    "01-15 10:22:33.120   212   230 D AudioFlinger: mixer(0xb4a28000) throttle end: throttle time(11)";
const MARK: &str = "01-15 10:22:33.123  1812  1812 I PerformanceTiming: clock.gaiamobile.org|mark|fullyLoaded|0|0|1450000000812";
const MEASURE: &str = "01-15 10:22:33.124  1812  1812 I PerformanceTiming: clock.gaiamobile.org|measure|navigationLoaded|0|412.5|1450000000412";
const MEMORY: &str =
    "01-15 10:22:33.200  1812  1812 I PerformanceMemory: clock.gaiamobile.org|uss|10.2";

fn dispatcher() -> Dispatcher {
    let connections = Arc::new(ConnectionManager::new(LineSource::Channel(
        ChannelSource::new(),
    )));
    let dispatcher = Dispatcher::new(connections);
    dispatcher.register_parser(ParserDefinition::performance());
    dispatcher.register_parser(ParserDefinition::memory());
    dispatcher
}

fn trial_entries() -> Vec<ParsedEntry> {
    let mut entries = Vec::with_capacity(64);
    let perf = |entry_type, name: &str, epoch: f64| {
        ParsedEntry::Performance(PerformanceEntry {
            entry_type,
            name: name.to_string(),
            context: "clock.gaiamobile.org".to_string(),
            entry_point: None,
            start_time: 0.0,
            duration: 12.5,
            epoch,
            pid: 1812,
        })
    };

    entries.push(perf(EntryType::Mark, "appLaunch", 1_450_000_000_000.0));
    for i in 0..48 {
        let entry_type = if i % 3 == 0 { EntryType::Measure } else { EntryType::Mark };
        entries.push(perf(entry_type, "contentInteractive", 1_450_000_000_000.0 + f64::from(i)));
    }
    for name in [MemoryMetric::Uss, MemoryMetric::Pss, MemoryMetric::Rss] {
        entries.push(ParsedEntry::Memory(MemoryEntry {
            name,
            context: "clock.gaiamobile.org".to_string(),
            value: 10_695_475.2,
            pid: 1812,
        }));
    }
    entries
}

fn bench_record_parse(c: &mut Criterion) {
    c.bench_function("log_record/parse_noise", |b| {
        b.iter(|| LogRecord::parse(black_box(NOISE)))
    });

    c.bench_function("log_record/parse_mark", |b| {
        b.iter(|| LogRecord::parse(black_box(MARK)))
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let dispatcher = dispatcher();
    let _sub = dispatcher.on_any(|entry| {
        black_box(entry);
    });

    c.bench_function("dispatcher/dispatch_unmatched", |b| {
        b.iter(|| dispatcher.dispatch_line(black_box(NOISE)))
    });

    c.bench_function("dispatcher/dispatch_mixed", |b| {
        b.iter(|| {
            dispatcher.dispatch_line(black_box(MARK));
            dispatcher.dispatch_line(black_box(MEASURE));
            dispatcher.dispatch_line(black_box(MEMORY));
        })
    });
}

fn bench_format(c: &mut Criterion) {
    let entries = trial_entries();
    let mut device_tags = DeviceTags::new();
    device_tags.insert("device".to_string(), "flame".to_string());
    device_tags.insert("revisionId".to_string(), "3f1a9c".to_string());

    let ctx = FormatContext {
        start_ms: 1_450_000_000_000,
        trial: 3,
        test: "bench",
        phase: "coldlaunch",
        start_mark: "appLaunch",
        device_tags: &device_tags,
    };

    c.bench_function("format/trial_52_entries", |b| {
        b.iter(|| {
            let points = format(black_box(&entries), black_box(&ctx)).expect("format");
            black_box(points.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_record_parse(c);
    bench_dispatch(c);
    bench_format(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
