use std::alloc::System;
use std::hint::black_box;
use std::sync::Arc;

use devbench::dispatcher::registry::ParserDefinition;
use devbench::dispatcher::Dispatcher;
use devbench::logcat::parse::LogRecord;
use devbench::logcat::{ChannelSource, ConnectionManager, LineSource};
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

const NOISE: &str =
    "01-15 10:22:33.120   212   230 D AudioFlinger: mixer(0xb4a28000) throttle end: throttle time(11)";
const BANNER: &str = "--------- beginning of main";
const MARK: &str = "01-15 10:22:33.123  1812  1812 I PerformanceTiming: clock.gaiamobile.org|mark|fullyLoaded|0|0|1450000000812";
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

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

#[test]
#[serial]
fn parse_log_record_allocates_zero() {
    let (_parsed, allocations, _deallocations) = measure_alloc_counts(|| {
        for _ in 0..1_024 {
            black_box(LogRecord::parse(black_box(NOISE)));
            black_box(LogRecord::parse(black_box(MARK)));
            black_box(LogRecord::parse(black_box(BANNER)));
        }
    });

    assert!(
        allocations <= 2,
        "record parse allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn dispatch_unmatched_lines_allocation_budget() {
    let dispatcher = dispatcher();

    let (_out, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..4_096 {
            dispatcher.dispatch_line(black_box(NOISE));
            dispatcher.dispatch_line(black_box(BANNER));
        }
    });

    assert!(
        allocations <= 8,
        "unmatched dispatch allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 8,
        "unmatched dispatch deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn dispatch_matched_lines_allocation_budget() {
    let dispatcher = dispatcher();

    let (_out, allocations, _deallocations) = measure_alloc_counts(|| {
        for _ in 0..256 {
            dispatcher.dispatch_line(black_box(MARK));
            dispatcher.dispatch_line(black_box(MEMORY));
        }
    });

    // Typed entries own their strings; the budget bounds per-line cost.
    assert!(
        allocations <= 256 * 2 * 6,
        "matched dispatch allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn dispatch_without_listeners_does_not_grow_with_noise() {
    let dispatcher = dispatcher();

    let (_small, small_allocations, _) = measure_alloc_counts(|| {
        for _ in 0..64 {
            dispatcher.dispatch_line(black_box(NOISE));
        }
    });

    let (_large, large_allocations, _) = measure_alloc_counts(|| {
        for _ in 0..8_192 {
            dispatcher.dispatch_line(black_box(NOISE));
        }
    });

    assert!(
        large_allocations <= small_allocations + 4,
        "noise dispatch should not allocate per line (small={} large={})",
        small_allocations,
        large_allocations
    );
}
