use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::device::DeviceTags;
use crate::logcat::entry::{EntryType, ParsedEntry};

/// Series key for marks and measures.
pub const MEASURE_SERIES: &str = "measure";

/// Series key for memory readings.
pub const MEMORY_SERIES: &str = "memory";

#[derive(Error, Debug, PartialEq)]
pub enum FormatError {
    #[error("missing initial entry mark {mark:?} for run {trial}")]
    MissingStartMark { mark: String, trial: u32 },
}

/// One time-series point derived from a trial entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedPoint {
    /// Nanoseconds; see [`encode_timestamp`].
    #[serde(rename = "time")]
    pub timestamp_ns: u64,
    pub series: String,
    pub tags: BTreeMap<String, String>,
    pub fields: PointFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PointFields {
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<f64>,
}

impl FormattedPoint {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Inputs shared by every point of one trial.
#[derive(Debug, Clone, Copy)]
pub struct FormatContext<'a> {
    /// Phase wall-clock start in milliseconds.
    pub start_ms: u64,
    pub trial: u32,
    pub test: &'a str,
    pub phase: &'a str,
    pub start_mark: &'a str,
    pub device_tags: &'a DeviceTags,
}

/// Millisecond start time with the trial index in the sub-millisecond digits.
///
/// Trials of one phase aggregate by millisecond yet remain distinct points.
pub fn encode_timestamp(start_ms: u64, trial: u32) -> u64 {
    start_ms
        .saturating_mul(1_000_000)
        .saturating_add(u64::from(trial))
}

/// Turn one trial's entries into points relative to its start mark.
///
/// The start mark itself is not emitted. Marks measure from the start mark's
/// epoch, measures report their duration and memory entries their value.
/// Negative values are dropped.
pub fn format(
    entries: &[ParsedEntry],
    ctx: &FormatContext<'_>,
) -> Result<Vec<FormattedPoint>, FormatError> {
    let (start_idx, start) = entries
        .iter()
        .enumerate()
        .find_map(|(idx, entry)| match entry {
            ParsedEntry::Performance(perf) if perf.name == ctx.start_mark => Some((idx, perf)),
            _ => None,
        })
        .ok_or_else(|| FormatError::MissingStartMark {
            mark: ctx.start_mark.to_string(),
            trial: ctx.trial,
        })?;

    let timestamp_ns = encode_timestamp(ctx.start_ms, ctx.trial);

    let points = entries
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != start_idx)
        .filter_map(|(_, entry)| {
            let (series, fields, context) = match entry {
                ParsedEntry::Performance(perf) => {
                    let value = match perf.entry_type {
                        EntryType::Mark => perf.epoch - start.epoch,
                        EntryType::Measure => perf.duration,
                    };
                    let context = match &perf.entry_point {
                        Some(entry_point) => format!("{}/{entry_point}", perf.context),
                        None => perf.context.clone(),
                    };
                    let fields = PointFields {
                        value,
                        epoch: Some(perf.epoch),
                    };
                    (MEASURE_SERIES, fields, context)
                }
                ParsedEntry::Memory(mem) => {
                    let fields = PointFields {
                        value: mem.value,
                        epoch: None,
                    };
                    (MEMORY_SERIES, fields, mem.context.clone())
                }
            };

            if fields.value < 0.0 {
                return None;
            }

            let mut tags = ctx.device_tags.clone();
            tags.insert("metric".to_string(), entry.name().to_string());
            tags.insert("test".to_string(), ctx.test.to_string());
            tags.insert("phase".to_string(), ctx.phase.to_string());
            tags.insert("context".to_string(), context);

            Some(FormattedPoint {
                timestamp_ns,
                series: series.to_string(),
                tags,
                fields,
            })
        })
        .collect();

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logcat::entry::{MemoryEntry, MemoryMetric, PerformanceEntry};

    fn mark(name: &str, context: &str, epoch: f64) -> ParsedEntry {
        ParsedEntry::Performance(PerformanceEntry {
            entry_type: EntryType::Mark,
            name: name.to_string(),
            context: context.to_string(),
            entry_point: None,
            start_time: 0.0,
            duration: 0.0,
            epoch,
            pid: 100,
        })
    }

    fn measure(name: &str, duration: f64) -> ParsedEntry {
        ParsedEntry::Performance(PerformanceEntry {
            entry_type: EntryType::Measure,
            name: name.to_string(),
            context: "clock.gaiamobile.org".to_string(),
            entry_point: Some("alarm".to_string()),
            start_time: 0.0,
            duration,
            epoch: 5_000.0,
            pid: 100,
        })
    }

    fn ctx<'a>(tags: &'a DeviceTags, trial: u32) -> FormatContext<'a> {
        FormatContext {
            start_ms: 1_450_000_000_000,
            trial,
            test: "cold-launch",
            phase: "coldlaunch",
            start_mark: "appLaunch",
            device_tags: tags,
        }
    }

    #[test]
    fn test_format_relative_to_start_mark() {
        let mut tags = DeviceTags::new();
        tags.insert("branch".to_string(), "master".to_string());

        let entries = vec![
            mark("navigationLoaded", "clock.gaiamobile.org", 1_400.0),
            mark("appLaunch", "clock.gaiamobile.org", 1_000.0),
            mark("fullyLoaded", "clock.gaiamobile.org", 1_812.0),
            measure("loadAlarms", 35.5),
            ParsedEntry::Memory(MemoryEntry {
                name: MemoryMetric::Uss,
                context: "clock.gaiamobile.org".to_string(),
                value: 10_485_760.0,
                pid: 100,
            }),
        ];

        let points = format(&entries, &ctx(&tags, 1)).expect("format");
        assert_eq!(points.len(), 4);
        assert!(points.iter().all(|p| p.tag("metric") != Some("appLaunch")));

        assert_eq!(points[0].fields.value, 400.0);
        assert_eq!(points[0].fields.epoch, Some(1_400.0));
        assert_eq!(points[0].series, MEASURE_SERIES);
        assert_eq!(points[0].tag("branch"), Some("master"));
        assert_eq!(points[0].tag("phase"), Some("coldlaunch"));
        assert_eq!(points[0].tag("test"), Some("cold-launch"));

        assert_eq!(points[1].fields.value, 812.0);

        assert_eq!(points[2].fields.value, 35.5);
        assert_eq!(points[2].tag("context"), Some("clock.gaiamobile.org/alarm"));

        assert_eq!(points[3].series, MEMORY_SERIES);
        assert_eq!(points[3].fields.value, 10_485_760.0);
        assert_eq!(points[3].fields.epoch, None);
    }

    #[test]
    fn test_format_drops_negative_values() {
        let tags = DeviceTags::new();
        let entries = vec![
            mark("appLaunch", "clock.gaiamobile.org", 1_000.0),
            mark("beforeLaunch", "clock.gaiamobile.org", 900.0),
            mark("visuallyLoaded", "clock.gaiamobile.org", 1_000.0),
        ];

        let points = format(&entries, &ctx(&tags, 1)).expect("format");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].tag("metric"), Some("visuallyLoaded"));
        assert_eq!(points[0].fields.value, 0.0);
    }

    #[test]
    fn test_format_missing_start_mark() {
        let tags = DeviceTags::new();
        let entries = vec![mark("fullyLoaded", "clock.gaiamobile.org", 1_812.0)];

        let err = format(&entries, &ctx(&tags, 3)).expect_err("no start mark");
        assert_eq!(
            err,
            FormatError::MissingStartMark {
                mark: "appLaunch".to_string(),
                trial: 3,
            }
        );
    }

    #[test]
    fn test_trials_in_same_millisecond_are_distinct() {
        let tags = DeviceTags::new();
        let entries = vec![
            mark("appLaunch", "clock.gaiamobile.org", 1_000.0),
            mark("fullyLoaded", "clock.gaiamobile.org", 1_812.0),
        ];

        let first = format(&entries, &ctx(&tags, 1)).expect("trial 1");
        let second = format(&entries, &ctx(&tags, 2)).expect("trial 2");

        assert_eq!(first[0].timestamp_ns, 1_450_000_000_000_000_001);
        assert_eq!(second[0].timestamp_ns - first[0].timestamp_ns, 1);
        assert_eq!(first[0].timestamp_ns / 1_000_000, second[0].timestamp_ns / 1_000_000);
    }

    #[test]
    fn test_point_serializes_as_json_object() {
        let tags = DeviceTags::new();
        let entries = vec![
            mark("appLaunch", "clock.gaiamobile.org", 1_000.0),
            ParsedEntry::Memory(MemoryEntry {
                name: MemoryMetric::Rss,
                context: "clock.gaiamobile.org".to_string(),
                value: 2048.0,
                pid: 100,
            }),
        ];

        let points = format(&entries, &ctx(&tags, 1)).expect("format");
        let json = serde_json::to_string(&points[0]).expect("serialize");
        assert!(json.starts_with("{\"time\":1450000000000000001,\"series\":\"memory\""));
        assert!(json.ends_with("\"fields\":{\"value\":2048.0}}"));
    }
}
