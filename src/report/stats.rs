use std::collections::BTreeMap;
use std::fmt::Write;

use serde::Serialize;

use super::format::{FormattedPoint, MEMORY_SERIES};
use crate::logcat::parse::BYTES_PER_MEGABYTE;

const P95: f64 = 0.95;

/// Descriptive statistics for one metric in one context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation.
    pub stddev: f64,
    pub p95: f64,
}

/// Statistics keyed by context, then metric.
pub type PhaseStats = BTreeMap<String, BTreeMap<String, MetricStats>>;

/// Aggregate points from every trial. Memory values are reported in
/// megabytes.
pub fn calculate_stats(points: &[FormattedPoint]) -> PhaseStats {
    let mut samples: BTreeMap<&str, BTreeMap<&str, Vec<f64>>> = BTreeMap::new();

    for point in points {
        let (Some(context), Some(metric)) = (point.tag("context"), point.tag("metric")) else {
            continue;
        };

        let value = if point.series == MEMORY_SERIES {
            point.fields.value / BYTES_PER_MEGABYTE
        } else {
            point.fields.value
        };

        samples
            .entry(context)
            .or_default()
            .entry(metric)
            .or_default()
            .push(value);
    }

    samples
        .into_iter()
        .map(|(context, metrics)| {
            let metrics = metrics
                .into_iter()
                .filter_map(|(metric, values)| Some((metric.to_string(), summarize(values)?)))
                .collect();
            (context.to_string(), metrics)
        })
        .collect()
}

/// Summarize a sample; `None` when empty.
pub fn summarize(mut values: Vec<f64>) -> Option<MetricStats> {
    if values.is_empty() {
        return None;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

    let median = if count % 2 == 0 {
        (values[count / 2 - 1] + values[count / 2]) / 2.0
    } else {
        values[count / 2]
    };

    Some(MetricStats {
        count,
        mean,
        median,
        min: values[0],
        max: values[count - 1],
        stddev: variance.sqrt(),
        p95: percentile(&values, P95).unwrap_or(mean),
    })
}

/// Linear-interpolated percentile over sorted values. `None` below two
/// samples.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.len() < 2 {
        return None;
    }

    let rank = sorted.len() as f64 * p - 0.5;
    let lower = rank.floor().max(0.0) as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let frac = rank - rank.floor();

    let low = *sorted.get(lower)?;
    let high = *sorted.get(upper)?;
    Some((1.0 - frac) * low + frac * high)
}

/// Render one markdown table per context.
pub fn render_table(stats: &PhaseStats) -> String {
    let mut out = String::new();

    for (context, metrics) in stats {
        let _ = writeln!(out, "{context}");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Metric | Mean | Median | Min | Max | StdDev | p95 |");
        let _ = writeln!(out, "| ------ | ---- | ------ | --- | --- | ------ | --- |");

        for (metric, s) in metrics {
            let _ = writeln!(
                out,
                "| {metric} | {:.3} | {:.3} | {:.3} | {:.3} | {:.3} | {:.3} |",
                s.mean, s.median, s.min, s.max, s.stddev, s.p95,
            );
        }

        let _ = writeln!(out);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::format::{PointFields, MEASURE_SERIES};

    fn point(series: &str, context: &str, metric: &str, value: f64) -> FormattedPoint {
        let mut tags = BTreeMap::new();
        tags.insert("context".to_string(), context.to_string());
        tags.insert("metric".to_string(), metric.to_string());
        FormattedPoint {
            timestamp_ns: 1,
            series: series.to_string(),
            tags,
            fields: PointFields { value, epoch: None },
        }
    }

    #[test]
    fn test_stats_across_trials() {
        let points = vec![
            point(MEASURE_SERIES, "clock.gaiamobile.org", "fullyLoaded", 812.0),
            point(MEASURE_SERIES, "clock.gaiamobile.org", "fullyLoaded", 790.0),
            point(MEASURE_SERIES, "clock.gaiamobile.org", "fullyLoaded", 805.0),
        ];

        let stats = calculate_stats(&points);
        let s = stats["clock.gaiamobile.org"]["fullyLoaded"];

        assert_eq!(s.count, 3);
        assert!((s.mean - 802.333).abs() < 0.001);
        assert_eq!(s.median, 805.0);
        assert_eq!(s.min, 790.0);
        assert_eq!(s.max, 812.0);
        assert!((s.stddev - 9.1773).abs() < 0.001);
        assert_eq!(s.p95, 812.0);
    }

    #[test]
    fn test_memory_values_in_megabytes() {
        let points = vec![
            point(MEMORY_SERIES, "clock.gaiamobile.org", "uss", 10.0 * BYTES_PER_MEGABYTE),
            point(MEMORY_SERIES, "clock.gaiamobile.org", "uss", 12.0 * BYTES_PER_MEGABYTE),
        ];

        let s = calculate_stats(&points)["clock.gaiamobile.org"]["uss"];
        assert_eq!(s.mean, 11.0);
        assert_eq!(s.median, 11.0);
    }

    #[test]
    fn test_single_sample_p95_falls_back_to_mean() {
        let s = summarize(vec![42.0]).expect("stats");
        assert_eq!(s.p95, 42.0);
        assert_eq!(s.stddev, 0.0);
        assert!(summarize(Vec::new()).is_none());
    }

    #[test]
    fn test_percentile_interpolates() {
        let values: Vec<f64> = (1..=20).map(f64::from).collect();
        // rank = 20 * 0.95 - 0.5 = 18.5 -> halfway between 19 and 20.
        assert_eq!(percentile(&values, P95), Some(19.5));
    }

    #[test]
    fn test_render_table() {
        let points = vec![
            point(MEASURE_SERIES, "clock.gaiamobile.org", "fullyLoaded", 800.0),
            point(MEASURE_SERIES, "system.gaiamobile.org", "osLogoEnd", 1200.0),
        ];

        let table = render_table(&calculate_stats(&points));
        assert!(table.contains("clock.gaiamobile.org\n"));
        assert!(table.contains("| fullyLoaded | 800.000 | 800.000 |"));
        assert!(table.contains("| osLogoEnd | 1200.000 |"));
    }
}
