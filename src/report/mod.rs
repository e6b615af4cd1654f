pub mod file;
pub mod format;
pub mod influx;
pub mod stats;

use std::sync::Arc;

use anyhow::{anyhow, Result};

use self::file::FileSink;
use self::format::FormattedPoint;
use self::influx::InfluxSink;
use crate::config::ReportConfig;
use crate::export::health::HarnessMetrics;

/// ReportSink delivers formatted points to one destination.
pub enum ReportSink {
    File(FileSink),
    Influx(InfluxSink),
}

impl ReportSink {
    pub fn name(&self) -> &str {
        match self {
            Self::File(s) => s.name(),
            Self::Influx(s) => s.name(),
        }
    }

    pub async fn write(&self, points: &[FormattedPoint]) -> Result<()> {
        match self {
            Self::File(s) => s.write(points).await,
            Self::Influx(s) => s.write(points).await,
        }
    }
}

/// Fans each report out to every configured sink.
pub struct Reporter {
    sinks: Vec<ReportSink>,
    metrics: Option<Arc<HarnessMetrics>>,
}

impl Reporter {
    pub fn new(sinks: Vec<ReportSink>) -> Self {
        Self {
            sinks,
            metrics: None,
        }
    }

    /// File sink always; Influx sink when enabled.
    pub fn from_config(cfg: &ReportConfig) -> Result<Self> {
        let mut sinks = vec![ReportSink::File(FileSink::new(&cfg.metrics_file))];

        if cfg.influx.enabled {
            sinks.push(ReportSink::Influx(InfluxSink::new(cfg.influx.clone())?));
        }

        Ok(Self::new(sinks))
    }

    pub fn with_metrics(mut self, metrics: Arc<HarnessMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(ReportSink::name).collect()
    }

    /// Write to every sink. Each write is attempted even when an earlier
    /// one failed; the call succeeds only if all of them did.
    pub async fn report(&self, points: &[FormattedPoint]) -> Result<()> {
        let mut failed = Vec::new();

        for sink in &self.sinks {
            match sink.write(points).await {
                Ok(()) => {
                    if let Some(m) = &self.metrics {
                        m.points_reported
                            .with_label_values(&[sink.name()])
                            .inc_by(points.len() as f64);
                    }
                }
                Err(e) => {
                    tracing::error!(sink = sink.name(), error = %format!("{e:#}"), "report write failed");
                    if let Some(m) = &self.metrics {
                        m.report_errors.with_label_values(&[sink.name()]).inc();
                    }
                    failed.push(format!("{}: {e:#}", sink.name()));
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("report failed for {}", failed.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::format::PointFields;
    use super::*;

    fn point() -> FormattedPoint {
        let mut tags = BTreeMap::new();
        tags.insert("metric".to_string(), "fullyLoaded".to_string());
        FormattedPoint {
            timestamp_ns: 1,
            series: "measure".to_string(),
            tags,
            fields: PointFields {
                value: 800.0,
                epoch: None,
            },
        }
    }

    #[tokio::test]
    async fn test_report_writes_every_sink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.ldjson");
        let b = dir.path().join("b.ldjson");
        let reporter = Reporter::new(vec![
            ReportSink::File(FileSink::new(&a)),
            ReportSink::File(FileSink::new(&b)),
        ]);

        reporter.report(&[point()]).await.expect("report");

        assert_eq!(std::fs::read_to_string(&a).expect("a").lines().count(), 1);
        assert_eq!(std::fs::read_to_string(&b).expect("b").lines().count(), 1);
    }

    #[tokio::test]
    async fn test_report_attempts_all_sinks_after_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("good.ldjson");
        let metrics = Arc::new(HarnessMetrics::new("").expect("metrics"));
        let reporter = Reporter::new(vec![
            ReportSink::File(FileSink::new(dir.path().join("missing").join("bad.ldjson"))),
            ReportSink::File(FileSink::new(&good)),
        ])
        .with_metrics(Arc::clone(&metrics));

        let err = reporter.report(&[point()]).await.expect_err("one sink failed");
        assert!(err.to_string().contains("report failed for file"));

        assert_eq!(std::fs::read_to_string(&good).expect("good").lines().count(), 1);
        assert_eq!(metrics.report_errors.with_label_values(&["file"]).get(), 1.0);
        assert_eq!(metrics.points_reported.with_label_values(&["file"]).get(), 1.0);
    }

    #[tokio::test]
    async fn test_report_surfaces_influx_rejection() {
        let (address, endpoint) =
            influx::testing::serve(axum::http::StatusCode::INTERNAL_SERVER_ERROR, "engine closed").await;

        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = ReportConfig {
            metrics_file: dir.path().join("metrics.ldjson"),
            ..Default::default()
        };
        cfg.influx.enabled = true;
        cfg.influx.address = address;
        cfg.influx.database = "raptor".to_string();

        let metrics = Arc::new(HarnessMetrics::new("").expect("metrics"));
        let reporter = Reporter::from_config(&cfg).expect("reporter").with_metrics(Arc::clone(&metrics));

        let err = reporter.report(&[point()]).await.expect_err("influx rejected");
        let msg = err.to_string();
        assert!(msg.starts_with("report failed for influx:"), "{msg}");
        assert!(msg.contains("engine closed"), "{msg}");

        // The file sink still got the point.
        assert_eq!(endpoint.received.lock().len(), 1);
        let written = std::fs::read_to_string(&cfg.metrics_file).expect("metrics file");
        assert_eq!(written.lines().count(), 1);
        assert_eq!(metrics.report_errors.with_label_values(&["influx"]).get(), 1.0);
        assert_eq!(metrics.points_reported.with_label_values(&["file"]).get(), 1.0);
    }

    #[test]
    fn test_from_config_sinks() {
        let mut cfg = ReportConfig::default();
        assert_eq!(Reporter::from_config(&cfg).expect("file only").sink_names(), vec!["file"]);

        cfg.influx.enabled = true;
        cfg.influx.address = "http://localhost:8086".to_string();
        cfg.influx.database = "raptor".to_string();
        assert_eq!(
            Reporter::from_config(&cfg).expect("file and influx").sink_names(),
            vec!["file", "influx"]
        );
    }
}
