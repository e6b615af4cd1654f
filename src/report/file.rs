use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use super::format::FormattedPoint;

/// Appends points to a local newline-delimited JSON file.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn name(&self) -> &str {
        "file"
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON object per point.
    pub async fn write(&self, points: &[FormattedPoint]) -> Result<()> {
        let mut buf = Vec::with_capacity(points.len() * 256);
        for point in points {
            serde_json::to_writer(&mut buf, point).context("serializing point to JSON")?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;

        file.write_all(&buf)
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        file.flush().await.context("flushing metrics file")?;

        tracing::debug!(points = points.len(), path = %self.path.display(), "wrote points to file");

        Ok(())
    }
}
