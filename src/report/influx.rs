use std::fmt::Write as _;
use std::io::Write as _;

use anyhow::{bail, Context, Result};

use super::format::FormattedPoint;
use crate::config::InfluxConfig;

/// Writes points to an InfluxDB-compatible `/write` endpoint using line
/// protocol with nanosecond precision.
pub struct InfluxSink {
    cfg: InfluxConfig,
    client: reqwest::Client,
    write_url: String,
}

impl InfluxSink {
    pub fn new(cfg: InfluxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        let write_url = format!("{}/write", cfg.address.trim_end_matches('/'));

        Ok(Self {
            cfg,
            client,
            write_url,
        })
    }

    pub fn name(&self) -> &str {
        "influx"
    }

    /// Send all points in a single request.
    pub async fn write(&self, points: &[FormattedPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let body = encode_line_protocol(points);
        let raw_len = body.len();
        let payload = compress(body.as_bytes(), &self.cfg.compression)
            .context("compressing line protocol")?;

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.cfg.database.as_str()), ("precision", "n")])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(payload);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        if !self.cfg.username.is_empty() {
            request = request.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }

        let resp = request.send().await.context("sending influx write")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let detail = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("influx write unexpected status {status}: {}", detail.trim());
        }

        tracing::debug!(points = points.len(), bytes = raw_len, "wrote points to influx");

        Ok(())
    }
}

/// Encode points as line protocol, one line per point.
pub fn encode_line_protocol(points: &[FormattedPoint]) -> String {
    let mut out = String::with_capacity(points.len() * 192);

    for point in points {
        escape_into(&mut out, &point.series, false);

        for (key, value) in &point.tags {
            if value.is_empty() {
                continue;
            }
            out.push(',');
            escape_into(&mut out, key, true);
            out.push('=');
            escape_into(&mut out, value, true);
        }

        let _ = write!(out, " value={}", point.fields.value);
        if let Some(epoch) = point.fields.epoch {
            let _ = write!(out, ",epoch={epoch}");
        }

        let _ = writeln!(out, " {}", point.timestamp_ns);
    }

    out
}

/// Escape commas and spaces, plus `=` in tag keys and values.
fn escape_into(out: &mut String, raw: &str, escape_equals: bool) {
    for c in raw.chars() {
        if c == ',' || c == ' ' || (escape_equals && c == '=') {
            out.push('\\');
        }
        out.push(c);
    }
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
