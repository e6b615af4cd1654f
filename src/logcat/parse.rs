//! Log line decoding.
//!
//! Splits raw `adb logcat` output into borrowed [`LogRecord`] values and
//! extracts typed entries from the records the harness cares about. Record
//! decoding never allocates, so unrelated log traffic stays cheap.

use thiserror::Error;
use url::Url;

use super::entry::{EntryType, MemoryEntry, MemoryMetric, PerformanceEntry};

/// Log tag carrying performance marks and measures.
pub const PERFORMANCE_TAG: &str = "PerformanceTiming";

/// Log tag carrying memory readings written back by the harness.
pub const MEMORY_TAG: &str = "PerformanceMemory";

/// Prefix emitted by older platform builds before the entry fields.
const LEGACY_PREFIX: &str = "Performance Entry: ";

const PERFORMANCE_FIELDS: usize = 6;
const MEMORY_FIELDS: usize = 3;

/// Bytes in one megabyte, as reported by the process-info command.
pub const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;

/// Column offsets of USS, PSS and RSS after the pid in process-info output.
const USS_COLUMN: usize = 3;
const PSS_COLUMN: usize = 4;
const RSS_COLUMN: usize = 5;

/// Errors that can occur while extracting an entry from a matched record.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("{parser}: expected {expected} fields, found {found}")]
    FieldCount {
        parser: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{parser}: invalid {field} value {raw:?}")]
    InvalidNumber {
        parser: &'static str,
        field: &'static str,
        raw: String,
    },

    #[error("unknown entry type: {raw}")]
    UnknownEntryType { raw: String },

    #[error("unknown memory metric: {raw}")]
    UnknownMemoryMetric { raw: String },

    #[error("{parser}: empty {field}")]
    EmptyField {
        parser: &'static str,
        field: &'static str,
    },
}

/// One decoded log record borrowing from the raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord<'a> {
    pub tag: &'a str,
    pub pid: u32,
    pub message: &'a str,
}

impl<'a> LogRecord<'a> {
    /// Decode a `threadtime` or `brief` formatted line.
    ///
    /// Returns `None` for banners (`--------- beginning of main`) and any
    /// other line that is not a log record.
    pub fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        parse_threadtime(line).or_else(|| parse_brief(line))
    }
}

/// `MM-DD HH:MM:SS.mmm  PID  TID P TAG: message`
fn parse_threadtime(line: &str) -> Option<LogRecord<'_>> {
    let (date, rest) = next_token(line)?;
    if !is_month_day(date) {
        return None;
    }

    let (_time, rest) = next_token(rest)?;
    let (pid, rest) = next_token(rest)?;
    let pid = pid.parse().ok()?;
    let (_tid, rest) = next_token(rest)?;
    let (priority, rest) = next_token(rest)?;
    if !is_priority(priority) {
        return None;
    }
    let (tag, message) = split_tag(rest.trim_start())?;

    Some(LogRecord {
        tag,
        pid,
        message,
    })
}

/// `P/TAG(  PID): message`
fn parse_brief(line: &str) -> Option<LogRecord<'_>> {
    if !is_priority(line.get(..1)?) {
        return None;
    }
    let rest = line.get(1..)?.strip_prefix('/')?;

    let open = rest.find('(')?;
    let tag = rest[..open].trim_end();
    if tag.is_empty() {
        return None;
    }

    let after = &rest[open + 1..];
    let close = after.find(')')?;
    let pid = after[..close].trim().parse().ok()?;
    let message = after[close + 1..].strip_prefix(':')?;

    Some(LogRecord {
        tag,
        pid,
        message: message.strip_prefix(' ').unwrap_or(message),
    })
}

/// Split off the next whitespace-delimited token.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }

    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], &s[idx..])),
        None => Some((s, "")),
    }
}

fn is_month_day(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 5
        && bytes[2] == b'-'
        && bytes[..2].iter().all(u8::is_ascii_digit)
        && bytes[3..].iter().all(u8::is_ascii_digit)
}

/// A single logcat priority letter.
fn is_priority(token: &str) -> bool {
    matches!(token, "V" | "D" | "I" | "W" | "E" | "F" | "A")
}

/// Tags are padded with spaces before the colon in threadtime output.
fn split_tag(s: &str) -> Option<(&str, &str)> {
    let colon = s.find(':')?;
    let tag = s[..colon].trim_end();
    if tag.is_empty() {
        return None;
    }

    let message = &s[colon + 1..];
    Some((tag, message.strip_prefix(' ').unwrap_or(message)))
}

/// Extract a performance entry from a `PerformanceTiming` record.
///
/// Message layout: `context|entryType|name[@entryPoint]|startTime|duration|epoch`.
/// An entry point that is a URL with a host replaces the context with that
/// host; any other entry point is kept as a context qualifier.
pub fn parse_performance(record: &LogRecord<'_>) -> Result<PerformanceEntry, ParseError> {
    const PARSER: &str = "performanceentry";

    let message = record.message.trim();
    let message = message.strip_prefix(LEGACY_PREFIX).unwrap_or(message);

    let found = message.split('|').count();
    if found < PERFORMANCE_FIELDS {
        return Err(ParseError::FieldCount {
            parser: PARSER,
            expected: PERFORMANCE_FIELDS,
            found,
        });
    }

    let mut fields = [""; PERFORMANCE_FIELDS];
    for (slot, field) in fields.iter_mut().zip(message.split('|')) {
        *slot = field;
    }
    let [context, entry_type, name, start_time, duration, epoch] = fields;

    let entry_type = EntryType::from_str(entry_type.trim()).ok_or_else(|| {
        ParseError::UnknownEntryType {
            raw: entry_type.to_string(),
        }
    })?;

    let (name, entry_point) = match name.split_once('@') {
        Some((name, entry_point)) if !entry_point.is_empty() => (name, Some(entry_point)),
        Some((name, _)) => (name, None),
        None => (name, None),
    };
    if name.is_empty() {
        return Err(ParseError::EmptyField {
            parser: PARSER,
            field: "name",
        });
    }

    let (context, entry_point) = match entry_point {
        Some(entry_point) => match entry_point_host(entry_point) {
            Some(host) => (host, None),
            None => (context.to_string(), Some(entry_point.to_string())),
        },
        None => (context.to_string(), None),
    };

    Ok(PerformanceEntry {
        entry_type,
        name: name.to_string(),
        context,
        entry_point,
        start_time: parse_number(PARSER, "startTime", start_time)?,
        duration: parse_number(PARSER, "duration", duration)?,
        epoch: parse_number(PARSER, "epoch", epoch)?,
        pid: record.pid,
    })
}

fn entry_point_host(entry_point: &str) -> Option<String> {
    let url = Url::parse(entry_point).ok()?;
    url.host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
}

/// Extract a memory entry from a `PerformanceMemory` record.
///
/// Message layout: `context|metric|megabytes`. The value is stored in bytes.
pub fn parse_memory(record: &LogRecord<'_>) -> Result<MemoryEntry, ParseError> {
    const PARSER: &str = "memoryentry";

    let message = record.message.trim();
    let mut fields = message.splitn(MEMORY_FIELDS, '|');
    let (Some(context), Some(name), Some(value)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(ParseError::FieldCount {
            parser: PARSER,
            expected: MEMORY_FIELDS,
            found: message.split('|').count(),
        });
    };

    if context.is_empty() {
        return Err(ParseError::EmptyField {
            parser: PARSER,
            field: "context",
        });
    }

    let name = MemoryMetric::from_str(name.trim()).ok_or_else(|| {
        ParseError::UnknownMemoryMetric {
            raw: name.to_string(),
        }
    })?;

    let megabytes = parse_number(PARSER, "value", value)?;

    Ok(MemoryEntry {
        name,
        context: context.to_string(),
        value: megabytes * BYTES_PER_MEGABYTE,
        pid: record.pid,
    })
}

fn parse_number(parser: &'static str, field: &'static str, raw: &str) -> Result<f64, ParseError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::InvalidNumber {
            parser,
            field,
            raw: raw.to_string(),
        })
}

/// USS, PSS and RSS of one process, in megabytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub uss: f64,
    pub pss: f64,
    pub rss: f64,
}

impl MemoryReading {
    /// Value for the given metric.
    pub fn get(&self, metric: MemoryMetric) -> f64 {
        match metric {
            MemoryMetric::Uss => self.uss,
            MemoryMetric::Pss => self.pss,
            MemoryMetric::Rss => self.rss,
        }
    }
}

/// Locate `pid` in process-info (`b2g-info`) output and read the memory
/// columns that follow it.
///
/// Columns after the pid are `PPID CPU(s) NICE USS PSS RSS ...`.
pub fn parse_memory_columns(output: &str, pid: u32) -> Option<MemoryReading> {
    let pid = pid.to_string();

    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.by_ref().find(|token| *token == pid)?;

        let columns: Vec<&str> = tokens.take(RSS_COLUMN + 1).collect();
        let read = |idx: usize| columns.get(idx)?.parse::<f64>().ok();

        Some(MemoryReading {
            uss: read(USS_COLUMN)?,
            pss: read(PSS_COLUMN)?,
            rss: read(RSS_COLUMN)?,
        })
    })
}
