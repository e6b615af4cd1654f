use std::fmt;

/// EntryKind identifies which parser family produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryKind {
    Performance = 0,
    Memory = 1,
}

/// Maximum EntryKind value, used for array sizing.
pub const MAX_ENTRY_KIND: usize = 1;

impl EntryKind {
    /// Returns the canonical event label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Performance => "performanceentry",
            Self::Memory => "memoryentry",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Performance),
            1 => Some(Self::Memory),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Performance timeline entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    Mark,
    Measure,
}

impl EntryType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mark => "mark",
            Self::Measure => "measure",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "mark" => Some(Self::Mark),
            "measure" => Some(Self::Measure),
            _ => None,
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process memory figure reported for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryMetric {
    /// Unique set size.
    Uss,
    /// Proportional set size.
    Pss,
    /// Resident set size.
    Rss,
}

/// Every memory metric, in reporting order.
pub const ALL_MEMORY_METRICS: [MemoryMetric; 3] =
    [MemoryMetric::Uss, MemoryMetric::Pss, MemoryMetric::Rss];

impl MemoryMetric {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uss => "uss",
            Self::Pss => "pss",
            Self::Rss => "rss",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "uss" => Some(Self::Uss),
            "pss" => Some(Self::Pss),
            "rss" => Some(Self::Rss),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A performance mark or measure emitted by an app on the device.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceEntry {
    pub entry_type: EntryType,
    pub name: String,
    /// Origin that emitted the entry.
    pub context: String,
    /// Qualifier for apps exposing several launchable entry points.
    pub entry_point: Option<String>,
    pub start_time: f64,
    pub duration: f64,
    pub epoch: f64,
    pub pid: u32,
}

/// A memory reading for a context, in bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub name: MemoryMetric,
    pub context: String,
    pub value: f64,
    pub pid: u32,
}

/// A typed entry extracted from one log line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEntry {
    Performance(PerformanceEntry),
    Memory(MemoryEntry),
}

impl ParsedEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Performance(_) => EntryKind::Performance,
            Self::Memory(_) => EntryKind::Memory,
        }
    }

    /// Metric name: the mark/measure name or the memory metric label.
    pub fn name(&self) -> &str {
        match self {
            Self::Performance(e) => &e.name,
            Self::Memory(e) => e.name.as_str(),
        }
    }

    pub fn context(&self) -> &str {
        match self {
            Self::Performance(e) => &e.context,
            Self::Memory(e) => &e.context,
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            Self::Performance(e) => e.pid,
            Self::Memory(e) => e.pid,
        }
    }

    /// Returns the performance entry, if this is one.
    pub fn as_performance(&self) -> Option<&PerformanceEntry> {
        match self {
            Self::Performance(e) => Some(e),
            Self::Memory(_) => None,
        }
    }

    /// Returns the memory entry, if this is one.
    pub fn as_memory(&self) -> Option<&MemoryEntry> {
        match self {
            Self::Memory(e) => Some(e),
            Self::Performance(_) => None,
        }
    }
}
