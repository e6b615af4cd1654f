use crate::logcat::entry::ParsedEntry;
use crate::logcat::parse::{
    parse_memory, parse_performance, LogRecord, ParseError, MEMORY_TAG, PERFORMANCE_TAG,
};

/// Decides whether a parser claims a record.
pub type Matcher = Box<dyn Fn(&LogRecord<'_>) -> bool + Send + Sync>;

/// Extracts a typed entry from a claimed record.
pub type Extractor = Box<dyn Fn(&LogRecord<'_>) -> Result<ParsedEntry, ParseError> + Send + Sync>;

/// A named `(matcher, extractor)` pair.
pub struct ParserDefinition {
    name: String,
    matcher: Matcher,
    extract: Extractor,
}

impl ParserDefinition {
    pub fn new(
        name: impl Into<String>,
        matcher: impl Fn(&LogRecord<'_>) -> bool + Send + Sync + 'static,
        extract: impl Fn(&LogRecord<'_>) -> Result<ParsedEntry, ParseError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            matcher: Box::new(matcher),
            extract: Box::new(extract),
        }
    }

    /// Performance marks and measures under the `PerformanceTiming` tag.
    pub fn performance() -> Self {
        Self::new(
            "performanceentry",
            |record| record.tag == PERFORMANCE_TAG,
            |record| parse_performance(record).map(ParsedEntry::Performance),
        )
    }

    /// Memory readings under the `PerformanceMemory` tag.
    pub fn memory() -> Self {
        Self::new(
            "memoryentry",
            |record| record.tag == MEMORY_TAG,
            |record| parse_memory(record).map(ParsedEntry::Memory),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Result of running a record through the registry.
#[derive(Debug)]
pub enum Classification<'r> {
    Unmatched,
    Parsed(ParsedEntry),
    Failed {
        parser: &'r str,
        error: ParseError,
    },
}

/// Ordered parser set. The first matching parser wins.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: Vec<ParserDefinition>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parser after all previously registered ones.
    pub fn register(&mut self, def: ParserDefinition) {
        tracing::debug!(parser = def.name(), "registered parser");
        self.parsers.push(def);
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    /// Run the first matching parser's extractor; later parsers never see
    /// a record an earlier one claimed.
    pub fn classify(&self, record: &LogRecord<'_>) -> Classification<'_> {
        let Some(def) = self.parsers.iter().find(|def| (def.matcher)(record)) else {
            return Classification::Unmatched;
        };

        match (def.extract)(record) {
            Ok(entry) => Classification::Parsed(entry),
            Err(error) => Classification::Failed {
                parser: def.name(),
                error,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logcat::entry::{EntryKind, MemoryEntry, MemoryMetric};

    fn record(tag: &'static str, message: &'static str) -> LogRecord<'static> {
        LogRecord {
            tag,
            pid: 7,
            message,
        }
    }

    #[test]
    fn test_default_parsers_classify_by_tag() {
        let mut registry = ParserRegistry::new();
        registry.register(ParserDefinition::performance());
        registry.register(ParserDefinition::memory());
        assert_eq!(registry.len(), 2);

        let perf = record(PERFORMANCE_TAG, "ctx|mark|fullyLoaded|0|0|100");
        assert!(matches!(
            registry.classify(&perf),
            Classification::Parsed(ref e) if e.kind() == EntryKind::Performance
        ));

        let mem = record(MEMORY_TAG, "ctx|rss|3");
        assert!(matches!(
            registry.classify(&mem),
            Classification::Parsed(ref e) if e.kind() == EntryKind::Memory
        ));

        let other = record("ActivityManager", "Start proc");
        assert!(matches!(registry.classify(&other), Classification::Unmatched));
    }

    #[test]
    fn test_first_matching_parser_wins() {
        let mut registry = ParserRegistry::new();
        registry.register(ParserDefinition::new(
            "catch-all",
            |_| true,
            |record| {
                Ok(ParsedEntry::Memory(MemoryEntry {
                    name: MemoryMetric::Uss,
                    context: record.tag.to_string(),
                    value: 1.0,
                    pid: record.pid,
                }))
            },
        ));
        registry.register(ParserDefinition::performance());

        let perf = record(PERFORMANCE_TAG, "ctx|mark|fullyLoaded|0|0|100");
        match registry.classify(&perf) {
            Classification::Parsed(ParsedEntry::Memory(entry)) => {
                assert_eq!(entry.context, PERFORMANCE_TAG);
            }
            other => panic!("expected catch-all result, got {other:?}"),
        }
    }

    #[test]
    fn test_extraction_failure_names_parser() {
        let mut registry = ParserRegistry::new();
        registry.register(ParserDefinition::performance());

        let bad = record(PERFORMANCE_TAG, "ctx|mark");
        match registry.classify(&bad) {
            Classification::Failed { parser, error } => {
                assert_eq!(parser, "performanceentry");
                assert!(matches!(error, ParseError::FieldCount { .. }));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
