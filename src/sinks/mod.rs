//! Sink interface and built-in sinks
//!
//! A sink receives batches of entries from the processor. Sinks are called
//! concurrently with each other and must not assume any ordering relative
//! to other sinks; within one sink, batches arrive in dispatch order per
//! worker.

mod console;
mod file;
mod memory;

pub use console::{ConsoleSink, ConsoleStream};
pub use file::FileSink;
pub use memory::{FailingSink, MemorySink, SlowSink};

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;

use crate::config::SinksConfig;
use crate::entry::Entry;
use crate::error::SinkError;

/// Destination for batches of entries
///
/// Errors are counted and logged by the caller; they never reach the
/// application that produced the entries.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Sink name used in diagnostics and self-telemetry
    fn name(&self) -> &str;

    /// Deliver one batch
    async fn emit(&self, batch: &[Entry]) -> Result<(), SinkError>;
}

pub type SharedSink = Arc<dyn Sink>;

/// Encode a batch as newline-delimited JSON records
pub fn encode_json_lines(batch: &[Entry]) -> Result<Vec<u8>, SinkError> {
    let mut buf = Vec::with_capacity(batch.len() * 128);
    for entry in batch {
        serde_json::to_writer(&mut buf, &entry.to_json())?;
        buf.write_all(b"\n")?;
    }
    Ok(buf)
}

/// Build the sinks described by configuration
pub fn from_config(config: &SinksConfig) -> Vec<SharedSink> {
    let mut sinks: Vec<SharedSink> = Vec::new();

    if config.console {
        sinks.push(Arc::new(ConsoleSink::new(ConsoleStream::Stdout)));
    }

    if let Some(path) = &config.file_path {
        sinks.push(Arc::new(FileSink::new(path, config.file_max_bytes)));
    }

    sinks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Fields, Level, LogEntry};

    #[test]
    fn test_encode_json_lines() {
        let batch: Vec<Entry> = vec![
            LogEntry::new("a", Level::Info, "one", None, Fields::new()).into(),
            LogEntry::new("b", Level::Warn, "two", Some("cid".into()), Fields::new()).into(),
        ];

        let bytes = encode_json_lines(&batch).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["logger"], "b");
        assert_eq!(second["level"], "WARN");
        assert_eq!(second["correlation_id"], "cid");
    }

    #[test]
    fn test_from_config() {
        let config = SinksConfig {
            console: true,
            file_path: Some("/tmp/telemetry-pipeline-test.log".into()),
            file_max_bytes: None,
        };
        let names: Vec<String> = from_config(&config)
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["console", "file"]);

        let none = SinksConfig {
            console: false,
            ..config
        };
        assert_eq!(from_config(&SinksConfig { file_path: None, ..none }).len(), 0);
    }
}
