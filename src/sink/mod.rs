//! Record sinks.
//!
//! A sink receives every [`CompletedRecord`] the scheduler produces. Sinks are
//! driven from the scheduler task only, one record at a time, so writes are
//! serialized without extra locking. A failing sink is logged and counted; it
//! never stops the session.

use crate::error::SinkError;
use crate::record::CompletedRecord;
use async_trait::async_trait;

pub mod bus;
pub mod csv_sink;

pub use bus::{BusFormat, BusPublisher};
pub use csv_sink::CsvSink;

/// Destination for completed records.
#[async_trait]
pub trait RecordSink: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Write one record.
    async fn emit(&mut self, record: &CompletedRecord) -> Result<(), SinkError>;

    /// Flush and release resources at session end.
    async fn shutdown(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Ordered set of sinks fed by one writer.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Box<dyn RecordSink>>,
}

impl SinkSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sink.
    pub fn push(&mut self, sink: Box<dyn RecordSink>) {
        tracing::info!(sink = sink.name(), "Sink registered");
        self.sinks.push(sink);
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Hand `record` to every sink in order. Returns the number of failures.
    pub async fn emit(&mut self, record: CompletedRecord) -> usize {
        let mut failures = 0;
        for sink in &mut self.sinks {
            if let Err(e) = sink.emit(&record).await {
                failures += 1;
                tracing::error!(
                    sink = sink.name(),
                    kind = %record.kind,
                    error = %e,
                    "Sink write failed, record dropped for this sink"
                );
            }
        }
        failures
    }

    /// Shut every sink down, logging failures.
    pub async fn shutdown(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.shutdown().await {
                tracing::warn!(sink = sink.name(), error = %e, "Sink shutdown failed");
            }
        }
    }
}

/// In-memory sink that keeps every record it receives.
///
/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: std::sync::Arc<std::sync::Mutex<Vec<CompletedRecord>>>,
    fail: bool,
}

impl MemorySink {
    /// Sink that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that rejects every write.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Records received so far.
    pub fn records(&self) -> Vec<CompletedRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn emit(&mut self, record: &CompletedRecord) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "memory sink configured to fail",
            )));
        }
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}
