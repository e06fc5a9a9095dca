//! CSV sink with clean feature flag handling.
//!
//! One file per probe kind. Each row is `date,time,field1,field2,field3`; a
//! header is written when the file is created. Rows are flushed after every
//! record so an interrupted session keeps everything collected so far.

use super::RecordSink;
use crate::error::SinkError;
use crate::record::CompletedRecord;
use async_trait::async_trait;
use std::path::PathBuf;

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use crate::probe::SensorKind;
    use std::fs::{File, OpenOptions};

    /// Appends completed records to one CSV file per probe kind.
    pub struct CsvSink {
        ph_path: PathBuf,
        conductivity_path: PathBuf,
        ph: Option<csv::Writer<File>>,
        conductivity: Option<csv::Writer<File>>,
    }

    impl CsvSink {
        /// Sink appending pH rows to `ph_path` and conductivity rows to
        /// `conductivity_path`. Files are opened lazily on the first record.
        pub fn new(ph_path: impl Into<PathBuf>, conductivity_path: impl Into<PathBuf>) -> Self {
            Self {
                ph_path: ph_path.into(),
                conductivity_path: conductivity_path.into(),
                ph: None,
                conductivity: None,
            }
        }

        fn open(path: &PathBuf, kind: SensorKind) -> Result<csv::Writer<File>, SinkError> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let is_new = file.metadata()?.len() == 0;

            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            if is_new {
                let label = kind.label();
                writer.write_record([
                    "date".to_string(),
                    "time".to_string(),
                    format!("{}1", label),
                    format!("{}2", label),
                    format!("{}3", label),
                ])?;
                writer.flush()?;
            }
            tracing::info!(path = %path.display(), kind = %kind, "CSV sink opened");
            Ok(writer)
        }

        fn writer(&mut self, kind: SensorKind) -> Result<&mut csv::Writer<File>, SinkError> {
            let (slot, path) = match kind {
                SensorKind::Ph => (&mut self.ph, &self.ph_path),
                SensorKind::Conductivity => (&mut self.conductivity, &self.conductivity_path),
            };
            if slot.is_none() {
                *slot = Some(Self::open(path, kind)?);
            }
            slot.as_mut().ok_or_else(|| {
                SinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "CSV writer missing after open",
                ))
            })
        }
    }

    #[async_trait]
    impl RecordSink for CsvSink {
        fn name(&self) -> &str {
            "csv"
        }

        async fn emit(&mut self, record: &CompletedRecord) -> Result<(), SinkError> {
            let writer = self.writer(record.kind)?;
            let mut row = vec![record.date(), record.time()];
            row.extend(record.fields.iter().cloned());
            writer.write_record(&row)?;
            writer.flush()?;
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), SinkError> {
            for writer in [self.ph.as_mut(), self.conductivity.as_mut()].into_iter().flatten() {
                writer.flush()?;
            }
            self.ph = None;
            self.conductivity = None;
            tracing::info!("CSV sink shut down.");
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use std::io;

    /// CSV output compiled out; every write fails.
    pub struct CsvSink;

    impl CsvSink {
        /// Sink that rejects every record.
        pub fn new(_ph_path: impl Into<PathBuf>, _conductivity_path: impl Into<PathBuf>) -> Self {
            Self
        }
    }

    #[async_trait]
    impl RecordSink for CsvSink {
        fn name(&self) -> &str {
            "csv"
        }

        async fn emit(&mut self, _record: &CompletedRecord) -> Result<(), SinkError> {
            Err(SinkError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "Feature 'storage_csv' is not enabled",
            )))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvSink;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvSink;
