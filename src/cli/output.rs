use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::anyhow;
use serde::Serialize;

use crate::api::{
    records::PackRecord,
    traits::{LoggingSink, PublishError, PublishSink},
};

/// Local sink used instead of a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    /// One summary log line per record
    Log,
    Stdout,
    File { path: PathBuf },
}

impl std::str::FromStr for OutputSink {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "log" {
            Ok(OutputSink::Log)
        } else if s == "stdout" || s == "-" {
            Ok(OutputSink::Stdout)
        } else if let Some(path) = s.strip_prefix("file:").filter(|path| !path.is_empty()) {
            Ok(OutputSink::File {
                path: PathBuf::from(path),
            })
        } else {
            Err(anyhow!("Invalid output format. Use log, stdout or file:<path>"))
        }
    }
}

impl OutputSink {
    pub fn open(&self) -> std::io::Result<Box<dyn PublishSink>> {
        let writer: Box<dyn Write + Send> = match self {
            OutputSink::Log => return Ok(Box::new(LoggingSink)),
            OutputSink::Stdout => Box::new(std::io::stdout()),
            OutputSink::File { path } => Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map(std::io::LineWriter::new)?,
            ),
        };
        Ok(Box::new(JsonLinesSink { writer }))
    }
}

#[derive(Serialize)]
struct Line<'a> {
    pack: u8,
    data: &'a PackRecord,
}

/// Writes one JSON object per record, keyed by pack address.
pub struct JsonLinesSink {
    writer: Box<dyn Write + Send>,
}

impl PublishSink for JsonLinesSink {
    fn publish(&mut self, record: &PackRecord) -> Result<(), PublishError> {
        let line = Line {
            pack: record.address,
            data: record,
        };
        serde_json::to_writer(&mut self.writer, &line).map_err(|source| {
            PublishError::Serialize {
                address: record.address,
                source,
            }
        })?;
        self.writer
            .write_all(b"\n")
            .map_err(|source| PublishError::Io { source })
    }

    fn close(&mut self) -> Result<(), PublishError> {
        self.writer.flush().map_err(|source| PublishError::Io { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output_sink() {
        assert_eq!("stdout".parse::<OutputSink>().unwrap(), OutputSink::Stdout);
        assert_eq!("log".parse::<OutputSink>().unwrap(), OutputSink::Log);
        assert_eq!(
            "file:/tmp/packs.jsonl".parse::<OutputSink>().unwrap(),
            OutputSink::File {
                path: PathBuf::from("/tmp/packs.jsonl")
            }
        );
        assert!("file:".parse::<OutputSink>().is_err());
        assert!("pipe:x".parse::<OutputSink>().is_err());
    }

    #[test]
    fn test_file_sink_appends_json_lines() -> anyhow::Result<()> {
        use crate::protocol::{
            telemetry::{fixture::TelemetryPayload, CellVoltageLimits},
            telesignalization::fixture::TelesignalizationPayload,
            TelemetryRecord, TelesignalizationRecord,
        };

        let path = std::env::temp_dir().join(format!("seplos_{}.jsonl", uuid::Uuid::new_v4()));
        let record = PackRecord {
            address: 3,
            last_update: chrono::Local::now(),
            telemetry: TelemetryRecord::decode(
                &TelemetryPayload::default().build(),
                &CellVoltageLimits::default(),
            )?,
            telesignalization: TelesignalizationRecord::decode(
                &TelesignalizationPayload::default().build(),
            )?,
        };

        let mut sink = OutputSink::File { path: path.clone() }.open()?;
        sink.publish(&record)?;
        sink.publish(&record)?;
        sink.close()?;
        drop(sink);

        let content = std::fs::read_to_string(&path)?;
        std::fs::remove_file(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(first["pack"], 3);
        assert_eq!(first["data"]["telemetry"]["cycles"], 42);
        Ok(())
    }
}
