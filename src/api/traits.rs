/// Publish boundary - where decoded pack records leave the bridge.
///
/// Sinks run on the publisher worker only, never on a bus worker, so a slow
/// sink can delay publishing but not polling.
use derive_more::{Display, Error};

use super::records::PackRecord;

#[derive(Debug, Display, Error)]
pub enum PublishError {
    #[display("cannot serialize pack {address} record: {source}")]
    Serialize {
        address: u8,
        source: serde_json::Error,
    },
    #[display("sink rejected pack {address} record: {reason}")]
    Rejected { address: u8, reason: String },
    #[display("sink i/o failed: {source}")]
    Io { source: std::io::Error },
}

/// Trait for handling decoded pack records
///
/// Implement this trait to define where combined pack records go: a broker,
/// a file, a test collector.
pub trait PublishSink: Send {
    /// Deliver one record. Errors are logged by the caller and the record is
    /// dropped.
    fn publish(&mut self, record: &PackRecord) -> Result<(), PublishError>;

    /// Called once after the last record, before the process exits.
    fn close(&mut self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Logging sink that prints a one-line summary per record (useful for debugging)
pub struct LoggingSink;

impl PublishSink for LoggingSink {
    fn publish(&mut self, record: &PackRecord) -> Result<(), PublishError> {
        let telemetry = &record.telemetry;
        log::info!(
            "Pack{}: {:.2} V, {:.2} A, SOC {:.1} %, cells {:.3}..{:.3} V",
            record.address,
            telemetry.total_pack_voltage,
            telemetry.dis_charge_current,
            telemetry.soc,
            telemetry.lowest_cell.voltage,
            telemetry.highest_cell.voltage,
        );
        Ok(())
    }
}
