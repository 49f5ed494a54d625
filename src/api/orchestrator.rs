//! Polling cycles for all packs on one bus.
//!
//! Each cycle walks the packs in address order. For every pack the telemetry
//! exchange finishes before the telesignalization exchange starts; only when
//! both decode is a combined record handed to the publish queue. A pack that
//! fails keeps its previous state and the cycle moves on to the next pack.
use std::time::Duration;

use chrono::Local;
use derive_more::{Display, Error};

use super::{
    handoff::PublishQueue,
    records::{PackRecord, PackState},
    scheduler::{BusScheduler, PollError},
    shutdown::ShutdownSignal,
    transport::TransportError,
};
use crate::protocol::{
    telemetry::CellVoltageLimits, Command, DecodeError, TelemetryRecord, TelesignalizationRecord,
};

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Packs polled on this bus, in polling order.
    pub addresses: Vec<u8>,
    pub limits: CellVoltageLimits,
    /// Pause between the end of one cycle and the start of the next.
    pub update_interval: Duration,
    /// Stop after this many cycles. `None` runs until shutdown.
    pub max_cycles: Option<u64>,
}

/// Why a pack produced no record this cycle.
#[derive(Debug, Display, Error)]
pub enum PackFailure {
    #[display("{command} poll failed: {source}")]
    Poll { command: Command, source: PollError },
    #[display("{source}")]
    Decode { source: DecodeError },
}

impl PackFailure {
    pub fn command(&self) -> Command {
        match self {
            PackFailure::Poll { command, .. } => *command,
            PackFailure::Decode {
                source:
                    DecodeError::PayloadLength { command, .. } | DecodeError::CellCount { command, .. },
            } => *command,
        }
    }
}

/// Outcome of one cycle over every pack on the bus.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub published: Vec<u8>,
    pub failed: Vec<(u8, PackFailure)>,
    /// Shutdown arrived before every pack was polled.
    pub interrupted: bool,
}

pub struct Orchestrator {
    scheduler: BusScheduler,
    settings: OrchestratorSettings,
    queue: PublishQueue,
    packs: Vec<PackState>,
    cycles: u64,
}

impl Orchestrator {
    pub fn new(scheduler: BusScheduler, settings: OrchestratorSettings, queue: PublishQueue) -> Self {
        let packs = settings.addresses.iter().copied().map(PackState::new).collect();
        Self {
            scheduler,
            settings,
            queue,
            packs,
            cycles: 0,
        }
    }

    pub fn packs(&self) -> &[PackState] {
        &self.packs
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Poll every pack once.
    ///
    /// Per-pack failures are reported, not returned. Only a transport failure
    /// ends the cycle early with an error.
    pub fn run_cycle(&mut self, shutdown: &ShutdownSignal) -> Result<CycleReport, TransportError> {
        self.cycles += 1;
        let mut report = CycleReport {
            cycle: self.cycles,
            ..Default::default()
        };

        for index in 0..self.packs.len() {
            if shutdown.is_triggered() {
                report.interrupted = true;
                break;
            }
            let address = self.packs[index].address;
            match self.poll_pack(address) {
                Ok(record) => {
                    self.packs[index].record_success(record.clone());
                    self.queue.submit(record);
                    report.published.push(address);
                }
                Err(PackFailure::Poll {
                    source: PollError::Transport { source },
                    ..
                }) => return Err(source),
                Err(failure) => {
                    let state = &mut self.packs[index];
                    state.record_failure();
                    log::warn!(
                        "Pack{address}: no update this cycle ({} consecutive failures): {failure}",
                        state.consecutive_failures
                    );
                    report.failed.push((address, failure));
                }
            }
        }

        log::info!(
            "{}: cycle {} published {}/{} packs",
            self.scheduler.describe(),
            report.cycle,
            report.published.len(),
            self.packs.len()
        );
        Ok(report)
    }

    fn poll_pack(&mut self, address: u8) -> Result<PackRecord, PackFailure> {
        let frame = self
            .scheduler
            .poll(address, Command::Telemetry)
            .map_err(|source| PackFailure::Poll {
                command: Command::Telemetry,
                source,
            })?;
        let telemetry = TelemetryRecord::decode(&frame.payload, &self.settings.limits)
            .map_err(|source| PackFailure::Decode { source })?;

        let frame = self
            .scheduler
            .poll(address, Command::Telesignalization)
            .map_err(|source| PackFailure::Poll {
                command: Command::Telesignalization,
                source,
            })?;
        let telesignalization = TelesignalizationRecord::decode(&frame.payload)
            .map_err(|source| PackFailure::Decode { source })?;

        log::debug!(
            "Pack{address}: {:.2} V, {:.2} A, SOC {:.1} %",
            telemetry.total_pack_voltage,
            telemetry.dis_charge_current,
            telemetry.soc
        );
        Ok(PackRecord {
            address,
            last_update: Local::now(),
            telemetry,
            telesignalization,
        })
    }

    /// Run cycles until shutdown, `max_cycles`, or a transport failure.
    ///
    /// An exchange in flight when shutdown arrives is allowed to finish.
    pub fn run(&mut self, shutdown: &ShutdownSignal) -> Result<u64, TransportError> {
        while !shutdown.is_triggered() {
            let report = self.run_cycle(shutdown)?;
            if report.interrupted {
                break;
            }
            if self
                .settings
                .max_cycles
                .is_some_and(|limit| self.cycles >= limit)
            {
                break;
            }
            if shutdown.wait_timeout(self.settings.update_interval) {
                break;
            }
        }
        log::info!(
            "{}: stopped after {} cycles",
            self.scheduler.describe(),
            self.cycles
        );
        Ok(self.cycles)
    }
}
