#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use seplos_mqtt::api::transport::{Transport, TransportError};
use seplos_mqtt::protocol::{
    frame::{Frame, DEVICE_TYPE_BATTERY, PROTOCOL_VERSION},
    telemetry::fixture::TelemetryPayload,
    telesignalization::fixture::TelesignalizationPayload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// A complete request frame was written.
    Request { address: u8, command: u8 },
    /// The last byte of a response was handed to the reader.
    Delivered { address: u8 },
}

/// Shared view of what happened on a simulated bus.
#[derive(Clone, Default)]
pub struct BusLog {
    events: Arc<Mutex<Vec<(Instant, BusEvent)>>>,
}

impl BusLog {
    fn push(&self, event: BusEvent) {
        self.events.lock().push((Instant::now(), event));
    }

    pub fn events(&self) -> Vec<(Instant, BusEvent)> {
        self.events.lock().clone()
    }

    pub fn requests_to(&self, address: u8) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(_, event)| matches!(event, BusEvent::Request { address: a, .. } if *a == address))
            .count()
    }
}

/// In-memory bus with a set of answering packs. Silent addresses never reply.
pub struct SimulatedBus {
    name: String,
    silent: HashSet<u8>,
    pending: Vec<u8>,
    pending_from: Option<u8>,
    log: BusLog,
    fail_after_writes: Option<usize>,
    writes: usize,
}

impl SimulatedBus {
    pub fn new(name: &str) -> (Self, BusLog) {
        let log = BusLog::default();
        let bus = Self {
            name: name.to_string(),
            silent: HashSet::new(),
            pending: Vec::new(),
            pending_from: None,
            log: log.clone(),
            fail_after_writes: None,
            writes: 0,
        };
        (bus, log)
    }

    pub fn silent(mut self, address: u8) -> Self {
        self.silent.insert(address);
        self
    }

    /// Every write after the first `writes` fails as if the port vanished.
    pub fn fail_after(mut self, writes: usize) -> Self {
        self.fail_after_writes = Some(writes);
        self
    }
}

pub fn response(address: u8, command: u8) -> Vec<u8> {
    let payload = match command {
        0x42 => TelemetryPayload::default()
            .current_centiamps(-1250)
            .build(),
        // Standby
        _ => TelesignalizationPayload::default().set(38, 0b0001_0000).build(),
    };
    Frame {
        version: PROTOCOL_VERSION,
        address,
        device_type: DEVICE_TYPE_BATTERY,
        command: 0x00,
        payload,
    }
    .encode()
    .expect("fixture payload fits in a frame")
}

impl Transport for SimulatedBus {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.fail_after_writes.is_some_and(|limit| self.writes >= limit) {
            return Err(TransportError::Closed {
                target: self.name.clone(),
            });
        }
        self.writes += 1;
        let request = Frame::decode(bytes).expect("scheduler writes valid frames");
        self.log.push(BusEvent::Request {
            address: request.address,
            command: request.command,
        });
        if !self.silent.contains(&request.address) {
            self.pending = response(request.address, request.command);
            self.pending_from = Some(request.address);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.pending.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            return Ok(0);
        }
        // Deliver in small chunks like a slow serial line.
        let n = self.pending.len().min(buf.len()).min(32);
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        if self.pending.is_empty() {
            if let Some(address) = self.pending_from.take() {
                self.log.push(BusEvent::Delivered { address });
            }
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        self.pending_from = None;
        Ok(())
    }

    fn describe(&self) -> &str {
        &self.name
    }
}
