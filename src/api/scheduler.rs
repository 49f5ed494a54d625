//! Serialised request/response exchanges on one bus.
//!
//! The bus is half-duplex and shared by every pack on it. A [`BusScheduler`]
//! owns the transport and `poll` takes `&mut self`, so at most one request is
//! ever outstanding: the next write cannot start before the previous read
//! window has produced a frame or expired.
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};

use super::transport::{Transport, TransportError};
use crate::protocol::{
    frame::{
        self, format_frame, Frame, FrameError, DEVICE_TYPE_BATTERY, PROTOCOL_VERSION, RESPONSE_OK,
    },
    Command,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeSettings {
    /// Attempts per logical request, including the first one.
    pub max_attempts: u32,
    /// Read window of a single attempt.
    pub response_timeout: Duration,
    /// Quiet time on the bus between two exchanges.
    pub settle_delay: Duration,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            response_timeout: Duration::from_millis(500),
            settle_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Display, Error, From)]
pub enum PollError {
    #[display("no response after {attempts} attempts")]
    #[from(ignore)]
    Timeout { attempts: u32 },
    #[display("checksum mismatch on the last of {attempts} attempts")]
    #[from(ignore)]
    ChecksumFailed { attempts: u32 },
    #[display("malformed response after {attempts} attempts: {reason}")]
    #[from(ignore)]
    Malformed { attempts: u32, reason: String },
    #[display("{source}")]
    Transport { source: TransportError },
}

impl PollError {
    /// Only a failing transport ends polling of the bus.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PollError::Transport { .. })
    }
}

/// Why a single attempt did not yield an accepted frame.
#[derive(Debug)]
enum AttemptFailure {
    Timeout,
    Frame(FrameError),
    Unexpected(String),
    Transport(TransportError),
}

impl From<TransportError> for AttemptFailure {
    fn from(err: TransportError) -> Self {
        AttemptFailure::Transport(err)
    }
}

impl AttemptFailure {
    fn into_poll_error(self, attempts: u32) -> PollError {
        match self {
            AttemptFailure::Timeout => PollError::Timeout { attempts },
            AttemptFailure::Frame(err) if err.is_checksum() => {
                PollError::ChecksumFailed { attempts }
            }
            AttemptFailure::Frame(err) => PollError::Malformed {
                attempts,
                reason: err.to_string(),
            },
            AttemptFailure::Unexpected(reason) => PollError::Malformed { attempts, reason },
            AttemptFailure::Transport(source) => PollError::Transport { source },
        }
    }
}

pub struct BusScheduler {
    transport: Box<dyn Transport>,
    settings: ExchangeSettings,
    last_exchange: Option<Instant>,
}

impl BusScheduler {
    pub fn new(transport: Box<dyn Transport>, settings: ExchangeSettings) -> Self {
        Self {
            transport,
            settings,
            last_exchange: None,
        }
    }

    pub fn describe(&self) -> &str {
        self.transport.describe()
    }

    /// Send `command` to `address` and wait for an accepted response.
    ///
    /// A response is accepted only if it decodes cleanly at protocol
    /// version 2.0, comes from `address`, names the battery device type and
    /// carries a normal return code. Anything else is retried until `max_attempts` is spent.
    pub fn poll(&mut self, address: u8, command: Command) -> Result<Frame, PollError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let request = command.request(address).map_err(|err| PollError::Malformed {
            attempts: 0,
            reason: err.to_string(),
        })?;

        let mut attempt = 1;
        loop {
            match self.exchange(address, command, &request) {
                Ok(frame) => {
                    if attempt > 1 {
                        log::debug!("Pack{address}: {command} answered on attempt {attempt}");
                    }
                    return Ok(frame);
                }
                Err(AttemptFailure::Transport(source)) => {
                    return Err(PollError::Transport { source });
                }
                Err(failure) if attempt < max_attempts => {
                    log::debug!(
                        "Pack{address}: {command} attempt {attempt}/{max_attempts} failed: {failure:?}"
                    );
                    attempt += 1;
                }
                Err(failure) => {
                    log::debug!(
                        "Pack{address}: {command} attempt {attempt}/{max_attempts} failed: {failure:?}"
                    );
                    return Err(failure.into_poll_error(attempt));
                }
            }
        }
    }

    fn exchange(
        &mut self,
        address: u8,
        command: Command,
        request: &[u8],
    ) -> Result<Frame, AttemptFailure> {
        self.settle();
        self.transport.clear_input()?;
        log::debug!("Pack{address}: {command} request {}", format_frame(request));
        self.transport.write_all(request)?;

        let received = self.read_frame(command);
        self.last_exchange = Some(Instant::now());
        let received = received?;
        log::debug!("Pack{address}: {command} response {}", format_frame(&received));

        let frame = Frame::decode(&received).map_err(AttemptFailure::Frame)?;
        if frame.version != PROTOCOL_VERSION {
            return Err(AttemptFailure::Unexpected(format!(
                "protocol version 0x{:02X} is not supported",
                frame.version
            )));
        }
        if frame.address != address {
            return Err(AttemptFailure::Unexpected(format!(
                "response from address {} instead of {address}",
                frame.address
            )));
        }
        if frame.device_type != DEVICE_TYPE_BATTERY {
            return Err(AttemptFailure::Unexpected(format!(
                "device type 0x{:02X} is not a battery pack",
                frame.device_type
            )));
        }
        if frame.command != RESPONSE_OK {
            return Err(AttemptFailure::Unexpected(format!(
                "pack rejected the request with return code 0x{:02X}",
                frame.command
            )));
        }
        Ok(frame)
    }

    /// Collect bytes until a terminator follows a start marker or the read
    /// window closes.
    fn read_frame(&mut self, command: Command) -> Result<Vec<u8>, AttemptFailure> {
        let deadline = Instant::now() + self.settings.response_timeout;
        let mut received = Vec::with_capacity(frame::frame_len(command.response_len()));
        let mut chunk = [0u8; 256];

        loop {
            if Instant::now() >= deadline {
                if received.is_empty() {
                    return Err(AttemptFailure::Timeout);
                }
                // Partial or unterminated frame
                return Err(match Frame::decode(&received) {
                    Err(err) => AttemptFailure::Frame(err),
                    Ok(_) => AttemptFailure::Timeout,
                });
            }
            let n = self.transport.read(&mut chunk)?;
            received.extend_from_slice(&chunk[..n]);
            if has_complete_frame(&received) {
                return Ok(received);
            }
        }
    }

    fn settle(&self) {
        let Some(last) = self.last_exchange else {
            return;
        };
        let elapsed = last.elapsed();
        if elapsed < self.settings.settle_delay {
            std::thread::sleep(self.settings.settle_delay - elapsed);
        }
    }
}

fn has_complete_frame(received: &[u8]) -> bool {
    received
        .iter()
        .position(|&b| b == frame::FRAME_START)
        .is_some_and(|start| received[start..].contains(&frame::FRAME_END))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    /// Answers each write with the next scripted reply; `None` stays silent.
    struct ScriptedTransport {
        replies: VecDeque<Option<Vec<u8>>>,
        pending: Vec<u8>,
        writes: Arc<AtomicUsize>,
    }

    impl Transport for ScriptedTransport {
        fn write_all(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if let Some(Some(reply)) = self.replies.pop_front() {
                self.pending = reply;
            }
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            if self.pending.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
                return Ok(0);
            }
            let n = self.pending.len().min(buf.len()).min(7);
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }

        fn clear_input(&mut self) -> Result<(), TransportError> {
            self.pending.clear();
            Ok(())
        }

        fn describe(&self) -> &str {
            "scripted"
        }
    }

    fn response(address: u8, rtn: u8, payload: &[u8]) -> Vec<u8> {
        Frame {
            version: frame::PROTOCOL_VERSION,
            address,
            device_type: DEVICE_TYPE_BATTERY,
            command: rtn,
            payload: payload.to_vec(),
        }
        .encode()
        .unwrap()
    }

    fn settings(max_attempts: u32) -> ExchangeSettings {
        ExchangeSettings {
            max_attempts,
            response_timeout: Duration::from_millis(20),
            settle_delay: Duration::ZERO,
        }
    }

    fn scheduler(
        replies: Vec<Option<Vec<u8>>>,
        max_attempts: u32,
    ) -> (BusScheduler, Arc<AtomicUsize>) {
        let writes = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport {
            replies: replies.into(),
            pending: Vec::new(),
            writes: writes.clone(),
        };
        (
            BusScheduler::new(Box::new(transport), settings(max_attempts)),
            writes,
        )
    }

    #[test]
    fn test_first_attempt_success() {
        let (mut bus, writes) = scheduler(vec![Some(response(1, 0, &[0xAB]))], 3);
        let frame = bus.poll(1, Command::Telemetry).unwrap();
        assert_eq!(frame.payload, vec![0xAB]);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recovers_after_timeout_and_corruption() {
        let mut corrupted = response(0, 0, &[0x10, 0x20]);
        corrupted[15] ^= 0x01;
        let (mut bus, writes) = scheduler(
            vec![None, Some(corrupted), Some(response(0, 0, &[0x10, 0x20]))],
            5,
        );
        let frame = bus.poll(0, Command::Telesignalization).unwrap();
        assert_eq!(frame.payload, vec![0x10, 0x20]);
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_silent_pack_exhausts_attempts() {
        let (mut bus, writes) = scheduler(vec![], 4);
        let err = bus.poll(2, Command::Telemetry).unwrap_err();
        assert!(matches!(err, PollError::Timeout { attempts: 4 }));
        assert!(!err.is_fatal());
        assert_eq!(writes.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_persistent_checksum_failure() {
        let mut bad = response(0, 0, &[0x01]);
        let checksum_char = bad.len() - 2;
        bad[checksum_char] = if bad[checksum_char] == b'0' { b'1' } else { b'0' };
        let (mut bus, _) = scheduler(vec![Some(bad.clone()), Some(bad)], 2);
        assert!(matches!(
            bus.poll(0, Command::Telemetry).unwrap_err(),
            PollError::ChecksumFailed { attempts: 2 }
        ));
    }

    #[test]
    fn test_wrong_address_and_return_code_are_malformed() {
        let (mut bus, _) = scheduler(
            vec![Some(response(3, 0, &[])), Some(response(1, 0x04, &[]))],
            2,
        );
        match bus.poll(1, Command::Telemetry).unwrap_err() {
            PollError::Malformed { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("return code 0x04"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_foreign_protocol_version_is_retried_then_malformed() {
        let mut foreign = Frame {
            version: 0x21,
            address: 0,
            device_type: DEVICE_TYPE_BATTERY,
            command: RESPONSE_OK,
            payload: vec![0x01],
        };
        let newer = foreign.encode().unwrap();
        foreign.version = 0x10;
        let older = foreign.encode().unwrap();
        let (mut bus, writes) = scheduler(vec![Some(newer), Some(older)], 2);
        match bus.poll(0, Command::Telemetry).unwrap_err() {
            PollError::Malformed { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("protocol version 0x10"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(writes.load(Ordering::SeqCst), 2);

        let (mut bus, _) = scheduler(
            vec![Some(foreign.encode().unwrap()), Some(response(0, 0, &[0x01]))],
            2,
        );
        assert_eq!(bus.poll(0, Command::Telemetry).unwrap().payload, vec![0x01]);
    }

    #[test]
    fn test_complete_frame_detection() {
        assert!(!has_complete_frame(b"\r~2000"));
        assert!(has_complete_frame(b"noise~20\r"));
        assert!(!has_complete_frame(b""));
    }
}
