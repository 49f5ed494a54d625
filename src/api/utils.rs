use std::time::Duration;

use super::transport::{open_transport, Transport, TransportError};

/// Attempts made to open a bus before the failure is reported.
pub const TRANSPORT_OPEN_RETRIES: u32 = 3;
const TRANSPORT_OPEN_BACKOFF: Duration = Duration::from_secs(1);

/// Open a serial port with the requested timeout, enabling exclusive access on Unix systems.
pub fn open_serial_port(
    port: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn serialport::SerialPort>, TransportError> {
    let open_error = |reason: String| TransportError::Open {
        target: port.to_string(),
        reason,
    };
    let builder = serialport::new(port, baud_rate).timeout(timeout);

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| open_error(err.to_string()))?;
        handle
            .set_exclusive(true)
            .map_err(|err| open_error(format!("no exclusive access: {err}")))?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder.open().map_err(|err| open_error(err.to_string()))
    }
}

/// Open `target`, retrying a few times so a bridge that is still starting
/// up does not abort the process.
pub fn open_transport_with_retry(
    target: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn Transport>, TransportError> {
    let mut attempt = 1;
    loop {
        log::info!(
            "Attempting to open {target} at {baud_rate} baud (attempt {attempt}/{TRANSPORT_OPEN_RETRIES})"
        );
        match open_transport(target, baud_rate, timeout) {
            Ok(transport) => {
                if attempt > 1 {
                    log::info!("Opened {target} after {attempt} attempts");
                }
                return Ok(transport);
            }
            Err(err) if attempt < TRANSPORT_OPEN_RETRIES => {
                log::warn!(
                    "Failed to open {target} (attempt {attempt}/{TRANSPORT_OPEN_RETRIES}): {err}"
                );
                std::thread::sleep(TRANSPORT_OPEN_BACKOFF);
                attempt += 1;
            }
            Err(err) => {
                log::error!("Giving up on {target} after {TRANSPORT_OPEN_RETRIES} attempts: {err}");
                return Err(err);
            }
        }
    }
}
