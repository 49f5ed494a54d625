//! Byte-level channels to a bus.
//!
//! A [`Transport`] is owned by exactly one [`BusScheduler`](super::scheduler::BusScheduler),
//! which is the only caller of these methods.
use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use derive_more::{Display, Error};

/// Prefix selecting a serial-over-TCP bridge instead of a local device.
pub const TCP_SCHEME: &str = "tcp://";
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Display, Error)]
pub enum TransportError {
    #[display("cannot open {target}: {reason}")]
    Open {
        target: String,
        reason: String,
    },
    #[display("{operation} failed on {target}: {source}")]
    Io {
        target: String,
        operation: &'static str,
        source: io::Error,
    },
    #[display("{target} closed the connection")]
    Closed { target: String },
}

pub trait Transport: Send {
    /// Write the whole buffer.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read what is available, waiting at most the transport's read timeout.
    /// `Ok(0)` means nothing arrived in time.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Drop any unread input, such as a late answer to a timed-out request.
    fn clear_input(&mut self) -> Result<(), TransportError>;

    fn describe(&self) -> &str;
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

pub struct SerialTransport {
    path: String,
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, TransportError> {
        let port = super::utils::open_serial_port(path, baud_rate, timeout)?;
        Ok(Self {
            path: path.to_string(),
            port,
        })
    }

    fn io_error(&self, operation: &'static str, source: io::Error) -> TransportError {
        TransportError::Io {
            target: self.path.clone(),
            operation,
            source,
        }
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port
            .write_all(bytes)
            .and_then(|_| self.port.flush())
            .map_err(|err| self.io_error("write", err))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if is_timeout(&err) => Ok(0),
            Err(err) => Err(self.io_error("read", err)),
        }
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|err| self.io_error("clear", err.into()))
    }

    fn describe(&self) -> &str {
        &self.path
    }
}

/// Serial-over-TCP bridge such as ser2net or a WaveShare gateway.
pub struct TcpTransport {
    target: String,
    stream: TcpStream,
}

impl TcpTransport {
    /// `target` is `tcp://host:port`; `timeout` bounds each read.
    pub fn connect(target: &str, timeout: Duration) -> Result<Self, TransportError> {
        let open_error = |reason: String| TransportError::Open {
            target: target.to_string(),
            reason,
        };
        let address = target.strip_prefix(TCP_SCHEME).unwrap_or(target);
        let socket = address
            .to_socket_addrs()
            .map_err(|err| open_error(err.to_string()))?
            .next()
            .ok_or_else(|| open_error(format!("{address} did not resolve")))?;

        let stream = TcpStream::connect_timeout(&socket, TCP_CONNECT_TIMEOUT)
            .map_err(|err| open_error(err.to_string()))?;
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|err| open_error(err.to_string()))?;

        Ok(Self {
            target: target.to_string(),
            stream,
        })
    }

    fn io_error(&self, operation: &'static str, source: io::Error) -> TransportError {
        TransportError::Io {
            target: self.target.clone(),
            operation,
            source,
        }
    }
}

impl Transport for TcpTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream
            .write_all(bytes)
            .map_err(|err| self.io_error("write", err))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(TransportError::Closed {
                target: self.target.clone(),
            }),
            Ok(n) => Ok(n),
            Err(err) if is_timeout(&err) => Ok(0),
            Err(err) => Err(self.io_error("read", err)),
        }
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.stream
            .set_nonblocking(true)
            .map_err(|err| self.io_error("clear", err))?;
        let mut scratch = [0u8; 256];
        let drained = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => {
                    break Err(TransportError::Closed {
                        target: self.target.clone(),
                    })
                }
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) => break Err(self.io_error("clear", err)),
            }
        };
        self.stream
            .set_nonblocking(false)
            .map_err(|err| self.io_error("clear", err))?;
        drained
    }

    fn describe(&self) -> &str {
        &self.target
    }
}

/// Open the transport named by `target`: `tcp://host:port` or a serial device path.
pub fn open_transport(
    target: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn Transport>, TransportError> {
    if target.starts_with(TCP_SCHEME) {
        Ok(Box::new(TcpTransport::connect(target, timeout)?))
    } else {
        Ok(Box::new(SerialTransport::open(target, baud_rate, timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_transport_exchange() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let target = format!("tcp://{}", listener.local_addr()?);

        let server = std::thread::spawn(move || -> io::Result<Vec<u8>> {
            let (mut socket, _) = listener.accept()?;
            let mut request = [0u8; 5];
            socket.read_exact(&mut request)?;
            socket.write_all(b"pong\r")?;
            Ok(request.to_vec())
        });

        let mut transport = open_transport(&target, 9600, Duration::from_millis(500))?;
        assert_eq!(transport.describe(), target);
        transport.write_all(b"ping\r")?;

        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        while !received.ends_with(b"\r") {
            let n = transport.read(&mut buf)?;
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"pong\r");
        assert_eq!(server.join().expect("server thread")?, b"ping\r");
        Ok(())
    }

    #[test]
    fn test_tcp_read_timeout_returns_zero() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let target = format!("tcp://{}", listener.local_addr()?);
        let mut transport = TcpTransport::connect(&target, Duration::from_millis(50))?;
        let (_socket, _) = listener.accept()?;

        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf)?, 0);
        transport.clear_input()?;
        Ok(())
    }

    #[test]
    fn test_unreachable_tcp_target() {
        let err = TcpTransport::connect("tcp://unresolvable.invalid:1", Duration::from_millis(50))
            .err()
            .expect("connect must fail");
        assert!(matches!(err, TransportError::Open { .. }));
    }
}
