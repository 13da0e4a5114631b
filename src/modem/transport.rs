//! Byte-oriented duplex link to the modem.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::debug;

use crate::config::SerialConfig;
use crate::error::Result;

/// Duplex byte stream to the modem.
///
/// Implementations must not block on reads: `read_available` returns only
/// what is already buffered, so the command engine can poll on its own
/// schedule.
pub trait Transport: Send {
    fn name(&self) -> &str;

    /// Bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Append all currently buffered input to `buf`, returning the count.
    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Discard stale inbound bytes.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        (**self).bytes_available()
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        (**self).read_available(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write_all(data)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear_input()
    }
}

/// Serial UART transport backed by the `serialport` crate.
pub struct SerialTransport {
    name: String,
    port: Box<dyn SerialPort>,
}

/// Consecutive write timeouts tolerated while pushing one buffer.
const MAX_WRITE_STALLS: u32 = 30;

impl SerialTransport {
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port, config.baudrate)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .open()?;

        debug!(port = %config.port, baud = config.baudrate, "Serial port opened");

        Ok(Self {
            name: config.port.clone(),
            port,
        })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let available = self.bytes_available()?;
        if available == 0 {
            return Ok(0);
        }

        let start = buf.len();
        buf.resize(start + available, 0);
        match self.port.read(&mut buf[start..]) {
            Ok(n) => {
                buf.truncate(start + n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                buf.truncate(start);
                Ok(0)
            }
            Err(e) => {
                buf.truncate(start);
                Err(e)
            }
        }
    }

    fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        // Large chunks outlast the port timeout at low baud rates.
        let mut stalls = 0;
        while !data.is_empty() {
            match self.port.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    data = &data[n..];
                    stalls = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut && stalls < MAX_WRITE_STALLS => {
                    stalls += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.port.flush()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
