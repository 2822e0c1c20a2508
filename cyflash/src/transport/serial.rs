//! Serial transport: frames delimited by the protocol's own SOP/EOP and length field.
//!
//! The framing reader (`read_frame`) is generic over any [`std::io::Read`], so it can drive a
//! real `serialport::SerialPort` in production and an in-memory buffer in tests.

use crate::error::{CyflashError, Result};
use crate::protocol::{EOP, SOP};
use serialport::{Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

use super::{map_io_err, Transport};

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            port: String::new(),
            baud_rate: 115_200,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Scans for SOP (discarding any preceding junk), reads the fixed header, then reads exactly
/// `length + 3` further bytes (payload tail + checksum + EOP). Returns the complete frame,
/// consuming exactly its bytes from `stream`.
pub fn read_frame<R: Read>(stream: &mut R, max_bytes: usize) -> Result<Vec<u8>> {
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).map_err(map_io_err)?;
        if byte[0] == SOP {
            break;
        }
        // A lone non-SOP byte during the scan is buffered junk; discard and keep scanning.
    }

    let mut header = [0u8; 3];
    stream.read_exact(&mut header).map_err(map_io_err)?;
    let len = u16::from_le_bytes([header[1], header[2]]) as usize;

    let total = 4 + len + 3;
    if total > max_bytes {
        return Err(CyflashError::Framing(format!(
            "declared frame length {} exceeds max_bytes {}",
            total, max_bytes
        )));
    }

    let mut tail = vec![0u8; len + 3];
    stream.read_exact(&mut tail).map_err(map_io_err)?;

    if tail[tail.len() - 1] != EOP {
        return Err(CyflashError::Framing(format!(
            "missing EOP, saw 0x{:02X}",
            tail[tail.len() - 1]
        )));
    }

    let mut frame = Vec::with_capacity(total);
    frame.push(SOP);
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&tail);
    Ok(frame)
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(settings: &SerialSettings) -> Result<Self> {
        let port = serialport::new(settings.port.as_str(), settings.baud_rate)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| CyflashError::Transport(io::Error::new(io::ErrorKind::Other, e)))?;
        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet).map_err(map_io_err)
    }

    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.port.set_timeout(timeout).map_err(|e| {
            CyflashError::Transport(io::Error::new(io::ErrorKind::Other, e))
        })?;
        read_frame(&mut self.port, max_bytes)
    }

    fn close(&mut self) -> Result<()> {
        // serialport has no explicit close; the port is released on drop.
        Ok(())
    }
}
