//! The transport capability set both concrete transports satisfy.
//!
//! One trait, two implementations — no inheritance chain.

use crate::error::{CyflashError, Result};
use std::io;
use std::time::Duration;

#[cfg(feature = "serial")]
pub mod serial;

#[cfg(feature = "can")]
pub mod can;

/// Maps a raw I/O error into the crate's error taxonomy: timeouts become `Timeout`, everything
/// else becomes `Transport`.
pub(crate) fn map_io_err(err: io::Error) -> CyflashError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof => {
            CyflashError::Timeout
        }
        _ => CyflashError::Transport(err),
    }
}

/// A bidirectional, packet-framed byte channel with timeouts.
///
/// `send` transmits one complete, caller-framed logical packet. `receive` returns the next
/// complete logical packet or fails with [`crate::error::CyflashError::Timeout`]. A transport is
/// single-owner: callers must not invoke `send`/`receive` concurrently on the same instance.
pub trait Transport {
    /// Transmits one complete logical packet.
    fn send(&mut self, packet: &[u8]) -> Result<()>;

    /// Blocks for up to `timeout` for the next complete logical packet, capped defensively at
    /// `max_bytes` (a packet larger than this is treated as a framing error rather than silently
    /// truncated).
    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Releases the underlying resource. Best-effort; most transports tolerate being dropped
    /// without an explicit close.
    fn close(&mut self) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        (**self).send(packet)
    }

    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        (**self).receive(max_bytes, timeout)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
