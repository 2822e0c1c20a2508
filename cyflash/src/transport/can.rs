//! CAN transport: one logical packet fragmented across multiple 8-byte standard-ID frames, with
//! the firmware-observed byte permutation applied symmetrically on both directions.
//!
//! The chunk/permute/reassemble core is plain functions and a small [`Reassembler`] struct with
//! no socket dependency, so it is fully unit-testable; [`CanTransport`] wraps it with a real
//! `socketcan::CanSocket`.

use crate::error::{CyflashError, Result};
use crate::protocol::{EOP, SOP};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Id, Socket, StandardId};
use std::time::{Duration, Instant};

use super::{map_io_err, Transport};

pub const CHUNK_LEN: usize = 8;

/// The firmware-observed byte permutation, applied within each 8-byte (or shorter, for the
/// final chunk) group.
const PERM: [usize; 8] = [3, 2, 1, 0, 7, 6, 5, 4];

/// Applies the documented permutation to one logical chunk (at most [`CHUNK_LEN`] bytes),
/// producing the bytes actually placed on the wire.
pub fn permute_chunk(chunk: &[u8]) -> Vec<u8> {
    assert!(chunk.len() <= CHUNK_LEN, "chunk exceeds CAN frame payload");
    let mut padded = [0u8; CHUNK_LEN];
    padded[..chunk.len()].copy_from_slice(chunk);

    let mut wire = Vec::with_capacity(chunk.len());
    for &src in PERM.iter() {
        if src < chunk.len() {
            wire.push(padded[src]);
        }
    }
    wire
}

/// Inverts [`permute_chunk`] given the wire bytes of one CAN frame's data field.
pub fn unpermute_chunk(wire: &[u8]) -> Vec<u8> {
    let len = wire.len();
    let mut logical = vec![0u8; len];
    let mut wire_iter = wire.iter();
    for &src in PERM.iter() {
        if src < len {
            logical[src] = *wire_iter
                .next()
                .expect("unpermute_chunk input must come from permute_chunk of the same length");
        }
    }
    logical
}

/// Splits a logical packet into the wire-ready (permuted) byte groups for one CAN frame each.
pub fn chunk_packet(packet: &[u8]) -> Vec<Vec<u8>> {
    if packet.is_empty() {
        return Vec::new();
    }
    packet.chunks(CHUNK_LEN).map(permute_chunk).collect()
}

/// Accumulates inbound CAN frame payloads (already permutation-inverted per frame) until a
/// complete logical packet (SOP, consistent length, EOP) has arrived.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler { buf: Vec::new() }
    }

    /// Feeds one CAN frame's raw (still-permuted) data bytes. Returns the complete logical
    /// packet once the buffer begins with SOP, the declared length is consistent, and the frame
    /// ends in EOP.
    pub fn feed(&mut self, wire_chunk: &[u8]) -> Option<Vec<u8>> {
        self.buf.extend_from_slice(&unpermute_chunk(wire_chunk));

        if self.buf.len() < 4 || self.buf[0] != SOP {
            return None;
        }
        let len = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
        let total = 4 + len + 3;
        if self.buf.len() < total {
            return None;
        }
        if self.buf[total - 1] != EOP {
            return None;
        }

        let packet = self.buf[..total].to_vec();
        self.buf.drain(..total);
        Some(packet)
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

#[derive(Debug, Clone)]
pub struct CanSettings {
    pub interface: String,
    pub channel: Option<String>,
    pub bitrate: u32,
    pub device_id: u32,
    pub broadcast_id: Option<u32>,
    pub wildcard_id: Option<u32>,
    pub echo: bool,
}

pub struct CanTransport {
    socket: CanSocket,
    device_id: u32,
    broadcast_id: Option<u32>,
    wildcard_id: Option<u32>,
}

impl CanTransport {
    pub fn open(settings: &CanSettings) -> Result<Self> {
        let socket = CanSocket::open(&settings.interface).map_err(map_io_err)?;
        Ok(CanTransport {
            socket,
            device_id: settings.device_id,
            broadcast_id: settings.broadcast_id,
            wildcard_id: settings.wildcard_id,
        })
    }

    fn accepts(&self, id: u32) -> bool {
        id == self.device_id
            || self.broadcast_id.map_or(false, |b| b == id)
            || self.wildcard_id.map_or(false, |w| w == id)
    }
}

impl Transport for CanTransport {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        let id = StandardId::new(self.device_id as u16)
            .ok_or_else(|| CyflashError::Framing("CAN id does not fit in 11 bits".into()))?;
        for chunk in chunk_packet(packet) {
            let frame = CanFrame::new(id, &chunk)
                .ok_or_else(|| CyflashError::Framing("CAN frame payload too long".into()))?;
            self.socket.write_frame(&frame).map_err(map_io_err)?;
        }
        Ok(())
    }

    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut reassembler = Reassembler::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CyflashError::Timeout);
            }
            self.socket
                .set_read_timeout(remaining)
                .map_err(map_io_err)?;

            let frame = self.socket.read_frame().map_err(map_io_err)?;

            let id = match frame.id() {
                Id::Standard(id) => id.as_raw() as u32,
                Id::Extended(id) => id.as_raw(),
            };
            if !self.accepts(id) {
                continue;
            }

            if let Some(packet) = reassembler.feed(frame.data()) {
                if packet.len() > max_bytes {
                    return Err(CyflashError::Framing(format!(
                        "reassembled packet of {} bytes exceeds max_bytes {}",
                        packet.len(),
                        max_bytes
                    )));
                }
                return Ok(packet);
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
