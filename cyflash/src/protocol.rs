//! Frame encoding/decoding and per-command payload codecs.
//!
//! Multi-byte payload fields use `scroll`'s `Pread`/`Pwrite`, the same crate and calling
//! convention the teacher library uses for its own command payloads.

use crate::checksum::ChecksumKind;
use crate::error::{ChecksumSubkind, CyflashError, Result};
use scroll::{Pread, Pwrite, LE};

pub const SOP: u8 = 0x01;
pub const EOP: u8 = 0x17;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandCode {
    VerifyChecksum = 0x31,
    GetFlashSize = 0x32,
    EraseRow = 0x34,
    SyncBootloader = 0x35,
    SendData = 0x37,
    EnterBootloader = 0x38,
    ProgramRow = 0x39,
    VerifyRow = 0x3A,
    ExitBootloader = 0x3B,
    GetMetadata = 0x3C,
}

impl CommandCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A request frame's command code plus its payload, ready to be checksummed and framed.
#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl CommandPacket {
    pub fn new(code: CommandCode, payload: Vec<u8>) -> Self {
        CommandPacket {
            code: code.code(),
            payload,
        }
    }

    pub fn enter_bootloader() -> Self {
        Self::new(CommandCode::EnterBootloader, Vec::new())
    }

    pub fn exit_bootloader() -> Self {
        Self::new(CommandCode::ExitBootloader, Vec::new())
    }

    pub fn sync_bootloader() -> Self {
        Self::new(CommandCode::SyncBootloader, Vec::new())
    }

    pub fn verify_checksum() -> Self {
        Self::new(CommandCode::VerifyChecksum, Vec::new())
    }

    pub fn get_flash_size(array_id: u8) -> Self {
        Self::new(CommandCode::GetFlashSize, vec![array_id])
    }

    pub fn get_metadata(app_index: u8) -> Self {
        Self::new(CommandCode::GetMetadata, vec![app_index])
    }

    pub fn erase_row(array_id: u8, row_number: u16) -> Self {
        let mut payload = vec![array_id, 0, 0];
        payload
            .pwrite_with(row_number, 1, LE)
            .expect("2-byte row number always fits");
        Self::new(CommandCode::EraseRow, payload)
    }

    pub fn verify_row(array_id: u8, row_number: u16) -> Self {
        let mut payload = vec![array_id, 0, 0];
        payload
            .pwrite_with(row_number, 1, LE)
            .expect("2-byte row number always fits");
        Self::new(CommandCode::VerifyRow, payload)
    }

    pub fn send_data(chunk: &[u8]) -> Self {
        Self::new(CommandCode::SendData, chunk.to_vec())
    }

    pub fn program_row(array_id: u8, row_number: u16, data: &[u8]) -> Self {
        let mut payload = vec![0u8; 3 + data.len()];
        payload[0] = array_id;
        payload
            .pwrite_with(row_number, 1, LE)
            .expect("2-byte row number always fits");
        payload[3..].copy_from_slice(data);
        Self::new(CommandCode::ProgramRow, payload)
    }

    /// Encodes `SOP | code | len_lo | len_hi | payload | cksum_lo | cksum_hi | EOP`.
    pub fn encode(&self, checksum_kind: ChecksumKind) -> Vec<u8> {
        let mut frame = Vec::with_capacity(8 + self.payload.len());
        frame.push(SOP);
        frame.push(self.code);
        let len = self.payload.len() as u16;
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&self.payload);
        let cksum = checksum_kind.compute(&frame);
        frame.extend_from_slice(&cksum.to_le_bytes());
        frame.push(EOP);
        frame
    }
}

/// A decoded response frame: the status byte and whatever payload followed it.
#[derive(Debug, Clone)]
pub struct ResponsePacket {
    pub status: u8,
    pub payload: Vec<u8>,
}

impl ResponsePacket {
    /// Validates and decodes a complete logical packet as handed back by a transport.
    ///
    /// Checks SOP/EOP, declared-length consistency, and the frame checksum, in that order, per
    /// the declared-length/SOP/EOP/checksum decode-validation rule.
    pub fn decode(frame: &[u8], checksum_kind: ChecksumKind) -> Result<Self> {
        if frame.len() < 7 {
            return Err(CyflashError::Framing(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        if frame[0] != SOP {
            return Err(CyflashError::Framing(format!(
                "missing SOP, saw 0x{:02X}",
                frame[0]
            )));
        }
        if *frame.last().unwrap() != EOP {
            return Err(CyflashError::Framing(format!(
                "missing EOP, saw 0x{:02X}",
                frame.last().unwrap()
            )));
        }

        let status = frame[1];
        let len: u16 = frame
            .pread_with(2, LE)
            .map_err(|_| CyflashError::Framing("truncated length field".into()))?;
        let len = len as usize;

        let expected_total = 4 + len + 3; // header(4) + payload + checksum(2) + EOP(1)
        if frame.len() != expected_total {
            return Err(CyflashError::Framing(format!(
                "declared length {} implies a {}-byte frame, got {}",
                len,
                expected_total,
                frame.len()
            )));
        }

        let payload = frame[4..4 + len].to_vec();
        let checksum_region = &frame[..4 + len];
        let received_checksum: u16 = frame
            .pread_with(4 + len, LE)
            .map_err(|_| CyflashError::Framing("truncated checksum field".into()))?;

        if !checksum_kind.verify(checksum_region, received_checksum) {
            return Err(CyflashError::Checksum {
                subkind: ChecksumSubkind::Frame,
            });
        }

        Ok(ResponsePacket { status, payload })
    }
}

/// Result of `EnterBootloader`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootloaderIdentity {
    pub silicon_id: u32,
    pub silicon_rev: u8,
    /// 24-bit, little-endian nibble-encoded as major.minor.patch.
    pub bootloader_version: u32,
}

impl BootloaderIdentity {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(CyflashError::Framing(format!(
                "EnterBootloader response too short: {} bytes",
                payload.len()
            )));
        }
        let silicon_id: u32 = payload.pread_with(0, LE)?;
        let silicon_rev: u8 = payload.pread_with(4, LE)?;
        let version_bytes = [payload[5], payload[6], payload[7], 0];
        let bootloader_version = u32::from_le_bytes(version_bytes);
        Ok(BootloaderIdentity {
            silicon_id,
            silicon_rev,
            bootloader_version,
        })
    }

    pub fn version_major(&self) -> u8 {
        (self.bootloader_version & 0xFF) as u8
    }

    pub fn version_minor(&self) -> u8 {
        ((self.bootloader_version >> 8) & 0xFF) as u8
    }

    pub fn version_patch(&self) -> u8 {
        ((self.bootloader_version >> 16) & 0xFF) as u8
    }
}

/// Result of `GetFlashSize`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlashArrayInfo {
    pub array_id: u8,
    pub first_row: u16,
    pub last_row: u16,
}

impl FlashArrayInfo {
    pub fn decode(array_id: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(CyflashError::Framing(format!(
                "GetFlashSize response too short: {} bytes",
                payload.len()
            )));
        }
        let first_row: u16 = payload.pread_with(0, LE)?;
        let last_row: u16 = payload.pread_with(2, LE)?;
        Ok(FlashArrayInfo {
            array_id,
            first_row,
            last_row,
        })
    }

    pub fn contains(&self, row: u16) -> bool {
        row >= self.first_row && row <= self.last_row
    }
}

/// The application-identifying block. Decodable either from the first 32
/// bytes of a `GetMetadata` response, or from the same slice inside a metadata flash row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AppMetadata {
    pub app_id: u16,
    pub app_version: u16,
    pub custom_id: u32,
}

impl AppMetadata {
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < 20 {
            return Err(CyflashError::Framing(format!(
                "metadata block too short: {} bytes",
                block.len()
            )));
        }
        let app_version: u16 = block.pread_with(12, LE)?;
        let app_id: u16 = block.pread_with(14, LE)?;
        let custom_id: u32 = block.pread_with(16, LE)?;
        Ok(AppMetadata {
            app_id,
            app_version,
            custom_id,
        })
    }

    pub fn version_major(&self) -> u8 {
        (self.app_version >> 8) as u8
    }

    pub fn version_minor(&self) -> u8 {
        (self.app_version & 0xFF) as u8
    }
}
