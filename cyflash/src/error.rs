//! Error taxonomy for the flashing protocol engine.

use maplit::hashmap;
use std::convert::TryFrom;

/// Status byte returned in a bootloader response packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BootloaderStatus {
    Success,
    BadKey,
    BadLength,
    BadData,
    BadCommand,
    BadDevice,
    BadVersion,
    BadChecksum,
    BadArray,
    BadRow,
    BadApp,
    InvalidApp,
    Unknown(u8),
}

impl BootloaderStatus {
    pub fn code(self) -> u8 {
        match self {
            BootloaderStatus::Success => 0x00,
            BootloaderStatus::BadKey => 0x01,
            BootloaderStatus::BadLength => 0x03,
            BootloaderStatus::BadData => 0x04,
            BootloaderStatus::BadCommand => 0x05,
            BootloaderStatus::BadDevice => 0x06,
            BootloaderStatus::BadVersion => 0x07,
            BootloaderStatus::BadChecksum => 0x08,
            BootloaderStatus::BadArray => 0x09,
            BootloaderStatus::BadRow => 0x0A,
            BootloaderStatus::BadApp => 0x0C,
            BootloaderStatus::InvalidApp => 0x0D,
            BootloaderStatus::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, BootloaderStatus::Success)
    }

    pub fn message(self) -> String {
        status_messages()
            .get(&self.code())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("unrecognized bootloader status 0x{:02X}", self.code()))
    }
}

impl From<u8> for BootloaderStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => BootloaderStatus::Success,
            0x01 => BootloaderStatus::BadKey,
            0x03 => BootloaderStatus::BadLength,
            0x04 => BootloaderStatus::BadData,
            0x05 => BootloaderStatus::BadCommand,
            0x06 => BootloaderStatus::BadDevice,
            0x07 => BootloaderStatus::BadVersion,
            0x08 => BootloaderStatus::BadChecksum,
            0x09 => BootloaderStatus::BadArray,
            0x0A => BootloaderStatus::BadRow,
            0x0C => BootloaderStatus::BadApp,
            0x0D => BootloaderStatus::InvalidApp,
            other => BootloaderStatus::Unknown(other),
        }
    }
}

impl TryFrom<u8> for BootloaderStatus {
    type Error = std::convert::Infallible;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(BootloaderStatus::from(value))
    }
}

fn status_messages() -> std::collections::HashMap<u8, &'static str> {
    hashmap! {
        0x00u8 => "success",
        0x01u8 => "bad key in flashing command",
        0x03u8 => "bad packet length",
        0x04u8 => "bad data payload",
        0x05u8 => "unrecognized command",
        0x06u8 => "device does not match image",
        0x07u8 => "bootloader version mismatch",
        0x08u8 => "bad packet checksum",
        0x09u8 => "bad flash array id",
        0x0Au8 => "bad flash row number",
        0x0Cu8 => "bad application id",
        0x0Du8 => "application is invalid",
        0x0Fu8 => "unknown bootloader error",
    }
}

/// Why a `ChecksumError` was raised; kept distinct so callers can tell truncation from corruption.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChecksumSubkind {
    /// The protocol frame's own SOP..payload checksum didn't verify.
    Frame,
    /// `VerifyRow`'s returned byte didn't match the locally computed row checksum.
    Row,
    /// `VerifyChecksum` returned zero (device reports its overall checksum as bad).
    Overall,
}

/// Why a downgrade/app-mismatch was declined.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MetadataConflictReason {
    Downgrade,
    DifferentApp,
}

#[derive(Debug, thiserror::Error)]
pub enum CyflashError {
    #[error("transport I/O error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("malformed packet framing: {0}")]
    Framing(String),

    #[error("checksum error ({subkind:?})")]
    Checksum { subkind: ChecksumSubkind },

    #[error("bootloader reported an error: {} (0x{:02X})", .0.message(), .0.code())]
    Bootloader(BootloaderStatus),

    #[error(
        "image targets silicon id 0x{expected_id:08X} rev {expected_rev}, device reports \
         0x{actual_id:08X} rev {actual_rev}"
    )]
    InvalidSilicon {
        expected_id: u32,
        expected_rev: u8,
        actual_id: u32,
        actual_rev: u8,
    },

    #[error("row {row} of array {array} falls outside the device's flash range")]
    RowRange { array: u8, row: u16 },

    #[error("metadata conflict: {reason:?}")]
    MetadataConflict { reason: MetadataConflictReason },

    #[error("failed to parse .cyacd image: {0}")]
    ImageParse(String),

    #[error("operation canceled by user")]
    Canceled,

    #[error("payload codec error: {0}")]
    Codec(#[from] scroll::Error),
}

pub type Result<T> = std::result::Result<T, CyflashError>;
