//! Host-side flashing protocol engine for Cypress PSoC bootloaders.
//!
//! Parses a `.cyacd` firmware image, drives the bootloader's request/response protocol over a
//! serial or CAN transport, and orchestrates a full flash session: identity check, optional
//! metadata comparison, row-range validation, optional erase, programming, and final checksum
//! verification.

pub mod checksum;
pub mod client;
pub mod error;
pub mod image;
pub mod protocol;
pub mod session;
pub mod transport;

pub use checksum::ChecksumKind;
pub use client::BootloaderClient;
pub use error::{BootloaderStatus, CyflashError, Result};
pub use image::{Image, Row};
pub use protocol::{AppMetadata, BootloaderIdentity, FlashArrayInfo};
pub use session::{
    CancelSignal, ChunkSize, Confirmation, Options, ProgressEvent, ReinitDuration, Session,
};
pub use transport::Transport;
