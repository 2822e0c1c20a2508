//! The top-level flashing state machine: `EnterBootloader` → silicon check → optional metadata
//! comparison → row-range check → optional erase pass → program pass → final checksum → exit.
//!
//! Grounded on the teacher's `cargo-hf2` flashing loop (sequential command-then-verify, progress
//! reported to the console) and on `bootload` in `other_examples/68db6ccf_robbym-psoc-bootloader`
//! for the overall header/row/exit sequencing, generalized to the full state machine in §4.4.

use std::time::Duration;

use crate::client::BootloaderClient;
use crate::error::{CyflashError, MetadataConflictReason, Result};
use crate::image::{Image, Row};
use crate::protocol::BootloaderIdentity;
use crate::transport::Transport;

/// Chunk size for `SendData`, bounded by the device's RX/TX buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChunkSize {
    B16,
    B32,
    B64,
    B128,
}

impl ChunkSize {
    pub fn bytes(self) -> usize {
        match self {
            ChunkSize::B16 => 16,
            ChunkSize::B32 => 32,
            ChunkSize::B64 => 64,
            ChunkSize::B128 => 128,
        }
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize::B32
    }
}

impl std::str::FromStr for ChunkSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "16" => Ok(ChunkSize::B16),
            "32" => Ok(ChunkSize::B32),
            "64" => Ok(ChunkSize::B64),
            "128" => Ok(ChunkSize::B128),
            other => Err(format!("chunk size must be one of 16, 32, 64, 128, got {other}")),
        }
    }
}

/// How long `EnterBootloader` keeps reissuing its request. `0` sends once; negative retries
/// forever.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReinitDuration {
    Once,
    Timed(Duration),
    Forever,
}

impl ReinitDuration {
    pub fn from_secs(secs: f64) -> Self {
        if secs == 0.0 {
            ReinitDuration::Once
        } else if secs < 0.0 {
            ReinitDuration::Forever
        } else {
            ReinitDuration::Timed(Duration::from_secs_f64(secs))
        }
    }

    /// The budget handed to `BootloaderClient::enter_bootloader`; `None` means "try once".
    /// `Forever` is approximated by a very long budget since the client's loop is time-bounded.
    fn budget(self) -> Option<Duration> {
        match self {
            ReinitDuration::Once => None,
            ReinitDuration::Timed(d) => Some(d),
            ReinitDuration::Forever => Some(Duration::from_secs(u64::MAX / 2)),
        }
    }
}

/// Session-level configuration, built by the CLI from parsed arguments or directly by a library
/// consumer.
#[derive(Debug, Clone)]
pub struct Options {
    pub erase: bool,
    pub chunk_size: ChunkSize,
    pub reinit_duration: ReinitDuration,
    pub allow_downgrade: bool,
    pub allow_different_app: bool,
    pub app_index: u8,
    /// Row-level retry cap before a persistent per-row failure is raised.
    pub max_row_retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            erase: false,
            chunk_size: ChunkSize::default(),
            reinit_duration: ReinitDuration::Timed(Duration::from_secs(2)),
            allow_downgrade: false,
            allow_different_app: false,
            app_index: 0,
            max_row_retries: 3,
        }
    }
}

/// Structured progress events emitted for UI/test consumption. The orchestrator has no opinion on
/// rendering; a CLI or test harness subscribes via a plain closure.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    EnteredBootloader { identity: BootloaderIdentity },
    ArrayRange { array: u8, first: u16, last: u16 },
    Erasing { row: u16, total: usize, errors: u32 },
    Programming { row: u16, total: usize, errors: u32 },
    Verified { ok: bool },
    Rebooting,
}

/// Injected capability for interactive yes/no prompts (downgrade / different-app confirmation).
/// A CLI implements this with a terminal prompt; tests implement it with a canned answer.
pub trait Confirmation {
    fn confirm(&mut self, prompt: &str) -> bool;
}

/// Always declines — the conservative default when no interactive confirmation is wired up.
pub struct AlwaysDecline;

impl Confirmation for AlwaysDecline {
    fn confirm(&mut self, _prompt: &str) -> bool {
        false
    }
}

/// Injected cancellation signal; polled between rows. `Cell`/`Arc<AtomicBool>`-backed
/// implementations are typical; the default never cancels.
pub trait CancelSignal {
    fn is_canceled(&self) -> bool;
}

impl CancelSignal for () {
    fn is_canceled(&self) -> bool {
        false
    }
}

/// Drives one flashing session end to end over an owned transport.
pub struct Session<T: Transport> {
    client: BootloaderClient<T>,
    options: Options,
    packet_errors: u32,
}

impl<T: Transport> Session<T> {
    pub fn new(client: BootloaderClient<T>, options: Options) -> Self {
        Session {
            client,
            options,
            packet_errors: 0,
        }
    }

    pub fn packet_errors(&self) -> u32 {
        self.packet_errors
    }

    /// Runs the full state machine against `image`, emitting progress events through `on_event`.
    pub fn flash(
        &mut self,
        image: &Image,
        confirmation: &mut dyn Confirmation,
        cancel: &dyn CancelSignal,
        mut on_event: impl FnMut(ProgressEvent),
    ) -> Result<()> {
        log::info!("entering bootloader");
        let identity = self.enter(image)?;
        on_event(ProgressEvent::EnteredBootloader { identity });

        self.verify_silicon(image, &identity)?;

        self.check_metadata(image, confirmation)?;

        let mut array_ranges = Vec::new();
        for array_id in image.array_ids() {
            let info = self.client.get_flash_size(array_id)?;
            on_event(ProgressEvent::ArrayRange {
                array: array_id,
                first: info.first_row,
                last: info.last_row,
            });
            for row in image.rows_for_array(array_id) {
                if !info.contains(row.row_number) {
                    return Err(CyflashError::RowRange {
                        array: array_id,
                        row: row.row_number,
                    });
                }
            }
            array_ranges.push(info);
        }

        if self.options.erase {
            let total = image.rows.len();
            for (i, row) in image.rows.iter().enumerate() {
                if cancel.is_canceled() {
                    return Err(CyflashError::Canceled);
                }
                self.client.erase_row(row.array_id, row.row_number)?;
                on_event(ProgressEvent::Erasing {
                    row: row.row_number,
                    total,
                    errors: self.packet_errors,
                });
                let _ = i;
            }
        }

        let total = image.rows.len();
        for row in &image.rows {
            if cancel.is_canceled() {
                return Err(CyflashError::Canceled);
            }
            self.program_row_with_retry(row)?;
            on_event(ProgressEvent::Programming {
                row: row.row_number,
                total,
                errors: self.packet_errors,
            });
        }

        log::info!("verifying overall checksum");
        let ok = self.client.verify_checksum()?;
        on_event(ProgressEvent::Verified { ok });
        if !ok {
            return Err(CyflashError::Checksum {
                subkind: crate::error::ChecksumSubkind::Overall,
            });
        }

        on_event(ProgressEvent::Rebooting);
        log::info!("rebooting device");
        self.client.exit_bootloader()?;

        Ok(())
    }

    fn enter(&mut self, image: &Image) -> Result<BootloaderIdentity> {
        match self
            .client
            .enter_bootloader(self.options.reinit_duration.budget())
        {
            Ok(identity) => Ok(identity),
            Err(CyflashError::Bootloader(status)) if status.code() == 0x01 => {
                log::error!("bootloader key mismatch; device is not responding as expected");
                Err(CyflashError::Bootloader(status))
            }
            Err(other) => {
                let _ = image;
                Err(other)
            }
        }
    }

    fn verify_silicon(&self, image: &Image, identity: &BootloaderIdentity) -> Result<()> {
        if identity.silicon_id != image.silicon_id || identity.silicon_rev != image.silicon_rev {
            return Err(CyflashError::InvalidSilicon {
                expected_id: image.silicon_id,
                expected_rev: image.silicon_rev,
                actual_id: identity.silicon_id,
                actual_rev: identity.silicon_rev,
            });
        }
        Ok(())
    }

    fn check_metadata(&mut self, image: &Image, confirmation: &mut dyn Confirmation) -> Result<()> {
        let image_metadata = match image.rows.last().and_then(|r| r.as_metadata().ok()) {
            Some(m) => m,
            None => return Ok(()),
        };

        let device_metadata = match self.client.get_metadata(self.options.app_index) {
            Ok(m) => m,
            Err(CyflashError::Bootloader(status)) if status.code() == 0x05 => {
                log::info!("metadata not supported by this bootloader; skipping check");
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        if device_metadata.app_version > image_metadata.app_version && !self.options.allow_downgrade
        {
            if !confirmation.confirm(&format!(
                "device has newer app version {}.{} than image {}.{}; continue?",
                device_metadata.version_major(),
                device_metadata.version_minor(),
                image_metadata.version_major(),
                image_metadata.version_minor(),
            )) {
                return Err(CyflashError::MetadataConflict {
                    reason: MetadataConflictReason::Downgrade,
                });
            }
        }

        if device_metadata.app_id != image_metadata.app_id && !self.options.allow_different_app {
            if !confirmation.confirm(&format!(
                "device app id 0x{:04X} differs from image app id 0x{:04X}; continue?",
                device_metadata.app_id, image_metadata.app_id,
            )) {
                return Err(CyflashError::MetadataConflict {
                    reason: MetadataConflictReason::DifferentApp,
                });
            }
        }

        Ok(())
    }

    /// Streams a row's data via `SendData` chunks then a final `ProgramRow`, then verifies it.
    /// Retries the whole row up to `max_row_retries` times on any packet error.
    fn program_row_with_retry(&mut self, row: &Row) -> Result<()> {
        let chunk_len = self.options.chunk_size.bytes();
        let mut attempt = 0;
        loop {
            match self.program_and_verify_row(row, chunk_len) {
                Ok(()) => return Ok(()),
                Err(err) if is_packet_error(&err) => {
                    self.packet_errors += 1;
                    attempt += 1;
                    log::warn!(
                        "packet error on row {} of array {} (attempt {}): {}",
                        row.row_number,
                        row.array_id,
                        attempt,
                        err
                    );
                    if attempt > self.options.max_row_retries {
                        log::error!(
                            "row {} of array {} failed after {} attempts",
                            row.row_number,
                            row.array_id,
                            attempt
                        );
                        return Err(err);
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn program_and_verify_row(&mut self, row: &Row, chunk_len: usize) -> Result<()> {
        if row.data.len() > chunk_len {
            let mut offset = 0;
            while row.data.len() - offset > chunk_len {
                self.client.send_data(&row.data[offset..offset + chunk_len])?;
                offset += chunk_len;
            }
            self.client
                .program_row(row.array_id, row.row_number, &row.data[offset..])?;
        } else {
            self.client
                .program_row(row.array_id, row.row_number, &row.data)?;
        }

        let device_checksum = self.client.verify_row(row.array_id, row.row_number)?;
        if device_checksum != row.local_checksum() {
            return Err(CyflashError::Checksum {
                subkind: crate::error::ChecksumSubkind::Row,
            });
        }
        Ok(())
    }
}

/// Whether `err` is a per-row "packet error" (timeout, framing, checksum, or bootloader status)
/// that warrants retrying the whole row, as opposed to a session-level fatal.
fn is_packet_error(err: &CyflashError) -> bool {
    matches!(
        err,
        CyflashError::Timeout
            | CyflashError::Framing(_)
            | CyflashError::Bootloader(_)
            | CyflashError::Checksum {
                subkind: crate::error::ChecksumSubkind::Row
            }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumKind;
    use crate::image::Row;
    use crate::protocol::{CommandCode, ResponsePacket, EOP, SOP};
    use std::collections::VecDeque;

    /// Scripted transport that answers by matching on the request's command code, so tests can
    /// script entire sessions (happy path, errors, retries) without hand-counting exchanges.
    struct MockTransport {
        scripts: std::collections::HashMap<u8, VecDeque<MockReply>>,
        sent_codes: Vec<u8>,
    }

    enum MockReply {
        Success(Vec<u8>),
        Status(u8),
        Timeout,
    }

    impl MockTransport {
        fn new() -> Self {
            MockTransport {
                scripts: std::collections::HashMap::new(),
                sent_codes: Vec::new(),
            }
        }

        fn on(mut self, code: CommandCode, replies: Vec<MockReply>) -> Self {
            self.scripts.insert(code.code(), replies.into());
            self
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, packet: &[u8]) -> Result<()> {
            self.sent_codes.push(packet[1]);
            Ok(())
        }

        fn receive(&mut self, _max_bytes: usize, _timeout: Duration) -> Result<Vec<u8>> {
            let code = *self.sent_codes.last().unwrap();
            let reply = self
                .scripts
                .get_mut(&code)
                .and_then(|q| q.pop_front())
                .unwrap_or(MockReply::Status(0x00));
            match reply {
                MockReply::Success(payload) => Ok(encode_response(0x00, &payload)),
                MockReply::Status(status) => Ok(encode_response(status, &[])),
                MockReply::Timeout => Err(CyflashError::Timeout),
            }
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn encode_response(status: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![SOP, status];
        body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        body.extend_from_slice(payload);
        let cksum = ChecksumKind::Sum2Complement.compute(&body);
        body.extend_from_slice(&cksum.to_le_bytes());
        body.push(EOP);
        body
    }

    fn single_row_image() -> Image {
        Image {
            checksum_kind: ChecksumKind::Sum2Complement,
            silicon_id: 0x04A6_1193,
            silicon_rev: 17,
            rows: vec![Row {
                array_id: 0,
                row_number: 22,
                data: vec![0xAA; 4],
            }],
        }
    }

    fn identity_payload(id: u32, rev: u8) -> Vec<u8> {
        let mut v = id.to_le_bytes().to_vec();
        v.push(rev);
        v.extend_from_slice(&[0x01, 0x00, 0x00]);
        v
    }

    #[test]
    fn happy_path_programs_and_verifies() {
        let image = single_row_image();
        let row_checksum = image.rows[0].local_checksum();

        let transport = MockTransport::new()
            .on(
                CommandCode::EnterBootloader,
                vec![MockReply::Success(identity_payload(0x04A6_1193, 17))],
            )
            .on(
                CommandCode::GetFlashSize,
                vec![MockReply::Success(vec![0, 0, 255, 0])],
            )
            .on(CommandCode::ProgramRow, vec![MockReply::Status(0x00)])
            .on(
                CommandCode::VerifyRow,
                vec![MockReply::Success(vec![row_checksum])],
            )
            .on(
                CommandCode::VerifyChecksum,
                vec![MockReply::Success(vec![0x01])],
            )
            .on(CommandCode::ExitBootloader, vec![MockReply::Timeout]);

        let client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);
        let mut session = Session::new(client, Options::default());
        let mut events = Vec::new();
        let result = session.flash(&image, &mut AlwaysDecline, &(), |e| events.push(e));

        assert!(result.is_ok(), "{:?}", result.err());
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::EnteredBootloader { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Verified { ok: true })));
        assert!(matches!(events.last(), Some(ProgressEvent::Rebooting)));
    }

    #[test]
    fn wrong_silicon_aborts_before_programming() {
        let image = single_row_image();
        let transport = MockTransport::new().on(
            CommandCode::EnterBootloader,
            vec![MockReply::Success(identity_payload(0x04C8_1193, 17))],
        );

        let client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);
        let mut session = Session::new(client, Options::default());
        let err = session
            .flash(&image, &mut AlwaysDecline, &(), |_| {})
            .unwrap_err();

        assert!(matches!(err, CyflashError::InvalidSilicon { .. }));
    }

    #[test]
    fn transient_row_error_is_retried_and_recovers() {
        let image = single_row_image();
        let row_checksum = image.rows[0].local_checksum();

        let transport = MockTransport::new()
            .on(
                CommandCode::EnterBootloader,
                vec![MockReply::Success(identity_payload(0x04A6_1193, 17))],
            )
            .on(
                CommandCode::GetFlashSize,
                vec![MockReply::Success(vec![0, 0, 255, 0])],
            )
            .on(
                CommandCode::ProgramRow,
                vec![MockReply::Status(0x08), MockReply::Status(0x00)],
            )
            .on(
                CommandCode::VerifyRow,
                vec![MockReply::Success(vec![row_checksum])],
            )
            .on(
                CommandCode::VerifyChecksum,
                vec![MockReply::Success(vec![0x01])],
            )
            .on(CommandCode::ExitBootloader, vec![MockReply::Timeout]);

        let client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);
        let mut session = Session::new(client, Options::default());
        let result = session.flash(&image, &mut AlwaysDecline, &(), |_| {});

        assert!(result.is_ok(), "{:?}", result.err());
        assert_eq!(session.packet_errors(), 1);
    }

    #[test]
    fn final_checksum_zero_is_an_error() {
        let image = single_row_image();
        let row_checksum = image.rows[0].local_checksum();

        let transport = MockTransport::new()
            .on(
                CommandCode::EnterBootloader,
                vec![MockReply::Success(identity_payload(0x04A6_1193, 17))],
            )
            .on(
                CommandCode::GetFlashSize,
                vec![MockReply::Success(vec![0, 0, 255, 0])],
            )
            .on(CommandCode::ProgramRow, vec![MockReply::Status(0x00)])
            .on(
                CommandCode::VerifyRow,
                vec![MockReply::Success(vec![row_checksum])],
            )
            .on(
                CommandCode::VerifyChecksum,
                vec![MockReply::Success(vec![0x00])],
            );

        let client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);
        let mut session = Session::new(client, Options::default());
        let err = session
            .flash(&image, &mut AlwaysDecline, &(), |_| {})
            .unwrap_err();

        assert!(matches!(
            err,
            CyflashError::Checksum {
                subkind: crate::error::ChecksumSubkind::Overall
            }
        ));
    }

    #[test]
    fn row_outside_flash_range_is_rejected() {
        let image = single_row_image();
        let transport = MockTransport::new()
            .on(
                CommandCode::EnterBootloader,
                vec![MockReply::Success(identity_payload(0x04A6_1193, 17))],
            )
            .on(
                CommandCode::GetFlashSize,
                vec![MockReply::Success(vec![100, 0, 200, 0])],
            );

        let client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);
        let mut session = Session::new(client, Options::default());
        let err = session
            .flash(&image, &mut AlwaysDecline, &(), |_| {})
            .unwrap_err();

        assert!(matches!(err, CyflashError::RowRange { array: 0, row: 22 }));
    }

    #[test]
    fn response_decode_smoke() {
        // sanity check the encode_response helper used throughout this module's scripted tests.
        let frame = encode_response(0x00, &[1, 2, 3]);
        let resp = ResponsePacket::decode(&frame, ChecksumKind::Sum2Complement).unwrap();
        assert_eq!(resp.payload, vec![1, 2, 3]);
    }
}
