//! Thin bootloader command client: one method per command, each encoding a request, sending it,
//! waiting for a response, and decoding the result into a typed value or error.
//!
//! Shaped after the teacher's `Commander` trait — generic over a capability rather than a
//! concrete transport — but as an inherent impl on `BootloaderClient<T>` since every command here
//! shares the same request/response framing instead of per-command ad hoc wire formats.

use std::time::{Duration, Instant};

use crate::checksum::ChecksumKind;
use crate::error::{BootloaderStatus, ChecksumSubkind, CyflashError, Result};
use crate::protocol::{
    AppMetadata, BootloaderIdentity, CommandPacket, FlashArrayInfo, ResponsePacket,
};
use crate::transport::Transport;

/// How long to wait for a single command's response before treating it as a timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap on a response frame's size; generous enough for the largest `GetMetadata`/`ProgramRow`
/// acknowledgements without letting a corrupt length field force an unbounded read.
const MAX_RESPONSE_BYTES: usize = 1024;

/// How often `EnterBootloader` is reissued during the repetitive-init procedure.
const REPETITIVE_INIT_INTERVAL: Duration = Duration::from_millis(100);

pub struct BootloaderClient<T: Transport> {
    transport: T,
    checksum_kind: ChecksumKind,
    command_timeout: Duration,
}

impl<T: Transport> BootloaderClient<T> {
    pub fn new(transport: T, checksum_kind: ChecksumKind) -> Self {
        BootloaderClient {
            transport,
            checksum_kind,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn checksum_kind(&self) -> ChecksumKind {
        self.checksum_kind
    }

    fn exchange(&mut self, request: &CommandPacket) -> Result<ResponsePacket> {
        let frame = request.encode(self.checksum_kind);
        self.transport.send(&frame)?;
        let response_frame = self
            .transport
            .receive(MAX_RESPONSE_BYTES, self.command_timeout)?;
        ResponsePacket::decode(&response_frame, self.checksum_kind)
    }

    /// Sends a request and turns a non-success status byte into `CyflashError::Bootloader`.
    fn exchange_checked(&mut self, request: &CommandPacket) -> Result<ResponsePacket> {
        let response = self.exchange(request)?;
        let status = BootloaderStatus::from(response.status);
        if !status.is_success() {
            return Err(CyflashError::Bootloader(status));
        }
        Ok(response)
    }

    /// Reissues `EnterBootloader` every 100 ms until a well-formed response arrives or `budget`
    /// elapses. `budget` of `None` means try exactly once.
    pub fn enter_bootloader(&mut self, budget: Option<Duration>) -> Result<BootloaderIdentity> {
        let request = CommandPacket::enter_bootloader();
        let deadline = budget.map(|b| Instant::now() + b);

        loop {
            match self.exchange_checked(&request) {
                Ok(response) => return BootloaderIdentity::decode(&response.payload),
                Err(
                    err @ (CyflashError::Timeout
                    | CyflashError::Framing(_)
                    | CyflashError::Checksum { .. }),
                ) => {
                    let Some(deadline) = deadline else {
                        return Err(err);
                    };
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                    std::thread::sleep(REPETITIVE_INIT_INTERVAL);
                }
                Err(other) => return Err(other),
            }
        }
    }

    pub fn exit_bootloader(&mut self) -> Result<()> {
        // The device typically jumps to the application immediately and never answers; a
        // transport timeout here is the expected, successful outcome.
        match self.exchange(&CommandPacket::exit_bootloader()) {
            Ok(_) | Err(CyflashError::Timeout) => Ok(()),
            Err(other) => Err(other),
        }
    }

    pub fn sync_bootloader(&mut self) -> Result<()> {
        self.exchange_checked(&CommandPacket::sync_bootloader())?;
        Ok(())
    }

    pub fn get_flash_size(&mut self, array_id: u8) -> Result<FlashArrayInfo> {
        let response = self.exchange_checked(&CommandPacket::get_flash_size(array_id))?;
        FlashArrayInfo::decode(array_id, &response.payload)
    }

    pub fn get_metadata(&mut self, app_index: u8) -> Result<AppMetadata> {
        let response = self.exchange_checked(&CommandPacket::get_metadata(app_index))?;
        AppMetadata::decode(&response.payload)
    }

    pub fn erase_row(&mut self, array_id: u8, row_number: u16) -> Result<()> {
        self.exchange_checked(&CommandPacket::erase_row(array_id, row_number))?;
        Ok(())
    }

    /// Returns the device's locally-computed row checksum for comparison against
    /// `Row::local_checksum`.
    pub fn verify_row(&mut self, array_id: u8, row_number: u16) -> Result<u8> {
        let response = self.exchange_checked(&CommandPacket::verify_row(array_id, row_number))?;
        response.payload.first().copied().ok_or_else(|| {
            CyflashError::Framing("VerifyRow response carried no checksum byte".into())
        })
    }

    /// Queues one chunk of a row's data ahead of a `ProgramRow`; used when a row is larger than
    /// fits in a single frame.
    pub fn send_data(&mut self, chunk: &[u8]) -> Result<()> {
        self.exchange_checked(&CommandPacket::send_data(chunk))?;
        Ok(())
    }

    pub fn program_row(&mut self, array_id: u8, row_number: u16, data: &[u8]) -> Result<()> {
        self.exchange_checked(&CommandPacket::program_row(array_id, row_number, data))?;
        Ok(())
    }

    /// Returns `true` if the device reports the overall flashed image checksum as valid.
    pub fn verify_checksum(&mut self) -> Result<bool> {
        let response = self.exchange_checked(&CommandPacket::verify_checksum())?;
        match response.payload.first() {
            Some(1) => Ok(true),
            Some(_) => Ok(false),
            None => Err(CyflashError::Framing(
                "VerifyChecksum response carried no result byte".into(),
            )),
        }
    }

    /// Convenience wrapper: `verify_checksum` as a hard error rather than a bool, for call sites
    /// that want `ChecksumSubkind::Overall` surfaced directly.
    pub fn verify_checksum_or_err(&mut self) -> Result<()> {
        if self.verify_checksum()? {
            Ok(())
        } else {
            Err(CyflashError::Checksum {
                subkind: ChecksumSubkind::Overall,
            })
        }
    }

    pub fn close(&mut self) -> Result<()> {
        self.transport.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport: replays canned response frames, records sent request frames, and can
    /// simulate timeouts by queueing `None`.
    struct ScriptedTransport {
        sent: Vec<Vec<u8>>,
        responses: VecDeque<Option<Vec<u8>>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Option<Vec<u8>>>) -> Self {
            ScriptedTransport {
                sent: Vec::new(),
                responses: responses.into(),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, packet: &[u8]) -> Result<()> {
            self.sent.push(packet.to_vec());
            Ok(())
        }

        fn receive(&mut self, _max_bytes: usize, _timeout: Duration) -> Result<Vec<u8>> {
            match self.responses.pop_front() {
                Some(Some(frame)) => Ok(frame),
                Some(None) | None => Err(CyflashError::Timeout),
            }
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn success_frame(payload: &[u8]) -> Vec<u8> {
        let mut body = vec![crate::protocol::SOP, 0x00];
        body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        body.extend_from_slice(payload);
        let cksum = ChecksumKind::Sum2Complement.compute(&body);
        body.extend_from_slice(&cksum.to_le_bytes());
        body.push(crate::protocol::EOP);
        body
    }

    fn error_frame(status: u8) -> Vec<u8> {
        let mut body = vec![crate::protocol::SOP, status, 0x00, 0x00];
        let cksum = ChecksumKind::Sum2Complement.compute(&body);
        body.extend_from_slice(&cksum.to_le_bytes());
        body.push(crate::protocol::EOP);
        body
    }

    #[test]
    fn enter_bootloader_decodes_identity_on_first_try() {
        let payload = vec![0x93, 0x11, 0xA6, 0x04, 17, 0x01, 0x02, 0x03];
        let transport = ScriptedTransport::new(vec![Some(success_frame(&payload))]);
        let mut client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);

        let identity = client.enter_bootloader(None).unwrap();
        assert_eq!(identity.silicon_id, 0x04A61193);
        assert_eq!(identity.silicon_rev, 17);
    }

    #[test]
    fn enter_bootloader_retries_on_framing_error() {
        let payload = vec![0x93, 0x11, 0xA6, 0x04, 17, 0x01, 0x02, 0x03];
        // A garbled frame (no SOP) followed by a well-formed response: the repetitive-init loop
        // must not give up after the first garbled reply, the same way it doesn't for a timeout.
        let transport = ScriptedTransport::new(vec![
            Some(vec![0xFF, 0xFF, 0xFF]),
            Some(success_frame(&payload)),
        ]);
        let mut client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);

        let identity = client
            .enter_bootloader(Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(identity.silicon_id, 0x04A61193);
    }

    #[test]
    fn enter_bootloader_without_budget_does_not_retry() {
        let transport = ScriptedTransport::new(vec![None]);
        let mut client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);
        let err = client.enter_bootloader(None).unwrap_err();
        assert!(matches!(err, CyflashError::Timeout));
    }

    #[test]
    fn get_flash_size_decodes_response() {
        let payload = vec![22, 0, 219, 0];
        let transport = ScriptedTransport::new(vec![Some(success_frame(&payload))]);
        let mut client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);

        let info = client.get_flash_size(0).unwrap();
        assert_eq!(info.first_row, 22);
        assert_eq!(info.last_row, 219);
    }

    #[test]
    fn bootloader_status_error_surfaces_as_typed_error() {
        let transport = ScriptedTransport::new(vec![Some(error_frame(0x0A))]);
        let mut client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);

        let err = client.erase_row(0, 9999).unwrap_err();
        match err {
            CyflashError::Bootloader(status) => assert_eq!(status.code(), 0x0A),
            other => panic!("expected Bootloader error, got {other:?}"),
        }
    }

    #[test]
    fn verify_row_returns_checksum_byte() {
        let transport = ScriptedTransport::new(vec![Some(success_frame(&[0x42]))]);
        let mut client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);
        assert_eq!(client.verify_row(0, 22).unwrap(), 0x42);
    }

    #[test]
    fn verify_checksum_false_on_zero_byte() {
        let transport = ScriptedTransport::new(vec![Some(success_frame(&[0x00]))]);
        let mut client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);
        assert!(!client.verify_checksum().unwrap());

        let transport = ScriptedTransport::new(vec![Some(success_frame(&[0x00]))]);
        let mut client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);
        let err = client.verify_checksum_or_err().unwrap_err();
        assert!(matches!(
            err,
            CyflashError::Checksum {
                subkind: ChecksumSubkind::Overall
            }
        ));
    }

    #[test]
    fn exit_bootloader_treats_timeout_as_success() {
        let transport = ScriptedTransport::new(vec![None]);
        let mut client = BootloaderClient::new(transport, ChecksumKind::Sum2Complement);
        client.exit_bootloader().unwrap();
    }
}
