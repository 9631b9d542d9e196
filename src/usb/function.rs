//! The Bulk-Only transport state machine.
//!
//! [`MassStorageFunction`] is fed whatever arrives on the bulk-OUT endpoint and
//! answers with what has to go out on the bulk-IN endpoint. It never touches an
//! endpoint itself; [`super::gadget`] does that.
//!
//! ```text
//! Idle --CBW--> CommandReceived --(Data-Out)--> ReceivingData --> Status --> Idle
//!                      |                                            ^
//!                      +-------------(no data / Data-In)------------+
//! ```
//!
//! A CBW that cannot be trusted (bad size, bad signature, unknown LUN) moves the
//! function to `Stalled`, which only a Bulk-Only Mass Storage Reset leaves.

use color_eyre::eyre::ensure;
use tracing::{debug, error, info, trace, warn};

use super::ProtocolError;
use super::cbw::{CBWDirection, CSW_SIZE, CommandBlockWrapper, CommandStatus, CommandStatusWrapper};
use super::control::{ClassRequest, SetupPacket};
use crate::lun::LogicalUnit;
use crate::scsi::command_descriptor::OpCode;
use crate::scsi::sense::MassStorageError;

/// "The maximum value for bCBWLUN is 15 (Fh)"
const MAX_LOGICAL_UNITS: usize = 16;

/// Upper bound on what is reserved up front for a Data-Out phase. The host
/// declares the length, so it is not trusted for allocation.
const MAX_PREALLOCATION: usize = 1024 * 1024;

/// Everything that goes out on the bulk-IN endpoint in answer to one CBW.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// Data-In payload, empty if there is none.
    pub data: Vec<u8>,
    /// The Data-In phase ended before the length the host declared.
    pub short: bool,
    pub csw: CommandStatusWrapper,
}

impl Reply {
    pub fn csw_bytes(&self) -> [u8; CSW_SIZE] {
        self.csw.to_bytes()
    }
}

enum State {
    Idle,
    ReceivingData {
        cbw: CommandBlockWrapper,
        received: Vec<u8>,
    },
    Stalled,
}

struct Slot {
    unit: Box<dyn LogicalUnit>,
    /// Whether the last TEST UNIT READY on this unit succeeded.
    ready: bool,
}

/// Implements the USB Mass Storage (Bulk-Only) protocol over a set of logical units.
pub struct MassStorageFunction {
    logical_units: Vec<Slot>,
    state: State,
}

impl MassStorageFunction {
    /// Creates a function serving `logical_units`, addressed by their position.
    pub fn new(logical_units: Vec<Box<dyn LogicalUnit>>) -> color_eyre::Result<Self> {
        ensure!(!logical_units.is_empty(), "cannot have 0 logical units");
        ensure!(
            logical_units.len() <= MAX_LOGICAL_UNITS,
            "at most {MAX_LOGICAL_UNITS} logical units are addressable, got {}",
            logical_units.len()
        );
        Ok(Self {
            logical_units: logical_units
                .into_iter()
                .map(|unit| Slot { unit, ready: true })
                .collect(),
            state: State::Idle,
        })
    }

    /// The highest LUN, as answered to Get Max LUN.
    pub fn max_lun(&self) -> u8 {
        (self.logical_units.len() - 1) as u8
    }

    pub fn logical_unit(&self, lun: u8) -> Option<&dyn LogicalUnit> {
        self.logical_units
            .get(usize::from(lun))
            .map(|slot| slot.unit.as_ref())
    }

    /// Whether no command is in flight.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    pub fn is_stalled(&self) -> bool {
        matches!(self.state, State::Stalled)
    }

    /// Bulk-Only Mass Storage Reset: forgets the command in flight and resets every
    /// logical unit. Sense data survives so the host can still ask why.
    pub fn reset(&mut self) {
        if !self.is_idle() {
            info!("reset aborts the command in flight");
        }
        for slot in &mut self.logical_units {
            slot.unit.on_reset();
        }
        self.state = State::Idle;
    }

    /// Answers a setup packet received on the control endpoint.
    ///
    /// Returns the data stage for device-to-host requests (empty otherwise). An
    /// error means the request is not ours and endpoint 0 should be stalled.
    pub fn handle_setup(&mut self, setup: &SetupPacket) -> Result<Vec<u8>, ProtocolError> {
        match setup.class_request() {
            Some(ClassRequest::BulkOnlyReset) => {
                info!("bulk-only mass storage reset");
                self.reset();
                Ok(Vec::new())
            }
            Some(ClassRequest::GetMaxLun) => {
                let max_lun = self.max_lun();
                info!(max_lun, "get max lun");
                Ok(vec![max_lun])
            }
            None => Err(ProtocolError::UnsupportedControlRequest {
                request_type: setup.request_type,
                request: setup.request,
            }),
        }
    }

    /// Feeds bytes received on the bulk-OUT endpoint.
    ///
    /// Returns `Ok(None)` while more Data-Out is expected, and the reply once the
    /// command has run. An error means the endpoints must be halted.
    pub fn on_bulk_out(&mut self, data: &[u8]) -> Result<Option<Reply>, ProtocolError> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Stalled => {
                self.state = State::Stalled;
                Err(ProtocolError::Stalled)
            }
            State::Idle => self.on_command_block(data),
            State::ReceivingData { cbw, mut received } => {
                received.extend_from_slice(data);
                let expected = cbw.data_transfer_length as usize;
                trace!(received = received.len(), expected, "accumulating data-out");
                if received.len() < expected {
                    self.state = State::ReceivingData { cbw, received };
                    return Ok(None);
                }
                if received.len() > expected {
                    warn!(
                        tag = cbw.tag,
                        received = received.len(),
                        expected,
                        "host sent more data than declared"
                    );
                    return Ok(Some(self.fail(&cbw, MassStorageError::Phase, Vec::new())));
                }
                Ok(Some(self.process(&cbw, Some(&received))))
            }
        }
    }

    fn on_command_block(&mut self, data: &[u8]) -> Result<Option<Reply>, ProtocolError> {
        let cbw = CommandBlockWrapper::from_bytes(data).inspect_err(|err| {
            error!(%err, "invalid command block wrapper");
            self.state = State::Stalled;
        })?;
        let lun = cbw.lun();
        if usize::from(lun) >= self.logical_units.len() {
            let err = ProtocolError::LunOutOfRange {
                lun,
                max_lun: self.max_lun(),
            };
            error!(%err, tag = cbw.tag);
            self.state = State::Stalled;
            return Err(err);
        }
        debug!(
            tag = cbw.tag,
            lun,
            opcode = cbw.command.opcode(),
            length = cbw.data_transfer_length,
            direction = ?cbw.direction(),
            "received command"
        );

        if cbw.direction() == CBWDirection::DataOut {
            let expected = cbw.data_transfer_length as usize;
            self.state = State::ReceivingData {
                cbw,
                received: Vec::with_capacity(expected.min(MAX_PREALLOCATION)),
            };
            return Ok(None);
        }
        Ok(Some(self.process(&cbw, None)))
    }

    /// Runs the command on its logical unit and builds the reply.
    fn process(&mut self, cbw: &CommandBlockWrapper, data: Option<&[u8]>) -> Reply {
        let expected = cbw.data_transfer_length as usize;
        let direction = cbw.direction();
        let slot = &mut self.logical_units[usize::from(cbw.lun())];

        let outcome = match slot.unit.on_command(cbw, data) {
            Ok(response) => {
                let response = response.as_deref().unwrap_or_default();
                match direction {
                    CBWDirection::DataIn => {
                        // never send more than the host asked for
                        let sent = response.len().min(expected);
                        let payload = response[..sent].to_vec();
                        if response.len() == expected {
                            Ok(payload)
                        } else {
                            Err((MassStorageError::Phase, payload))
                        }
                    }
                    CBWDirection::DataOut | CBWDirection::NonDirectional => {
                        if response.is_empty() {
                            Ok(Vec::new())
                        } else {
                            Err((MassStorageError::Phase, Vec::new()))
                        }
                    }
                }
            }
            Err(err) => Err((err, Vec::new())),
        };

        match outcome {
            Ok(payload) => {
                match OpCode::try_from(cbw.command.opcode()) {
                    Ok(OpCode::TestUnitReady) => {
                        if !slot.ready {
                            debug!(lun = cbw.lun(), "unit became ready");
                            slot.unit.on_reset();
                            slot.ready = true;
                        }
                    }
                    Ok(OpCode::RequestSense) => {}
                    _ => slot.unit.set_sense(None),
                }
                Reply {
                    data: payload,
                    short: false,
                    csw: CommandStatusWrapper::simple(cbw.tag, CommandStatus::Passed, 0),
                }
            }
            Err((err, payload)) => self.fail(cbw, err, payload),
        }
    }

    /// Records the failure on the logical unit and builds the reply for it.
    fn fail(
        &mut self,
        cbw: &CommandBlockWrapper,
        err: MassStorageError,
        payload: Vec<u8>,
    ) -> Reply {
        let slot = &mut self.logical_units[usize::from(cbw.lun())];
        let status = err.csw_status();
        let sense = err.sense();
        warn!(
            tag = cbw.tag,
            lun = cbw.lun(),
            opcode = cbw.command.opcode(),
            ?status,
            sense_key = sense.map(|sense| sense.sense_key()),
            asc_ascq = %sense.map(|sense| sense.asc_ascq()).unwrap_or_default(),
            "command failed: {err}"
        );
        slot.unit.set_sense(sense);
        if cbw.command.opcode() == OpCode::TestUnitReady as u8 {
            slot.ready = false;
        }

        // Data-Out is always consumed in full, but only counts as processed on success
        let expected = cbw.data_transfer_length;
        let residue = match cbw.direction() {
            CBWDirection::DataIn => expected - payload.len() as u32,
            CBWDirection::DataOut | CBWDirection::NonDirectional => expected,
        };
        Reply {
            short: cbw.direction() == CBWDirection::DataIn && residue > 0,
            data: payload,
            csw: CommandStatusWrapper::simple(cbw.tag, status, residue),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::lun::RamDisk;
    use crate::lun::tests::RecordingUnit;
    use crate::scsi::command::{self, CommandBlock};
    use crate::scsi::command_descriptor::CommandBuffer;
    use crate::scsi::response::RequestSenseResponse;
    use crate::scsi::sense::{AscAscq, CommandResult, SenseKey};

    fn function(units: Vec<Box<dyn LogicalUnit>>) -> MassStorageFunction {
        MassStorageFunction::new(units).unwrap()
    }

    fn recording() -> MassStorageFunction {
        function(vec![Box::new(RecordingUnit::default())])
    }

    fn cbw(command: &CommandBlock, lun: u8, tag: u32) -> [u8; 31] {
        CommandBlockWrapper::new(command, lun, tag).to_bytes()
    }

    fn submit(function: &mut MassStorageFunction, command: &CommandBlock, tag: u32) -> Reply {
        function
            .on_bulk_out(&cbw(command, 0, tag))
            .unwrap()
            .expect("command without data-out replies at once")
    }

    fn sense_key(function: &MassStorageFunction, lun: u8) -> Option<u8> {
        function
            .logical_unit(lun)
            .unwrap()
            .sense()
            .map(|sense| sense.sense_key())
    }

    #[test]
    fn inquiry_end_to_end() {
        let mut function = recording();
        let reply = submit(&mut function, &command::inquiry(), 1);
        assert_eq!(reply.data.len(), 36);
        assert_eq!(
            reply.csw,
            CommandStatusWrapper::simple(1, CommandStatus::Passed, 0)
        );
        assert!(function.is_idle());
    }

    #[test]
    fn short_read_is_a_phase_error() {
        let mut function = recording();
        // the host declares two blocks, the CDB asks for one
        let mut read = command::read10(0, 1, 512);
        read.data_transfer_len = 1024;
        let reply = submit(&mut function, &read, 9);
        assert_eq!(reply.data.len(), 512);
        assert!(reply.short);
        assert_eq!(reply.csw.status, CommandStatus::PhaseError);
        assert_eq!(reply.csw.data_residue, 512);
        assert_eq!(reply.csw.tag, 9);
        assert_eq!(sense_key(&function, 0), Some(SenseKey::IllegalRequest as u8));
    }

    #[test]
    fn excess_data_in_is_truncated_and_a_phase_error() {
        let mut function = recording();
        let mut read = command::read10(0, 2, 512);
        read.data_transfer_len = 512;
        let reply = submit(&mut function, &read, 3);
        assert_eq!(reply.data.len(), 512);
        assert!(!reply.short);
        assert_eq!(reply.csw.status, CommandStatus::PhaseError);
        assert_eq!(reply.csw.data_residue, 0);
    }

    #[test]
    fn unsupported_opcode_fails_with_illegal_request() {
        let mut function = recording();
        let unsupported = CommandBlock {
            command: CommandBuffer::from_command(&[0xff, 0, 0, 0, 0, 0]).unwrap(),
            direction: CBWDirection::NonDirectional,
            data_transfer_len: 0,
        };
        let reply = submit(&mut function, &unsupported, 4);
        assert_eq!(reply.csw.status, CommandStatus::Failed);
        assert_eq!(reply.csw.data_residue, 0);
        assert_eq!(sense_key(&function, 0), Some(SenseKey::IllegalRequest as u8));
    }

    #[test]
    fn unparseable_command_still_consumes_data_out() {
        let mut function = recording();
        let mut write = command::write10(0, 1, 512);
        // declare a 6 byte CDB for a 10 byte command
        write.command = CommandBuffer::new(*write.command.raw(), 6);
        assert_eq!(function.on_bulk_out(&cbw(&write, 0, 5)), Ok(None));
        assert!(!function.is_idle());
        let reply = function.on_bulk_out(&[0; 512]).unwrap().unwrap();
        assert_eq!(reply.csw.status, CommandStatus::Failed);
        assert_eq!(reply.csw.data_residue, 512);
        assert!(function.is_idle());
    }

    #[test]
    fn unsupported_opcode_with_data_out_fails_after_consuming_it() {
        let mut function = recording();
        let mode_select = CommandBlock {
            command: CommandBuffer::from_command(&[0x15, 0x10, 0, 0, 12, 0]).unwrap(),
            direction: CBWDirection::DataOut,
            data_transfer_len: 12,
        };
        assert_eq!(function.on_bulk_out(&cbw(&mode_select, 0, 10)), Ok(None));
        let reply = function.on_bulk_out(&[0; 12]).unwrap().unwrap();
        assert_eq!(
            reply.csw,
            CommandStatusWrapper::simple(10, CommandStatus::Failed, 12)
        );
        assert!(function.is_idle());

        let sense = function.logical_unit(0).unwrap().sense().unwrap();
        assert_eq!(sense.sense_key(), SenseKey::IllegalRequest as u8);
        assert_eq!(sense.asc_ascq(), AscAscq::INVALID_COMMAND_OPERATION_CODE);
    }

    #[test]
    fn data_out_accumulates_across_packets() {
        let mut function = function(vec![Box::new(RamDisk::new(512, 4).unwrap())]);
        let write = command::write10(1, 2, 512);
        assert_eq!(function.on_bulk_out(&cbw(&write, 0, 11)), Ok(None));
        for _ in 0..15 {
            assert_eq!(function.on_bulk_out(&[0x42; 64]), Ok(None));
        }
        let reply = function.on_bulk_out(&[0x42; 64]).unwrap().unwrap();
        assert_eq!(
            reply.csw,
            CommandStatusWrapper::simple(11, CommandStatus::Passed, 0)
        );

        let reply = submit(&mut function, &command::read10(1, 2, 512), 12);
        assert!(reply.data.iter().all(|&b| b == 0x42));
        let reply = submit(&mut function, &command::read10(0, 1, 512), 13);
        assert!(reply.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn excess_data_out_is_a_phase_error() {
        let mut function = recording();
        let write = command::write10(0, 1, 512);
        function.on_bulk_out(&cbw(&write, 0, 6)).unwrap();
        let reply = function.on_bulk_out(&[0; 600]).unwrap().unwrap();
        assert_eq!(reply.csw.status, CommandStatus::PhaseError);
        assert_eq!(reply.csw.data_residue, 512);
        assert!(function.is_idle());
    }

    #[test]
    fn every_command_yields_one_csw_with_its_tag() {
        let commands = [
            command::test_unit_ready(),
            command::inquiry(),
            command::read_capacity(),
            command::read10(0, 1, 512),
            command::start_stop_unit(true, false),
            command::prevent_allow_medium_removal(false),
            command::verify10(0, 1, 512, false),
        ];
        let mut function = recording();
        for (tag, command) in commands.iter().enumerate() {
            let reply = submit(&mut function, command, tag as u32);
            assert_eq!(reply.csw.tag, tag as u32);
            assert_eq!(reply.csw.status, CommandStatus::Passed, "{command:?}");
        }
        // the one call that is not data-out free
        let write = command::write10(0, 1, 512);
        assert_eq!(function.on_bulk_out(&cbw(&write, 0, 99)), Ok(None));
        let reply = function.on_bulk_out(&[1; 512]).unwrap().unwrap();
        assert_eq!(reply.csw.tag, 99);
        assert_eq!(reply.csw.status, CommandStatus::Passed);
    }

    #[test]
    fn test_unit_ready_is_idempotent() {
        let mut function = recording();
        for tag in 0..2 {
            let reply = submit(&mut function, &command::test_unit_ready(), tag);
            assert_eq!(reply.csw.status, CommandStatus::Passed);
            assert_eq!(sense_key(&function, 0), None);
        }
    }

    #[test]
    fn test_unit_ready_and_request_sense_keep_sense() {
        let mut function = recording();
        let mut read = command::read10(100, 1, 512);
        read.data_transfer_len = 512;
        let reply = submit(&mut function, &read, 1);
        assert_eq!(reply.csw.status, CommandStatus::Failed);
        assert_eq!(reply.csw.data_residue, 512);
        assert!(reply.short);

        submit(&mut function, &command::test_unit_ready(), 2);
        let reply = submit(&mut function, &command::request_sense(18), 3);
        assert_eq!(reply.csw.status, CommandStatus::Passed);
        assert_eq!(reply.data[2], SenseKey::IllegalRequest as u8);
        assert_eq!(&reply.data[12..14], &[0x21, 0x00]);
        assert_eq!(sense_key(&function, 0), Some(SenseKey::IllegalRequest as u8));

        // any other successful command clears it
        submit(&mut function, &command::inquiry(), 4);
        assert_eq!(sense_key(&function, 0), None);
    }

    /// Fails TEST UNIT READY until `attempts` reaches `ready_after`.
    struct Flaky {
        attempts: usize,
        ready_after: usize,
        resets: Arc<AtomicUsize>,
        sense: Option<RequestSenseResponse>,
    }

    impl LogicalUnit for Flaky {
        fn sense(&self) -> Option<RequestSenseResponse> {
            self.sense
        }

        fn set_sense(&mut self, sense: Option<RequestSenseResponse>) {
            self.sense = sense;
        }

        fn on_reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn on_test_unit_ready(&mut self) -> CommandResult<()> {
            self.attempts += 1;
            if self.attempts <= self.ready_after {
                return Err(MassStorageError::not_ready(AscAscq::LUN_BECOMING_READY));
            }
            Ok(())
        }

        fn on_read_capacity(&mut self) -> CommandResult<(u32, u32)> {
            Ok((0, 512))
        }

        fn on_read(&mut self, _lba: u32, _length: u16) -> CommandResult<Cow<'_, [u8]>> {
            Ok(Cow::Owned(vec![0; 512]))
        }

        fn on_write(&mut self, _lba: u32, _length: u16, _data: &[u8]) -> CommandResult<()> {
            Ok(())
        }
    }

    #[test]
    fn unit_becoming_ready_is_reset_once() {
        let resets = Arc::new(AtomicUsize::new(0));
        let mut function = function(vec![Box::new(Flaky {
            attempts: 0,
            ready_after: 2,
            resets: resets.clone(),
            sense: None,
        })]);

        for tag in 0..2 {
            let reply = submit(&mut function, &command::test_unit_ready(), tag);
            assert_eq!(reply.csw.status, CommandStatus::Failed);
        }
        let reply = submit(&mut function, &command::request_sense(18), 2);
        assert_eq!(reply.data[2], SenseKey::NotReady as u8);
        assert_eq!(&reply.data[12..14], &[0x04, 0x01]);
        assert_eq!(resets.load(Ordering::SeqCst), 0);

        for tag in 3..5 {
            let reply = submit(&mut function, &command::test_unit_ready(), tag);
            assert_eq!(reply.csw.status, CommandStatus::Passed);
        }
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bad_signature_stalls_until_reset() {
        let mut function = recording();
        let mut raw = cbw(&command::test_unit_ready(), 0, 1);
        raw[0] = 0;
        assert!(matches!(
            function.on_bulk_out(&raw),
            Err(ProtocolError::InvalidSignature(_))
        ));
        assert!(function.is_stalled());
        let good = cbw(&command::test_unit_ready(), 0, 2);
        assert_eq!(function.on_bulk_out(&good), Err(ProtocolError::Stalled));

        function
            .handle_setup(&SetupPacket::bulk_only_reset(0))
            .unwrap();
        assert!(function.is_idle());
        let reply = function.on_bulk_out(&good).unwrap().unwrap();
        assert_eq!(reply.csw.status, CommandStatus::Passed);
    }

    #[test]
    fn lun_out_of_range_is_fatal() {
        let mut function = recording();
        assert_eq!(
            function.on_bulk_out(&cbw(&command::test_unit_ready(), 1, 1)),
            Err(ProtocolError::LunOutOfRange { lun: 1, max_lun: 0 })
        );
        assert!(function.is_stalled());
    }

    #[test]
    fn get_max_lun_is_count_minus_one() {
        let mut function = function(vec![
            Box::new(RamDisk::new(512, 1).unwrap()),
            Box::new(RamDisk::new(512, 1).unwrap()),
            Box::new(RamDisk::new(512, 1).unwrap()),
        ]);
        assert_eq!(
            function.handle_setup(&SetupPacket::get_max_lun(0)),
            Ok(vec![2])
        );
    }

    #[test]
    fn sense_is_tracked_per_lun() {
        let mut function = function(vec![
            Box::new(RecordingUnit::default()),
            Box::new(RecordingUnit::default()),
        ]);
        let mut read = command::read10(100, 1, 512);
        read.data_transfer_len = 512;
        function.on_bulk_out(&cbw(&read, 1, 1)).unwrap();
        assert_eq!(sense_key(&function, 0), None);
        assert_eq!(sense_key(&function, 1), Some(SenseKey::IllegalRequest as u8));
    }

    #[test]
    fn reset_aborts_data_out_but_keeps_sense() {
        let mut function = recording();
        let mut read = command::read10(100, 1, 512);
        read.data_transfer_len = 512;
        submit(&mut function, &read, 1);

        function
            .on_bulk_out(&cbw(&command::write10(0, 1, 512), 0, 2))
            .unwrap();
        assert!(!function.is_idle());
        function.reset();
        assert!(function.is_idle());
        assert_eq!(sense_key(&function, 0), Some(SenseKey::IllegalRequest as u8));

        // the next bytes are read as a fresh CBW
        let reply = submit(&mut function, &command::test_unit_ready(), 3);
        assert_eq!(reply.csw.tag, 3);
    }

    #[test]
    fn unknown_control_request_is_refused() {
        let mut function = recording();
        let setup = SetupPacket::from_bytes([0x80, 0x06, 0, 1, 0, 0, 18, 0]);
        assert!(matches!(
            function.handle_setup(&setup),
            Err(ProtocolError::UnsupportedControlRequest { request: 0x06, .. })
        ));
    }

    #[test]
    fn construction_rejects_bad_lun_counts() {
        assert!(MassStorageFunction::new(Vec::new()).is_err());
        let units: Vec<Box<dyn LogicalUnit>> = (0..17)
            .map(|_| Box::new(RecordingUnit::default()) as Box<dyn LogicalUnit>)
            .collect();
        assert!(MassStorageFunction::new(units).is_err());
    }
}
