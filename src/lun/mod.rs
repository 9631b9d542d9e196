//! Logical units: the storage backends commands are dispatched to.
//!
//! A backend implements [`LogicalUnit`]. Every handler has a sensible default
//! except the ones only a real medium can answer (capacity, read and write).
//! [`dispatch`] decodes a command block and routes it to the right handler; it
//! is what [`LogicalUnit::on_command`] does unless a backend overrides it.

mod ram_disk;

pub use ram_disk::{DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_SIZE, RamDisk};

use std::borrow::Cow;

use tracing::trace;

use crate::scsi::ByteStruct;
use crate::scsi::command_descriptor::ScsiCommand;
use crate::scsi::response::{
    InquiryResponse, ModeSense6Header, ModeSense10Header, PERIPHERAL_QUALIFIER_LOADED,
    PERIPHERAL_TYPE_DIRECT, ReadCapacity10Response, RequestSenseResponse, fit_allocation,
};
use crate::scsi::sense::{AscAscq, CommandResult, MassStorageError, SenseKey};
use crate::usb::cbw::CommandBlockWrapper;

/// What a command hands back for the Data-In phase: nothing, bytes it built, or a
/// view into the unit's own storage.
pub type Response<'a> = Option<Cow<'a, [u8]>>;

/// A storage backend behind one LUN.
///
/// Each unit owns its sense slot. The transport writes it through
/// [`LogicalUnit::set_sense`] when a command fails and REQUEST SENSE reads it back.
pub trait LogicalUnit: Send {
    /// Sense data of the last failed command, if it has not been cleared since.
    fn sense(&self) -> Option<RequestSenseResponse>;

    fn set_sense(&mut self, sense: Option<RequestSenseResponse>);

    /// Clears transient state. Called on Bulk-Only Mass Storage Reset and when
    /// TEST UNIT READY sees the unit become ready again. Sense data is left alone.
    fn on_reset(&mut self) {}

    /// Entry point for every command addressed to this unit.
    ///
    /// `data` is the Data-Out payload, if the host sent one. Override this to
    /// handle commands [`dispatch`] does not know, and fall back to it otherwise.
    fn on_command(
        &mut self,
        cbw: &CommandBlockWrapper,
        data: Option<&[u8]>,
    ) -> CommandResult<Response<'_>> {
        dispatch(self, cbw, data)
    }

    /// Fails with a NOT READY condition if the unit cannot service I/O right now.
    fn on_test_unit_ready(&mut self) -> CommandResult<()> {
        Ok(())
    }

    /// Standard inquiry data for this unit.
    fn inquiry_data(&self) -> InquiryResponse {
        InquiryResponse::new(
            PERIPHERAL_QUALIFIER_LOADED | PERIPHERAL_TYPE_DIRECT,
            true,
            *b"GLASS   ",
            *b"USB MASS STORAGE",
            *b"0001",
        )
    }

    /// Inquiry data truncated or zero-padded to `request_size` bytes.
    fn on_inquiry(&mut self, request_size: usize) -> CommandResult<Vec<u8>> {
        Ok(fit_allocation(self.inquiry_data().as_slice(), request_size))
    }

    /// Size of a logical block in bytes. Must agree with [`LogicalUnit::on_read_capacity`].
    fn block_size(&self) -> u32 {
        512
    }

    /// Returns `(last_logical_block_address, block_size)`.
    fn on_read_capacity(&mut self) -> CommandResult<(u32, u32)>;

    /// Reads `length` blocks starting at `lba`.
    fn on_read(&mut self, lba: u32, length: u16) -> CommandResult<Cow<'_, [u8]>>;

    /// Writes `data`, which holds exactly `length` blocks, starting at `lba`.
    fn on_write(&mut self, lba: u32, length: u16, data: &[u8]) -> CommandResult<()>;

    /// Verifies `length` blocks starting at `lba`, comparing against `data` when
    /// the host asked for a byte check.
    fn on_verify(&mut self, lba: u32, length: u16, data: Option<&[u8]>) -> CommandResult<()> {
        let _ = (lba, length, data);
        Ok(())
    }

    fn on_start_stop(&mut self, start: bool, load_eject: bool) -> CommandResult<()> {
        let _ = (start, load_eject);
        Ok(())
    }

    fn on_prevent_medium_removal(&mut self, prevent: bool) -> CommandResult<()> {
        let _ = prevent;
        Ok(())
    }
}

/// Decodes the command in `cbw` and invokes the matching handler of `unit`.
///
/// Unsupported operation codes and malformed command blocks fail with an illegal
/// request. A command that does not consume Data-Out but received some, or that
/// needs Data-Out of a size the host did not send, fails with a phase error.
pub fn dispatch<'a, L: LogicalUnit + ?Sized>(
    unit: &'a mut L,
    cbw: &CommandBlockWrapper,
    data: Option<&[u8]>,
) -> CommandResult<Response<'a>> {
    let command = cbw.command.decode()?;
    trace!(?command, "dispatching");

    let takes_data = match command {
        ScsiCommand::Write10(_) => true,
        ScsiCommand::Verify10(params) => params.byte_check(),
        // unknown commands are rejected as such, whatever data came with them
        ScsiCommand::Unsupported(_) => true,
        _ => false,
    };
    if data.is_some() && !takes_data {
        return Err(MassStorageError::Phase);
    }

    match command {
        ScsiCommand::TestUnitReady => {
            unit.on_test_unit_ready()?;
            Ok(None)
        }
        ScsiCommand::RequestSense(params) => {
            let sense = unit
                .sense()
                .unwrap_or_else(|| RequestSenseResponse::simple(SenseKey::NoSense, AscAscq::NONE));
            Ok(Some(Cow::Owned(fit_allocation(
                sense.as_slice(),
                params.allocation_length(),
            ))))
        }
        ScsiCommand::Inquiry(params) => {
            // vital product data pages are not implemented
            if params.wants_vital_product_data() {
                return Err(MassStorageError::illegal_request(
                    AscAscq::INVALID_FIELD_IN_CDB,
                ));
            }
            Ok(Some(Cow::Owned(unit.on_inquiry(params.allocation_length())?)))
        }
        // No mode pages are implemented, so both MODE SENSE variants answer with a
        // bare header.
        ScsiCommand::ModeSense6(params) => Ok(Some(Cow::Owned(fit_allocation(
            ModeSense6Header::empty().as_slice(),
            params.allocation_length(),
        )))),
        ScsiCommand::ModeSense10(params) => Ok(Some(Cow::Owned(fit_allocation(
            ModeSense10Header::empty().as_slice(),
            params.allocation_length(),
        )))),
        ScsiCommand::StartStopUnit(params) => {
            unit.on_start_stop(params.start(), params.load_eject())?;
            Ok(None)
        }
        ScsiCommand::PreventAllowMediumRemoval(params) => {
            unit.on_prevent_medium_removal(params.prevent())?;
            Ok(None)
        }
        ScsiCommand::ReadCapacity10(params) => {
            if params.flags2 != 0 {
                return Err(MassStorageError::illegal_request(
                    AscAscq::INVALID_FIELD_IN_CDB,
                ));
            }
            let (last_lba, block_size) = unit.on_read_capacity()?;
            let response = ReadCapacity10Response::new(last_lba, block_size);
            Ok(Some(Cow::Owned(response.as_slice().to_vec())))
        }
        ScsiCommand::Read10(params) => {
            Ok(Some(unit.on_read(params.lba(), params.transfer_length())?))
        }
        ScsiCommand::Write10(params) => {
            let blocks = params.transfer_length();
            let data = expect_data(data, blocks, unit.block_size())?;
            unit.on_write(params.lba(), blocks, data)?;
            Ok(None)
        }
        ScsiCommand::Verify10(params) => {
            let blocks = params.verification_length();
            let data = if params.byte_check() {
                Some(expect_data(data, blocks, unit.block_size())?)
            } else {
                None
            };
            unit.on_verify(params.lba(), blocks, data)?;
            Ok(None)
        }
        ScsiCommand::Unsupported(_) => Err(MassStorageError::illegal_request(
            AscAscq::INVALID_COMMAND_OPERATION_CODE,
        )),
    }
}

/// Data-Out must hold exactly `blocks` blocks.
fn expect_data(data: Option<&[u8]>, blocks: u16, block_size: u32) -> CommandResult<&[u8]> {
    let expected = usize::from(blocks) * block_size as usize;
    match data {
        Some(data) if data.len() == expected => Ok(data),
        None if expected == 0 => Ok(&[]),
        _ => Err(MassStorageError::Phase),
    }
}
