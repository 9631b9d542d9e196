//! Host-side builders for SCSI commands.
//!
//! This module uses the term "command descriptor" to describe a struct and implementation specific
//! details behind a CDB, and uses the term "command block" to describe a "black box" containing
//! a valid CDB.
//!
//! Commands are exposed as a function that returns a [`CommandBlock`]. These functions wrap
//! the more granular [`X6CommandDescriptor`] and [`X10CommandDescriptor`] structs. The simulator
//! and the tests submit them through [`crate::usb::host::UsbDrive`].

use super::command_descriptor::*;
use crate::usb::cbw::CBWDirection;

/// A serialized command block ready to be submitted
#[derive(Copy, Clone, Debug)]
pub struct CommandBlock {
    pub command: CommandBuffer,
    pub direction: CBWDirection,
    pub data_transfer_len: u32,
}

impl CommandBlock {
    /// Returns the length of the underlying command block.
    ///
    /// Will always be 16 bytes or less.
    pub fn len(&self) -> usize {
        self.command.as_slice().len()
    }

    /// Returns a valid command block, prepared as described by USB Mass
    /// Storage Class - Bulk Only Transport section 5.1 (CBWCB).
    pub fn get(&self) -> [u8; MAX_CDB_SIZE] {
        *self.command.raw()
    }
}

fn x6(operation_code: OpCode, logical_block_address: [u8; 3], misc_len: u8) -> CommandBuffer {
    X6CommandDescriptor {
        operation_code,
        logical_block_address,
        misc_len,
        control: 0,
    }
    .to_command_buffer()
}

fn x10(operation_code: OpCode, service_action: u8, lba: u32, misc_len: u16) -> CommandBuffer {
    X10CommandDescriptor {
        operation_code,
        service_action,
        logical_block_address: lba.to_be_bytes(),
        group_number: 0,
        misc_len: misc_len.to_be_bytes(),
        control: 0,
    }
    .to_command_buffer()
}

/// "The TEST UNIT READY command provides a means to check if the logical unit is ready.
///
/// If the logical unit is able to accept an appropriate medium access command without
/// returning CHECK CONDITION status, this command shall return a GOOD status. If the logical
/// unit is unable to become operational or is in a state such that an applicaton client action
/// (e.g START UNIT command) is required to make the unit ready, the device server shall return
/// CHECK CONDITION status with a sense key of NOT READY."
///
/// Defined in SPC2 7.25
pub fn test_unit_ready() -> CommandBlock {
    CommandBlock {
        command: x6(OpCode::TestUnitReady, [0, 0, 0], 0),
        direction: CBWDirection::NonDirectional,
        data_transfer_len: 0,
    }
}

/// Fetches the sense data of the last failed command. Fixed format sense data is
/// 18 bytes long.
///
/// SPC-2 7.20
pub fn request_sense(allocation_length: u8) -> CommandBlock {
    CommandBlock {
        command: x6(OpCode::RequestSense, [0, 0, 0], allocation_length),
        direction: CBWDirection::DataIn,
        data_transfer_len: allocation_length.into(),
    }
}

/// "The INQUIRY command requests that information regarding parameters
/// of the target and a component logical unit be sent to the application client.
/// Options allow the client to request additional information."
///
/// Defined in SPC2 7.3.1 table 45
pub fn inquiry() -> CommandBlock {
    CommandBlock {
        // For inquiry, is ALLOCATION LENGTH,
        // "The standard INQUIRY data shall contain at least 36 bytes"
        // (table 46)
        command: x6(OpCode::Inquiry, [0, 0, 0], 36),
        direction: CBWDirection::DataIn,
        data_transfer_len: 36,
    }
}

/// Requests the current values of all mode pages.
///
/// SPC-2 7.8
pub fn mode_sense6(allocation_length: u8) -> CommandBlock {
    // page code 0x3f: return all pages
    CommandBlock {
        command: x6(OpCode::ModeSense6, [0, 0x3f, 0], allocation_length),
        direction: CBWDirection::DataIn,
        data_transfer_len: allocation_length.into(),
    }
}

/// SPC-2 7.9
pub fn mode_sense10(allocation_length: u16) -> CommandBlock {
    // byte 2 (the page code) overlaps the first byte of the generic LBA field
    let page = u32::from_be_bytes([0x3f, 0, 0, 0]);
    CommandBlock {
        command: x10(OpCode::ModeSense10, 0, page, allocation_length),
        direction: CBWDirection::DataIn,
        data_transfer_len: allocation_length.into(),
    }
}

/// SBC-2 5.1.18
pub fn start_stop_unit(start: bool, load_eject: bool) -> CommandBlock {
    let flags = u8::from(start) | (u8::from(load_eject) << 1);
    CommandBlock {
        command: x6(OpCode::StartStopUnit, [0, 0, 0], flags),
        direction: CBWDirection::NonDirectional,
        data_transfer_len: 0,
    }
}

/// "The PREVENT ALLOW MEDIUM REMOVAL" command (see table 77) requests that
/// the target enable or disable the removal of the medium in the logical unit.
/// The logical unit shall not allow medium removal if any initiator current
/// has medium removal prevented."
///
/// SPC-2 7.12
pub fn prevent_allow_medium_removal(prevent: bool) -> CommandBlock {
    CommandBlock {
        // See table 78, 0b11 prohibits all form of medium removal
        command: x6(
            OpCode::PreventAllowMediumRemoval,
            [0, 0, 0],
            if prevent { 0b0000_0011 } else { 0 },
        ),
        direction: CBWDirection::NonDirectional,
        data_transfer_len: 0,
    }
}

/// "The `READ CAPACITY` command provides a means for the application client
/// to request information regarding the capacity of the block device."
///
/// SBC-2 5.1.10
pub fn read_capacity() -> CommandBlock {
    CommandBlock {
        command: x10(OpCode::ReadCapacity, 0, 0, 0),
        direction: CBWDirection::DataIn,
        data_transfer_len: 8,
    }
}

/// Reads `blocks` blocks starting at `lba`.
///
/// SBC-2 5.1.6
pub fn read10(lba: u32, blocks: u16, block_size: u32) -> CommandBlock {
    CommandBlock {
        command: x10(OpCode::Read10, 0, lba, blocks),
        direction: CBWDirection::DataIn,
        data_transfer_len: u32::from(blocks) * block_size,
    }
}

/// Writes `blocks` blocks starting at `lba`; the data follows the CBW.
///
/// SBC-2 5.1.20
pub fn write10(lba: u32, blocks: u16, block_size: u32) -> CommandBlock {
    CommandBlock {
        command: x10(OpCode::Write10, 0, lba, blocks),
        direction: CBWDirection::DataOut,
        data_transfer_len: u32::from(blocks) * block_size,
    }
}

/// Verifies `blocks` blocks starting at `lba`. With `byte_check` the host sends the
/// data to compare against the medium.
///
/// SBC-2 5.1.19
pub fn verify10(lba: u32, blocks: u16, block_size: u32, byte_check: bool) -> CommandBlock {
    let flags = if byte_check { Verify10Parameters::BYTCHK } else { 0 };
    let (direction, data_transfer_len) = if byte_check {
        (CBWDirection::DataOut, u32::from(blocks) * block_size)
    } else {
        (CBWDirection::NonDirectional, 0)
    };
    CommandBlock {
        command: x10(OpCode::Verify10, flags, lba, blocks),
        direction,
        data_transfer_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_command_block() {
        // Ensures that a single byte is packed successfully
        let cb = CommandBlock {
            command: CommandBuffer::from_command(&[1]).unwrap(),
            direction: CBWDirection::NonDirectional,
            data_transfer_len: 0,
        };
        assert_eq!(cb.len(), 1);
        let mut serialized_cb = cb.get().into_iter();
        assert!(serialized_cb.next() == Some(1));
        assert!(serialized_cb.all(|b| b == 0));
    }

    #[test]
    fn inquiry_matches_reference_bytes() {
        let cb = inquiry();
        assert_eq!(cb.command.as_slice(), &[0x12, 0, 0, 0, 36, 0]);
        assert!(cb.command.parseable());
    }

    #[test]
    fn builders_produce_parseable_commands() {
        for cb in [
            test_unit_ready(),
            request_sense(18),
            inquiry(),
            mode_sense6(192),
            mode_sense10(8),
            start_stop_unit(true, false),
            prevent_allow_medium_removal(true),
            read_capacity(),
            read10(0, 1, 512),
            write10(0, 1, 512),
            verify10(0, 1, 512, true),
        ] {
            assert!(cb.command.parseable(), "{cb:?}");
            assert!(
                !matches!(cb.command.decode(), Ok(ScsiCommand::Unsupported(_)) | Err(_)),
                "{cb:?}"
            );
        }
    }

    #[test]
    fn mode_sense10_asks_for_all_pages() {
        let cb = mode_sense10(8);
        let ScsiCommand::ModeSense10(params) = cb.command.decode().unwrap() else {
            panic!("expected mode sense (10)");
        };
        assert_eq!(params.page, 0x3f);
        assert_eq!(params.allocation_length(), 8);
    }
}
