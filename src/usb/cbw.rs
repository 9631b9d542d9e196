//! A USB packet containing a command block wrapper and associated
//! information, and the status wrapper that answers it.
//!
//! Both wrappers are little endian on the wire. They are decoded field by field
//! at fixed offsets rather than cast, so the layout never depends on the host.

use color_eyre::eyre::ensure;

use super::ProtocolError;
use crate::scsi::command::CommandBlock;
use crate::scsi::command_descriptor::{CommandBuffer, MAX_CDB_SIZE};

/// Signature that identifies a packet as a CBW.
///
/// This packet contains the below magic number (little endian).
///
/// See USB Mass Storage Class - Bulk Only Transport, section 5
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// Signature that identifies a packet as a CSW.
///
/// The packet will start with the below magic number (little endian).
pub const CSW_SIGNATURE: u32 = 0x53425355;

/// A command block wrapper is *always* 31 bytes in size
pub const CBW_SIZE: usize = 31;
/// A command status wrapper is *always* 13 bytes in size
pub const CSW_SIZE: usize = 13;

/// Bit 7 of `bmCBWFlags`; set for Data-In.
const CBW_DIRECTION_IN: u8 = 0x80;
/// Only the low nibble of `bCBWLUN` is significant.
const CBW_LUN_MASK: u8 = 0x0f;

// Field offsets inside the CBW.
const CBW_TAG: usize = 4;
const CBW_DATA_TRANSFER_LENGTH: usize = 8;
const CBW_FLAGS: usize = 12;
const CBW_LUN: usize = 13;
const CBW_CB_LENGTH: usize = 14;
const CBW_CB: usize = 15;

// Field offsets inside the CSW.
const CSW_TAG: usize = 4;
const CSW_DATA_RESIDUE: usize = 8;
const CSW_STATUS: usize = 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CBWDirection {
    /// Data-Out: from host to the device
    DataOut,
    /// Data-In: from the device to the host
    DataIn,
    /// For when the CBW has a data transfer length of zero.
    ///
    /// Per the Bulk Only Transport document, this field is ignored entirely if the data transfer
    /// length field is zero, so it exists in the enum purely as an abstraction
    NonDirectional,
}

/// The CBW wraps an SCSI command.
///
/// Field details can be found in the USB Mass Storage Class - Bulk Only Transport document,
/// section 5.1.
///
/// | Offset | Field                    |
/// | ------ | ------------------------ |
/// | 0      | `dCBWSignature`          |
/// | 4      | `dCBWTag`                |
/// | 8      | `dCBWDataTransferLength` |
/// | 12     | `bmCBWFlags`             |
/// | 13     | `bCBWLUN`                |
/// | 14     | `bCBWCBLength`           |
/// | 15     | `CBWCB` (16 bytes)       |
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    /// `dCBWTag` - "A Command Block Tag sent by the host. The device shall echo
    /// the contents of this field back to the host in the [tag] field of the associated CSW.
    /// The [tag] positvely associates a CSW with the corrosponding CBW"
    pub tag: u32,
    /// `dCBWDataTransferLength` - "The number of bytes that the host expects
    /// to transfer on the Bulk-In or Bulk-Out endpoint (as indicated by the
    /// *Direction* bit) during the execution of this command. If this field
    /// is zero, the device and the host shall transfer no data between the CBW
    /// and associated CSW, and the device shall ignore the value of the *Direction*
    /// bit in *bmCBWFlags*."
    pub data_transfer_length: u32,
    /// `bmCBWFlags`, kept verbatim. See [`CommandBlockWrapper::direction`].
    pub flags: u8,
    /// `bCBWLUN`, kept verbatim. See [`CommandBlockWrapper::lun`].
    pub lun: u8,
    /// `bCBWCBLength` and `CBWCB` - "The command block to be executed by the device.
    /// The device shall first interpret the *bCBWCBLength* bytes in this field as a command
    /// block as defined by the command set *bInterfaceSubClass*."
    pub command: CommandBuffer,
}

impl CommandBlockWrapper {
    /// Creates a new [`CommandBlockWrapper`] on the host side.
    pub fn new(command: &CommandBlock, lun: u8, tag: u32) -> Self {
        let flags = match command.direction {
            CBWDirection::DataIn => CBW_DIRECTION_IN,
            CBWDirection::DataOut | CBWDirection::NonDirectional => 0,
        };
        Self {
            tag,
            data_transfer_length: command.data_transfer_len,
            flags,
            lun: lun & CBW_LUN_MASK,
            command: command.command,
        }
    }

    /// Decodes a CBW received on the bulk-OUT endpoint.
    ///
    /// "The device shall consider the CBW valid when the CBW was received after the device
    /// had sent a CSW or after a reset, the CBW is 31 (1Fh) bytes in length, and the
    /// dCBWSignature is equal to 43425355h." (section 6.2.1)
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        let buf: &[u8; CBW_SIZE] = buf
            .try_into()
            .map_err(|_| ProtocolError::InvalidLength(buf.len()))?;
        let signature = le32(buf, 0);
        if signature != CBW_SIGNATURE {
            return Err(ProtocolError::InvalidSignature(signature));
        }
        let mut command = [0; MAX_CDB_SIZE];
        command.copy_from_slice(&buf[CBW_CB..]);
        Ok(Self {
            tag: le32(buf, CBW_TAG),
            data_transfer_length: le32(buf, CBW_DATA_TRANSFER_LENGTH),
            flags: buf[CBW_FLAGS],
            lun: buf[CBW_LUN],
            command: CommandBuffer::new(command, buf[CBW_CB_LENGTH]),
        })
    }

    pub fn to_bytes(&self) -> [u8; CBW_SIZE] {
        let mut buf = [0; CBW_SIZE];
        buf[..CBW_TAG].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        buf[CBW_TAG..CBW_DATA_TRANSFER_LENGTH].copy_from_slice(&self.tag.to_le_bytes());
        buf[CBW_DATA_TRANSFER_LENGTH..CBW_FLAGS]
            .copy_from_slice(&self.data_transfer_length.to_le_bytes());
        buf[CBW_FLAGS] = self.flags;
        buf[CBW_LUN] = self.lun;
        buf[CBW_CB_LENGTH] = self.command.declared_len();
        buf[CBW_CB..].copy_from_slice(self.command.raw());
        buf
    }

    /// The direction of the data phase, if there is one.
    pub fn direction(&self) -> CBWDirection {
        if self.data_transfer_length == 0 {
            CBWDirection::NonDirectional
        } else if self.flags & CBW_DIRECTION_IN != 0 {
            CBWDirection::DataIn
        } else {
            CBWDirection::DataOut
        }
    }

    /// The logical unit this command is addressed to.
    pub fn lun(&self) -> u8 {
        self.lun & CBW_LUN_MASK
    }
}

fn le32(buf: &[u8; CBW_SIZE], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

/// A packet containing the status/return value of a command block executed by the USB device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    /// `dCSWTag` - "The device shall set this field to the value received in the *dCBWTag* of
    /// the associated CBW."
    pub tag: u32,
    /// `dCSWDataResidue` - "For Data-Out the device shall report in the *dCSWDataResidue* the
    /// difference between the amount of data expected as stated in the *dCBWDataTransferLength*,
    /// and the actual amount of data processed by the device. For Data-In the device
    /// shall report in the *dCSWDataResidue* the difference between the amount of data expected
    /// as stated in the *dCBWDataTransferLength* and the actual amount of relevant
    /// data sent by the device. The *dCSWDataResidue* shall not exceed the value sent in the
    /// *dCBWDataTransferLength*."
    pub data_residue: u32,
    /// `bCSWStatus` "*bCSWStatus indicates the success or failure of the command. The device
    /// shall set this byte to zero if the command completed successfully. A non-zero value
    /// shall indicate a failure during command execution according to the following table:
    ///
    /// | Value | Description                    |
    /// | ----- | ------------------------------ |
    /// | 0x00  | Command Passed ("good status") |
    /// | 0x01  | Command Failed                 |
    /// | 0x02  | Phase Error                    |
    /// | _     | All other values are reserved  |
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    pub fn simple(tag: u32, status: CommandStatus, data_residue: u32) -> Self {
        Self {
            tag,
            data_residue,
            status,
        }
    }

    pub fn to_bytes(&self) -> [u8; CSW_SIZE] {
        let mut buf = [0; CSW_SIZE];
        buf[..CSW_TAG].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        buf[CSW_TAG..CSW_DATA_RESIDUE].copy_from_slice(&self.tag.to_le_bytes());
        buf[CSW_DATA_RESIDUE..CSW_STATUS].copy_from_slice(&self.data_residue.to_le_bytes());
        buf[CSW_STATUS] = self.status as u8;
        buf
    }

    /// Parse the provided slice into a command status wrapper.
    ///
    /// This function validates that the `signature` is correct.
    pub fn from_slice(buf: &[u8]) -> color_eyre::Result<CommandStatusWrapper> {
        ensure!(
            buf.len() == CSW_SIZE,
            "provided buffer *must* be same size as struct (CSW_SIZE), was instead {}",
            buf.len()
        );
        let status = match buf[CSW_STATUS] {
            0 => CommandStatus::Passed,
            1 => CommandStatus::Failed,
            2 => CommandStatus::PhaseError,
            other => color_eyre::eyre::bail!(
                "the command status field is invalid, should be in 0..=2, was {other}"
            ),
        };
        let field = |offset: usize| {
            u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
        };
        let signature = field(0);
        ensure!(
            signature == CSW_SIGNATURE,
            "invalid magic number for command status wrapper, should be 0x53425355, is 0x{:X}",
            signature
        );
        Ok(Self {
            tag: field(CSW_TAG),
            data_residue: field(CSW_DATA_RESIDUE),
            status,
        })
    }
}

/// Used for generating unique-ish command block tags.
#[derive(Debug)]
pub struct TagGenerator(u32);

impl TagGenerator {
    /// Initialize the tag generator.
    pub fn new() -> TagGenerator {
        // 123 was chosen as a distinct, human-readable pattern to differentiate it from the rest
        // of the packet
        Self(123)
    }

    /// Returns a unique-ish u32 that's different from the previously returned value.
    pub fn tag(&mut self) -> u32 {
        let output = self.0;
        self.0 = self.0.wrapping_add(1);
        output
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}
