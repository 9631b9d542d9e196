//! Underlying structures that commands are issued in, and the parser that reads
//! them back out of a command block wrapper.
//!
//! A CDB is an operation code followed by up to 15 parameter bytes. The layout of
//! those parameter bytes depends on the operation code; each supported layout is a
//! [`ByteStruct`] the parameters can be cast to in place.

use color_eyre::eyre::ensure;

use super::ByteStruct;
use super::sense::{AscAscq, CommandResult, MassStorageError};

/// The largest command block a CBW can carry (USB MSC BOT section 5.1, `CBWCB`).
pub const MAX_CDB_SIZE: usize = 16;

/// Operation codes for a Command Descriptor Block, specifying what operation you want
/// to do as described in 7.1 of SPC-2.
///
/// Only the commands a USB flash drive is expected to answer are listed; anything
/// else is reported to the host as an illegal request.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x00,
    /// SPC-2 7.20
    RequestSense = 0x03,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SPC-2 7.8
    ModeSense6 = 0x1a,
    /// SBC-2 5.1.18
    StartStopUnit = 0x1b,
    /// SPC-2 7.12
    PreventAllowMediumRemoval = 0x1e,
    /// SBC-2 5.1.10, table 27
    ReadCapacity = 0x25,
    /// SBC-2 5.1.6
    Read10 = 0x28,
    /// SBC-2 5.1.20
    Write10 = 0x2a,
    /// SBC-2 5.1.19
    Verify10 = 0x2f,
    /// SPC-2 7.9
    ModeSense10 = 0x5a,
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => OpCode::TestUnitReady,
            0x03 => OpCode::RequestSense,
            0x12 => OpCode::Inquiry,
            0x1a => OpCode::ModeSense6,
            0x1b => OpCode::StartStopUnit,
            0x1e => OpCode::PreventAllowMediumRemoval,
            0x25 => OpCode::ReadCapacity,
            0x28 => OpCode::Read10,
            0x2a => OpCode::Write10,
            0x2f => OpCode::Verify10,
            0x5a => OpCode::ModeSense10,
            other => return Err(other),
        })
    }
}

/// Returns the CDB length implied by the group code of `opcode` (the top 3 bits),
/// as described in SAM-2 5.2 table 11.
///
/// Returns zero for the reserved and vendor specific groups, which have no fixed length.
pub const fn cdb_size(opcode: u8) -> usize {
    match opcode >> 5 {
        0 => 6,
        1 | 2 => 10,
        4 => 16,
        5 => 12,
        _ => 0,
    }
}

/// The `CBWCB` field of a command block wrapper: an operation code, up to 15
/// parameter bytes and the length the host declared in `bCBWCBLength`.
///
/// The raw bytes are kept as received, including anything past the declared
/// length, so the wrapper re-encodes exactly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandBuffer {
    bytes: [u8; MAX_CDB_SIZE],
    declared_len: u8,
}

impl CommandBuffer {
    pub fn new(bytes: [u8; MAX_CDB_SIZE], declared_len: u8) -> Self {
        Self {
            bytes,
            declared_len,
        }
    }

    /// Copies a command block into a zero-filled buffer, declaring its length.
    pub fn from_command(command: &[u8]) -> color_eyre::Result<Self> {
        ensure!(
            (1..=MAX_CDB_SIZE).contains(&command.len()),
            "a command block is 1 to {MAX_CDB_SIZE} bytes long, got {}",
            command.len()
        );
        let mut bytes = [0; MAX_CDB_SIZE];
        bytes[..command.len()].copy_from_slice(command);
        Ok(Self::new(bytes, command.len() as u8))
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// The length the host declared for this command block (`bCBWCBLength`).
    pub fn declared_len(&self) -> u8 {
        self.declared_len
    }

    /// The expected length of this command block, derived from its operation code.
    pub fn cdb_size(&self) -> usize {
        cdb_size(self.opcode())
    }

    /// Whether the declared length matches the length implied by the operation code.
    ///
    /// A `false` result means the command is malformed; check this before casting.
    pub fn parseable(&self) -> bool {
        let size = self.cdb_size();
        size != 0 && usize::from(self.declared_len) == size
    }

    /// All 16 bytes of the field, significant or not.
    pub fn raw(&self) -> &[u8; MAX_CDB_SIZE] {
        &self.bytes
    }

    /// The significant bytes of the command block.
    pub fn as_slice(&self) -> &[u8] {
        let len = usize::from(self.declared_len).min(MAX_CDB_SIZE);
        &self.bytes[..len]
    }

    /// Reinterprets the parameter bytes as `T` without copying.
    ///
    /// `T` must cover exactly the declared parameter bytes (declared length minus
    /// the operation code); anything else is a bug in the caller.
    pub fn cast<T: CommandParameters>(&self) -> color_eyre::Result<&T> {
        let len = usize::from(self.declared_len);
        ensure!(
            (1..=MAX_CDB_SIZE).contains(&len),
            "declared command block length {len} is out of range"
        );
        T::from_slice(&self.bytes[1..len])
    }

    /// Decodes the command block into one of the supported commands.
    ///
    /// Unknown operation codes decode to [`ScsiCommand::Unsupported`]. A known
    /// operation code whose declared length does not match its group fails with an
    /// illegal request.
    pub fn decode(&self) -> CommandResult<ScsiCommand<'_>> {
        let Ok(opcode) = OpCode::try_from(self.opcode()) else {
            return Ok(ScsiCommand::Unsupported(self.opcode()));
        };
        if !self.parseable() {
            return Err(MassStorageError::illegal_request(AscAscq::NONE));
        }
        Ok(match opcode {
            OpCode::TestUnitReady => {
                self.params::<TestUnitReadyParameters>()?;
                ScsiCommand::TestUnitReady
            }
            OpCode::RequestSense => ScsiCommand::RequestSense(self.params()?),
            OpCode::Inquiry => ScsiCommand::Inquiry(self.params()?),
            OpCode::ModeSense6 => ScsiCommand::ModeSense6(self.params()?),
            OpCode::StartStopUnit => ScsiCommand::StartStopUnit(self.params()?),
            OpCode::PreventAllowMediumRemoval => {
                ScsiCommand::PreventAllowMediumRemoval(self.params()?)
            }
            OpCode::ReadCapacity => ScsiCommand::ReadCapacity10(self.params()?),
            OpCode::Read10 => ScsiCommand::Read10(self.params()?),
            OpCode::Write10 => ScsiCommand::Write10(self.params()?),
            OpCode::Verify10 => ScsiCommand::Verify10(self.params()?),
            OpCode::ModeSense10 => ScsiCommand::ModeSense10(self.params()?),
        })
    }

    fn params<T: CommandParameters>(&self) -> CommandResult<&T> {
        self.cast()
            .map_err(|_| MassStorageError::illegal_request(AscAscq::NONE))
    }
}

/// A decoded command, borrowing its parameters from the command buffer.
#[derive(Copy, Clone, Debug)]
pub enum ScsiCommand<'a> {
    TestUnitReady,
    RequestSense(&'a RequestSenseParameters),
    Inquiry(&'a InquiryParameters),
    ModeSense6(&'a ModeSense6Parameters),
    StartStopUnit(&'a StartStopUnitParameters),
    PreventAllowMediumRemoval(&'a PreventAllowMediumRemovalParameters),
    ReadCapacity10(&'a ReadCapacity10Parameters),
    Read10(&'a Io10Parameters),
    Write10(&'a Io10Parameters),
    Verify10(&'a Verify10Parameters),
    ModeSense10(&'a ModeSense10Parameters),
    /// An operation code this device does not implement.
    Unsupported(u8),
}

/// Marker for the per-opcode parameter layouts [`CommandBuffer::cast`] accepts.
pub trait CommandParameters: ByteStruct {}

/// Parameters of a 6 byte command that carries nothing but the `CONTROL` byte.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Void6Parameters {
    _reserved: [u8; 4],
    pub control: u8,
}

pub type TestUnitReadyParameters = Void6Parameters;

/// SPC-2 7.20, table 103
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestSenseParameters {
    /// Bit 0 is `DESC`, asking for descriptor format sense data.
    pub flags: u8,
    _reserved: [u8; 2],
    pub allocation_length: u8,
    pub control: u8,
}

impl RequestSenseParameters {
    pub fn allocation_length(&self) -> usize {
        usize::from(self.allocation_length)
    }
}

/// SPC-2 7.3.1, table 45
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InquiryParameters {
    /// Bit 0 is `EVPD`, requesting a vital product data page.
    pub flags: u8,
    pub page_code: u8,
    pub allocation_length: [u8; 2],
    pub control: u8,
}

impl InquiryParameters {
    pub const EVPD: u8 = 0x01;

    pub fn allocation_length(&self) -> usize {
        usize::from(u16::from_be_bytes(self.allocation_length))
    }

    /// Whether the host asked for anything other than standard inquiry data.
    pub fn wants_vital_product_data(&self) -> bool {
        self.flags & Self::EVPD != 0 || self.page_code != 0
    }
}

/// SPC-2 7.8, table 97
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModeSense6Parameters {
    /// Bit 3 is `DBD` (disable block descriptors).
    pub flags: u8,
    /// Page control (bits 7:6) and page code (bits 5:0).
    pub page: u8,
    pub subpage_code: u8,
    pub allocation_length: u8,
    pub control: u8,
}

impl ModeSense6Parameters {
    pub fn allocation_length(&self) -> usize {
        usize::from(self.allocation_length)
    }
}

/// SBC-2 5.1.18, table 49
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StartStopUnitParameters {
    /// Bit 0 is `IMMED`.
    pub flags1: u8,
    _reserved: [u8; 2],
    /// Power condition (bits 7:4), `LOEJ` (bit 1) and `START` (bit 0).
    pub flags2: u8,
    pub control: u8,
}

impl StartStopUnitParameters {
    pub fn start(&self) -> bool {
        self.flags2 & 0x01 != 0
    }

    pub fn load_eject(&self) -> bool {
        self.flags2 & 0x02 != 0
    }
}

/// SPC-2 7.12, table 77
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PreventAllowMediumRemovalParameters {
    _reserved: [u8; 3],
    /// The `PREVENT` field lives in bits 1:0 (table 78).
    pub flags: u8,
    pub control: u8,
}

impl PreventAllowMediumRemovalParameters {
    pub fn prevent(&self) -> bool {
        self.flags & 0b11 != 0
    }
}

/// SBC-2 5.1.10, table 27
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadCapacity10Parameters {
    /// Bit 0 is the obsolete `RELADR`.
    pub flags1: u8,
    pub lba: [u8; 4],
    _reserved: [u8; 2],
    /// Bit 0 is `PMI` (partial medium indicator).
    pub flags2: u8,
    pub control: u8,
}

impl ReadCapacity10Parameters {
    pub fn lba(&self) -> u32 {
        u32::from_be_bytes(self.lba)
    }
}

/// Shared layout of READ (10) and WRITE (10), SBC-2 5.1.6 table 19 and 5.1.20 table 61.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Io10Parameters {
    /// `DPO`, `FUA` and friends; this device honors none of them.
    pub flags: u8,
    pub lba: [u8; 4],
    pub group_number: u8,
    /// Number of blocks to transfer.
    pub transfer_length: [u8; 2],
    pub control: u8,
}

impl Io10Parameters {
    pub fn lba(&self) -> u32 {
        u32::from_be_bytes(self.lba)
    }

    pub fn transfer_length(&self) -> u16 {
        u16::from_be_bytes(self.transfer_length)
    }
}

pub type Read10Parameters = Io10Parameters;
pub type Write10Parameters = Io10Parameters;

/// SBC-2 5.1.19, table 59
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Verify10Parameters {
    /// Bit 1 is `BYTCHK`: the host sends the data to compare against.
    pub flags1: u8,
    pub lba: [u8; 4],
    pub flags2: u8,
    /// Number of blocks to verify.
    pub verification_length: [u8; 2],
    pub control: u8,
}

impl Verify10Parameters {
    pub const BYTCHK: u8 = 0x02;

    pub fn lba(&self) -> u32 {
        u32::from_be_bytes(self.lba)
    }

    pub fn verification_length(&self) -> u16 {
        u16::from_be_bytes(self.verification_length)
    }

    pub fn byte_check(&self) -> bool {
        self.flags1 & Self::BYTCHK != 0
    }
}

/// SPC-2 7.9, table 99
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModeSense10Parameters {
    /// `LLBAA` (bit 4) and `DBD` (bit 3).
    pub flags: u8,
    /// Page control (bits 7:6) and page code (bits 5:0).
    pub page: u8,
    /// Subpage code followed by three reserved bytes.
    _reserved: [u8; 4],
    pub allocation_length: [u8; 2],
    pub control: u8,
}

impl ModeSense10Parameters {
    pub fn allocation_length(&self) -> usize {
        usize::from(u16::from_be_bytes(self.allocation_length))
    }
}

macro_rules! command_parameters {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: `#[repr(C, packed)]` and made only of bytes
            unsafe impl ByteStruct for $ty {}
            impl CommandParameters for $ty {}
        )*
    };
}

command_parameters!(
    Void6Parameters,
    RequestSenseParameters,
    InquiryParameters,
    ModeSense6Parameters,
    StartStopUnitParameters,
    PreventAllowMediumRemovalParameters,
    ReadCapacity10Parameters,
    Io10Parameters,
    Verify10Parameters,
    ModeSense10Parameters,
);

/// As described in SPC-2 4.3.2 table 1, a typical CDB for 6 byte commands.
///
/// Used on the host side to build commands.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug)]
pub struct X6CommandDescriptor {
    /// This field specifies what command is being issued by the host
    /// to the drive.
    pub operation_code: OpCode,
    /// "A six-byte CDB contains a 21-bit `LOGICAL BLOCK ADDRESS` field."
    /// The last 3 bits are reserved.
    ///
    /// The use of this field varies from command to command.
    pub logical_block_address: [u8; 3],
    /// Depending on the opcode, this field is one of `TRANSFER LENGTH` (amount of
    /// data to be transferred, usually in blocks),
    /// `PARAMETER LIST LENGTH` (number of bytes sent from the Data-Out buffer),
    /// or `ALLOCATION LENGTH` (The maximum number of bytes a client has allocated for returned
    /// data).
    ///
    /// More info can be found in SCSI SPC2 4.3
    pub misc_len: u8,
    /// "The contents of the `CONTROL` field are defined in SAM-2. The `CONTROL` field
    /// has a consistently defined meaning across all commands."
    ///
    /// As far as I can tell, this value is set to zero by most modern implementations.
    pub control: u8,
}

impl CommandDescriptor for X6CommandDescriptor {}

/// As described in SPC-2 4.3.2 table 2, a typical CDB for 10 byte commands.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug)]
pub struct X10CommandDescriptor {
    pub operation_code: OpCode,
    /// (if required) the lower 5 bits identify a function to be performed under the
    /// more general command specified in the `OPERATION CODE` field
    pub service_action: u8,
    /// Big endian. The use of this field varies from command to command.
    pub logical_block_address: [u8; 4],
    pub group_number: u8,
    /// Big endian `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`.
    pub misc_len: [u8; 2],
    pub control: u8,
}

impl CommandDescriptor for X10CommandDescriptor {}

pub trait CommandDescriptor: Sized {
    fn as_slice(&'_ self) -> &[u8] {
        // SAFETY: A struct is the size of itself, and the descriptors are packed
        // so there is no padding to read
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const Self as *const u8;
            std::slice::from_raw_parts(ptr, std::mem::size_of::<Self>())
        };
        slice
    }

    /// Copies the descriptor into a [`CommandBuffer`] declaring its own length.
    fn to_command_buffer(&self) -> CommandBuffer {
        let command = self.as_slice();
        let mut bytes = [0; MAX_CDB_SIZE];
        bytes[..command.len()].copy_from_slice(command);
        CommandBuffer::new(bytes, command.len() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(command: &[u8]) -> CommandBuffer {
        CommandBuffer::from_command(command).unwrap()
    }

    #[test]
    fn cdb_size_follows_group_code() {
        for opcode in [0x00, 0x03, 0x12, 0x1a, 0x1b, 0x1e] {
            assert_eq!(cdb_size(opcode), 6, "opcode {opcode:#04x}");
        }
        for opcode in [0x25, 0x28, 0x2a, 0x2f, 0x5a] {
            assert_eq!(cdb_size(opcode), 10, "opcode {opcode:#04x}");
        }
        assert_eq!(cdb_size(0x88), 16);
        assert_eq!(cdb_size(0xa0), 12);
        assert_eq!(cdb_size(0x7f), 0);
        assert_eq!(cdb_size(0xff), 0);
    }

    #[test]
    fn parseable_only_when_length_matches_group() {
        assert!(buffer(&[0x12, 0, 0, 0, 36, 0]).parseable());
        assert!(!buffer(&[0x12, 0, 0, 0, 36, 0, 0]).parseable());
        assert!(buffer(&[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0]).parseable());
        assert!(!buffer(&[0x28, 0, 0, 0, 0, 0]).parseable());
        assert!(!buffer(&[0xff]).parseable());
    }

    #[test]
    fn every_opcode_is_parseable_at_its_group_size() {
        for opcode in [0x00, 0x03, 0x12, 0x1a, 0x1b, 0x1e, 0x25, 0x28, 0x2a, 0x2f, 0x5a] {
            let mut bytes = [0; MAX_CDB_SIZE];
            bytes[0] = opcode;
            let cb = CommandBuffer::new(bytes, cdb_size(opcode) as u8);
            assert!(cb.parseable(), "opcode {opcode:#04x}");
            assert!(cb.decode().is_ok(), "opcode {opcode:#04x}");
        }
    }

    #[test]
    fn cast_reads_big_endian_fields_in_place() {
        let cb = buffer(&[0x28, 0, 0x00, 0x01, 0x02, 0x03, 0, 0x00, 0x08, 0]);
        let params: &Io10Parameters = cb.cast().unwrap();
        assert_eq!(params.lba(), 0x0001_0203);
        assert_eq!(params.transfer_length(), 8);
        // the cast borrows the buffer's own bytes
        assert_eq!(
            params as *const Io10Parameters as *const u8,
            cb.raw()[1..].as_ptr()
        );
    }

    #[test]
    fn cast_to_mismatched_layout_is_an_error() {
        let cb = buffer(&[0x12, 0, 0, 0, 36, 0]);
        assert!(cb.cast::<Io10Parameters>().is_err());
        assert!(cb.cast::<InquiryParameters>().is_ok());
    }

    #[test]
    fn decode_routes_unknown_opcodes_to_unsupported() {
        let cb = buffer(&[0xff, 0, 0, 0, 0, 0]);
        assert!(matches!(cb.decode(), Ok(ScsiCommand::Unsupported(0xff))));
    }

    #[test]
    fn decode_rejects_wrong_length_for_known_opcode() {
        let err = buffer(&[0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0])
            .decode()
            .expect_err("test unit ready is a 6 byte command");
        assert_eq!(err, MassStorageError::IllegalRequest(AscAscq::NONE));
    }

    #[test]
    fn verify_byte_check_flag() {
        let cb = buffer(&[0x2f, 0x02, 0, 0, 0, 4, 0, 0, 2, 0]);
        let ScsiCommand::Verify10(params) = cb.decode().unwrap() else {
            panic!("expected verify");
        };
        assert!(params.byte_check());
        assert_eq!(params.lba(), 4);
        assert_eq!(params.verification_length(), 2);
    }

    #[test]
    fn x10_descriptor_is_ten_bytes() {
        let cb = X10CommandDescriptor {
            operation_code: OpCode::Read10,
            service_action: 0,
            logical_block_address: 7u32.to_be_bytes(),
            group_number: 0,
            misc_len: 2u16.to_be_bytes(),
            control: 0,
        }
        .to_command_buffer();
        assert_eq!(cb.declared_len(), 10);
        assert_eq!(cb.as_slice(), &[0x28, 0, 0, 0, 0, 7, 0, 0, 2, 0]);
    }
}
