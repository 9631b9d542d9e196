//! Sense data and the errors a command can fail with.
//!
//! The host only ever sees two things when a command fails: the status byte of the
//! CSW, and (if it asks with REQUEST SENSE) the sense data of the logical unit.
//! [`MassStorageError`] carries enough to produce both.

use std::fmt;

use thiserror::Error;

use super::response::RequestSenseResponse;
use crate::usb::cbw::CommandStatus;

/// Sense keys, SPC-2 table 107.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    VendorSpecific = 0x9,
    CopyAborted = 0xa,
    AbortedCommand = 0xb,
    VolumeOverflow = 0xd,
    Miscompare = 0xe,
}

/// Additional sense code (high byte) and qualifier (low byte), SPC-2 table 108.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AscAscq(pub u16);

impl AscAscq {
    pub const NONE: AscAscq = AscAscq(0x0000);
    pub const LUN_NOT_READY: AscAscq = AscAscq(0x0400);
    pub const LUN_BECOMING_READY: AscAscq = AscAscq(0x0401);
    pub const MISCOMPARE_DURING_VERIFY: AscAscq = AscAscq(0x1d00);
    pub const INVALID_COMMAND_OPERATION_CODE: AscAscq = AscAscq(0x2000);
    pub const LBA_OUT_OF_RANGE: AscAscq = AscAscq(0x2100);
    pub const INVALID_FIELD_IN_CDB: AscAscq = AscAscq(0x2400);
    pub const LUN_NOT_SUPPORTED: AscAscq = AscAscq(0x2500);
    pub const MEDIUM_NOT_PRESENT: AscAscq = AscAscq(0x3a00);

    pub fn asc(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn ascq(self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Display for AscAscq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}/{:02x}", self.asc(), self.ascq())
    }
}

/// Why a command failed.
///
/// Return this from a logical unit handler; the transport turns it into a CSW
/// status and stores [`MassStorageError::sense`] on the logical unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MassStorageError {
    /// A SCSI-defined failure with the status to report and, if any, the sense data.
    #[error("command failed with {status:?}")]
    Command {
        status: CommandStatus,
        sense: Option<RequestSenseResponse>,
    },
    /// The data actually available does not match what the CBW declared.
    #[error("phase error")]
    Phase,
    /// The command cannot be parsed, is not supported, or has invalid fields.
    #[error("illegal request (asc/ascq {0})")]
    IllegalRequest(AscAscq),
}

impl MassStorageError {
    pub fn illegal_request(details: AscAscq) -> Self {
        MassStorageError::IllegalRequest(details)
    }

    /// The unit cannot service I/O right now.
    pub fn not_ready(details: AscAscq) -> Self {
        MassStorageError::with_sense(SenseKey::NotReady, details)
    }

    pub fn lba_out_of_range() -> Self {
        MassStorageError::illegal_request(AscAscq::LBA_OUT_OF_RANGE)
    }

    /// VERIFY with byte check found data that differs from the medium.
    pub fn miscompare() -> Self {
        MassStorageError::with_sense(SenseKey::Miscompare, AscAscq::MISCOMPARE_DURING_VERIFY)
    }

    /// A failed command reporting the given sense.
    pub fn with_sense(sense_key: SenseKey, details: AscAscq) -> Self {
        MassStorageError::Command {
            status: CommandStatus::Failed,
            sense: Some(RequestSenseResponse::simple(sense_key, details)),
        }
    }

    /// The status byte to put in the CSW.
    pub fn csw_status(&self) -> CommandStatus {
        match self {
            MassStorageError::Command { status, .. } => *status,
            MassStorageError::Phase => CommandStatus::PhaseError,
            MassStorageError::IllegalRequest(_) => CommandStatus::Failed,
        }
    }

    /// The sense data the logical unit should report afterwards.
    pub fn sense(&self) -> Option<RequestSenseResponse> {
        match self {
            MassStorageError::Command { sense, .. } => *sense,
            MassStorageError::Phase => Some(RequestSenseResponse::simple(
                SenseKey::IllegalRequest,
                AscAscq::NONE,
            )),
            MassStorageError::IllegalRequest(details) => Some(RequestSenseResponse::simple(
                SenseKey::IllegalRequest,
                *details,
            )),
        }
    }
}

pub type CommandResult<T> = Result<T, MassStorageError>;
