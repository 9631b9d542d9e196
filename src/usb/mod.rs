//! The device side of the USB mass storage Bulk-Only Transport (BOT, also "BBB").
//!
//! There will be two bulk endpoints: one for receiving data from the host computer (OUT)
//! and one for sending data to it (IN). Data on these endpoints adheres to the bulk-only
//! transport protocol. In addition, there are two class requests (Get Max LUN and
//! Bulk-Only Mass Storage Reset) that are sent over the control endpoint.
//!
//! The host starts out by sending a 31-byte command block wrapper (CBW), optionally sending
//! or receiving data depending on what command it is, and then reading a 13-byte command
//! status wrapper (CSW) containing the result of the command. The CBW and CSW are simply
//! wrappers around SCSI commands.
//!
//! - [`function`] holds the transport state machine.
//! - [`gadget`] runs it against asynchronous endpoints.
//! - [`host`] is the other end of those endpoints, used by the simulator and the tests.
//!
//! Reference: USB Mass Storage Class - Bulk Only Transport, revision 1.0.

pub mod cbw;
pub mod control;
pub mod function;
pub mod gadget;
pub mod host;

use thiserror::Error;

/// The host and the device no longer agree on where they are in the protocol.
///
/// None of these can be answered with a CSW; the endpoints must be halted until
/// the host performs a Bulk-Only Mass Storage Reset.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("command block wrapper must be 31 bytes, received {0}")]
    InvalidLength(usize),
    #[error("invalid magic number for command block wrapper, should be 0x43425355, is 0x{0:X}")]
    InvalidSignature(u32),
    #[error("logical unit {lun} addressed, but the highest one is {max_lun}")]
    LunOutOfRange { lun: u8, max_lun: u8 },
    #[error("bulk endpoints are halted until the host resets the function")]
    Stalled,
    #[error("unsupported control request {request:#04x} (bmRequestType {request_type:#04x})")]
    UnsupportedControlRequest { request_type: u8, request: u8 },
}
