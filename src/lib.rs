//! An emulated USB mass storage function (Bulk-Only Transport, SCSI transparent
//! command set).
//!
//! - [`usb`] holds the transport: wire formats, the state machine, the endpoint layer
//!   and a host-side driver.
//! - [`scsi`] holds the command set: command blocks, responses and sense data.
//! - [`lun`] holds the storage backends commands are dispatched to.

pub mod lun;
pub mod scsi;
pub mod usb;
