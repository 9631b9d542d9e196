//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe almost every command we need to know,
//!   except for some information specific to block devices, which is described in the next SCSI
//!   specification linked below.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   This is an older version of the SCSI block commands specification. It contains information
//!   about commands specific to block devices.
//!
//! The device side of this crate reads command blocks with [`command_descriptor`], answers
//! them with the structures in [`response`], and reports failures with the model in [`sense`].
//! The host side (used by the simulator and the tests) builds command blocks with [`command`].

pub mod command;
pub mod command_descriptor;
pub mod response;
pub mod sense;

use color_eyre::eyre::ensure;

/// A fixed-layout structure that goes on the wire exactly as laid out in memory.
///
/// SCSI structures are big endian, so multi-byte fields are stored as byte arrays
/// and decoded with `from_be_bytes` by the accessors of each structure. This keeps
/// the layout independent of the host's native endianness and alignment.
///
/// # Safety
///
/// Implementors must be `#[repr(C, packed)]` and built only from `u8`, `[u8; N]` or
/// other [`ByteStruct`] fields. That guarantees there is no padding and that every
/// byte pattern of the right length is a valid value.
pub unsafe trait ByteStruct: Copy + Sized {
    /// Returns the raw bytes of `self`, exactly `size_of::<Self>()` long.
    fn as_slice(&self) -> &[u8] {
        // SAFETY: the trait contract guarantees a padding-free layout, and the
        // slice borrows from `self`
        unsafe {
            std::slice::from_raw_parts(
                self as *const Self as *const u8,
                std::mem::size_of::<Self>(),
            )
        }
    }

    /// Reinterprets `buf` as `Self` without copying.
    ///
    /// The buffer *must* be the same size as the struct.
    fn from_slice(buf: &[u8]) -> color_eyre::Result<&Self> {
        ensure!(
            buf.len() == std::mem::size_of::<Self>(),
            "provided buffer is {} bytes, {} requires {}",
            buf.len(),
            std::any::type_name::<Self>(),
            std::mem::size_of::<Self>()
        );
        // SAFETY: the size was checked above, alignment is 1 and every bit pattern
        // is valid per the trait contract
        Ok(unsafe { &*(buf.as_ptr() as *const Self) })
    }
}
