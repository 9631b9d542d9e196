//! A logical unit backed by memory.

use std::borrow::Cow;
use std::ops::Range;

use color_eyre::eyre::ensure;
use tracing::debug;

use super::LogicalUnit;
use crate::scsi::response::{
    InquiryResponse, PERIPHERAL_QUALIFIER_LOADED, PERIPHERAL_TYPE_DIRECT, RequestSenseResponse,
};
use crate::scsi::sense::{CommandResult, MassStorageError};

pub const DEFAULT_BLOCK_SIZE: u32 = 512;
/// 16 MiB worth of 512 byte blocks.
pub const DEFAULT_BLOCK_COUNT: u32 = 16 * 1024 * 1024 / DEFAULT_BLOCK_SIZE;

/// A removable disk whose blocks live in a `Vec`. Contents are lost on drop.
pub struct RamDisk {
    blocks: Vec<u8>,
    block_size: u32,
    block_count: u32,
    inquiry: InquiryResponse,
    sense: Option<RequestSenseResponse>,
}

impl RamDisk {
    pub fn new(block_size: u32, block_count: u32) -> color_eyre::Result<Self> {
        ensure!(block_size > 0, "block size must not be zero");
        ensure!(block_count > 0, "a disk needs at least one block");
        let len = usize::try_from(u64::from(block_size) * u64::from(block_count))?;
        Ok(Self {
            blocks: vec![0; len],
            block_size,
            block_count,
            inquiry: InquiryResponse::simple(
                PERIPHERAL_QUALIFIER_LOADED | PERIPHERAL_TYPE_DIRECT,
                true,
                b"GLASS",
                b"RAM DISK",
                b"0001",
            )?,
            sense: None,
        })
    }

    /// Replaces the vendor and product strings reported by INQUIRY.
    pub fn with_identity(mut self, vendor: &str, product: &str) -> color_eyre::Result<Self> {
        self.inquiry = InquiryResponse::simple(
            PERIPHERAL_QUALIFIER_LOADED | PERIPHERAL_TYPE_DIRECT,
            true,
            vendor.as_bytes(),
            product.as_bytes(),
            b"0001",
        )?;
        Ok(self)
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Byte range covered by `length` blocks at `lba`, if it lies on the disk.
    fn range(&self, lba: u32, length: u16) -> CommandResult<Range<usize>> {
        let end = u64::from(lba) + u64::from(length);
        if end > u64::from(self.block_count) {
            return Err(MassStorageError::lba_out_of_range());
        }
        let block_size = self.block_size as usize;
        Ok(lba as usize * block_size..end as usize * block_size)
    }
}

impl Default for RamDisk {
    fn default() -> Self {
        Self {
            blocks: vec![0; (DEFAULT_BLOCK_SIZE * DEFAULT_BLOCK_COUNT) as usize],
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: DEFAULT_BLOCK_COUNT,
            inquiry: InquiryResponse::new(
                PERIPHERAL_QUALIFIER_LOADED | PERIPHERAL_TYPE_DIRECT,
                true,
                *b"GLASS   ",
                *b"RAM DISK        ",
                *b"0001",
            ),
            sense: None,
        }
    }
}

impl LogicalUnit for RamDisk {
    fn sense(&self) -> Option<RequestSenseResponse> {
        self.sense
    }

    fn set_sense(&mut self, sense: Option<RequestSenseResponse>) {
        self.sense = sense;
    }

    fn inquiry_data(&self) -> InquiryResponse {
        self.inquiry
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn on_read_capacity(&mut self) -> CommandResult<(u32, u32)> {
        Ok((self.block_count - 1, self.block_size))
    }

    fn on_read(&mut self, lba: u32, length: u16) -> CommandResult<Cow<'_, [u8]>> {
        let range = self.range(lba, length)?;
        Ok(Cow::Borrowed(&self.blocks[range]))
    }

    fn on_write(&mut self, lba: u32, length: u16, data: &[u8]) -> CommandResult<()> {
        let range = self.range(lba, length)?;
        if range.len() != data.len() {
            return Err(MassStorageError::Phase);
        }
        debug!(lba, length, "writing");
        self.blocks[range].copy_from_slice(data);
        Ok(())
    }

    fn on_verify(&mut self, lba: u32, length: u16, data: Option<&[u8]>) -> CommandResult<()> {
        let range = self.range(lba, length)?;
        match data {
            Some(data) if data != &self.blocks[range] => Err(MassStorageError::miscompare()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::ByteStruct;
    use crate::scsi::sense::{AscAscq, SenseKey};

    fn disk() -> RamDisk {
        RamDisk::new(512, 8).unwrap()
    }

    #[test]
    fn write_then_read_back() {
        let mut disk = disk();
        disk.on_write(2, 1, &[0x5a; 512]).unwrap();
        assert_eq!(&*disk.on_read(2, 1).unwrap(), &[0x5a; 512][..]);
        assert!(disk.on_read(1, 1).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn reads_borrow_the_disk() {
        let mut disk = disk();
        assert!(matches!(disk.on_read(0, 8).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let mut disk = disk();
        let err = disk.on_read(7, 2).unwrap_err();
        assert_eq!(err, MassStorageError::lba_out_of_range());
        let sense = err.sense().unwrap();
        assert_eq!(sense.sense_key(), SenseKey::IllegalRequest as u8);
        assert_eq!(sense.asc_ascq(), AscAscq::LBA_OUT_OF_RANGE);
        assert!(disk.on_write(u32::MAX, 1, &[0; 512]).is_err());
    }

    #[test]
    fn capacity_reports_last_lba() {
        assert_eq!(disk().on_read_capacity().unwrap(), (7, 512));
        assert_eq!(
            RamDisk::default().on_read_capacity().unwrap(),
            (DEFAULT_BLOCK_COUNT - 1, 512)
        );
    }

    #[test]
    fn verify_with_byte_check_compares_contents() {
        let mut disk = disk();
        disk.on_write(0, 1, &[1; 512]).unwrap();
        assert!(disk.on_verify(0, 1, Some(&[1; 512])).is_ok());
        assert_eq!(
            disk.on_verify(0, 1, Some(&[2; 512])),
            Err(MassStorageError::miscompare())
        );
        assert!(disk.on_verify(0, 8, None).is_ok());
    }

    #[test]
    fn identity_is_reported_by_inquiry() {
        let mut acme = disk().with_identity("ACME", "Widget").unwrap();
        let inquiry = acme.on_inquiry(36).unwrap();
        assert_eq!(&inquiry[8..16], b"ACME    ");
        assert_eq!(&inquiry[16..22], b"Widget");
        assert!(
            RamDisk::new(512, 1)
                .unwrap()
                .with_identity("much too long", "x")
                .is_err()
        );
    }

    #[test]
    fn short_inquiry_is_truncated() {
        let mut disk = disk();
        let inquiry = disk.on_inquiry(5).unwrap();
        assert_eq!(inquiry, &disk.inquiry_data().as_slice()[..5]);
    }

    #[test]
    fn empty_geometry_is_rejected() {
        assert!(RamDisk::new(0, 8).is_err());
        assert!(RamDisk::new(512, 0).is_err());
    }
}
