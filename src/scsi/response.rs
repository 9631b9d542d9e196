//! Representations for responses to SCSI commands.

use color_eyre::eyre::ensure;

use super::ByteStruct;
use super::sense::{AscAscq, SenseKey};

/// Pads with zeros or truncates `data` to the host's `ALLOCATION LENGTH`.
///
/// Count fields inside `data` are left alone, as SPC-2 4.3.4.6 requires.
pub fn fit_allocation(data: &[u8], allocation_length: usize) -> Vec<u8> {
    let mut out = data[..data.len().min(allocation_length)].to_vec();
    out.resize(allocation_length, 0);
    out
}

const ERROR_CODE_MASK: u8 = 0x7f;
const SENSE_KEY_MASK: u8 = 0x0f;

/// Response code for fixed format sense data about the current command.
pub const ERROR_CODE_CURRENT: u8 = 0x70;
/// Response code for fixed format sense data about a deferred error.
pub const ERROR_CODE_DEFERRED: u8 = 0x71;

/// The first 8 bytes of fixed format sense data, SPC-2 7.20.2 table 106.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestSenseHeader {
    /// `VALID` (bit 7) and `RESPONSE CODE` (bits 6:0).
    pub field_0: u8,
    _obsolete: u8,
    /// `FILEMARK`, `EOM`, `ILI` (bits 7:5) and `SENSE KEY` (bits 3:0).
    pub field_2: u8,
    pub information: [u8; 4],
    /// Number of bytes following this header.
    pub additional_sense_length: u8,
}

/// The remainder of fixed format sense data.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestSenseExt {
    pub command_specific_information: [u8; 4],
    /// `ADDITIONAL SENSE CODE` followed by `ADDITIONAL SENSE CODE QUALIFIER`.
    pub asc_ascq: [u8; 2],
    pub field_replaceable_unit_code: u8,
    pub sense_key_specific: [u8; 3],
}

/// Fixed format sense data, as returned by REQUEST SENSE.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestSenseResponse {
    pub header: RequestSenseHeader,
    pub ext: RequestSenseExt,
}

impl RequestSenseResponse {
    /// Minimal current-error sense with every other field zeroed.
    pub fn simple(sense_key: SenseKey, asc_ascq: AscAscq) -> Self {
        let mut result = Self::default();
        result.header.additional_sense_length = std::mem::size_of::<RequestSenseExt>() as u8;
        result.set_error_code(ERROR_CODE_CURRENT);
        result.set_sense_key(sense_key as u8);
        result.ext.asc_ascq = asc_ascq.0.to_be_bytes();
        result
    }

    pub fn error_code(&self) -> u8 {
        self.header.field_0 & ERROR_CODE_MASK
    }

    pub fn set_error_code(&mut self, code: u8) {
        self.header.field_0 = (self.header.field_0 & !ERROR_CODE_MASK) | (code & ERROR_CODE_MASK);
    }

    pub fn sense_key(&self) -> u8 {
        self.header.field_2 & SENSE_KEY_MASK
    }

    pub fn set_sense_key(&mut self, key: u8) {
        self.header.field_2 = (self.header.field_2 & !SENSE_KEY_MASK) | (key & SENSE_KEY_MASK);
    }

    pub fn asc_ascq(&self) -> AscAscq {
        AscAscq(u16::from_be_bytes(self.ext.asc_ascq))
    }
}

pub const PERIPHERAL_QUALIFIER_LOADED: u8 = 0 << 5;
pub const PERIPHERAL_QUALIFIER_UNLOADED: u8 = 1 << 5;
pub const PERIPHERAL_QUALIFIER_UNKNOWN: u8 = 3 << 5;
pub const PERIPHERAL_TYPE_DIRECT: u8 = 0x00;

const INQUIRY_RMB: u8 = 0x80;
const INQUIRY_VERSION_SPC2: u8 = 0x04;
const INQUIRY_FORMAT_SPC2: u8 = 0x02;

/// SPC-2 7.3.2 table 46, bytes 0 to 4.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InquiryHeader {
    /// Contains both the PERIPHERAL QUALIFIER (bits 7:5) and PERIPHERAL DEVICE TYPE (bits 4:0)
    /// fields.
    ///
    /// A USB flash drive is a direct access device (type 0h0) that is currently
    /// connected (qualifier 0b000).
    pub peripheral_type: u8,
    /// `RMB` (bit 7): the medium is removable.
    pub field_1: u8,
    pub version: u8,
    /// `AERC`, `NORMACA`, `HISUP` and the response data format (bits 3:0).
    pub field_3: u8,
    /// Number of bytes following this header.
    pub additional_length: u8,
}

/// SPC-2 7.3.2 table 46, bytes 5 to 35.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InquiryFeatures {
    /// `SCCS` (bit 7).
    pub field_0: u8,
    /// `BQUE`, `ENCSERV`, `MULTIP`, `MCHNGR`, ... across bytes 6 and 7.
    pub flags: [u8; 2],
    pub vendor_id: [u8; 8],
    pub product_id: [u8; 16],
    pub product_revision: [u8; 4],
}

/// Standard INQUIRY data. "The standard INQUIRY data shall contain at least 36 bytes"
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InquiryResponse {
    pub header: InquiryHeader,
    pub features: InquiryFeatures,
}

impl InquiryResponse {
    pub fn new(
        peripheral_type: u8,
        is_removable: bool,
        vendor_id: [u8; 8],
        product_id: [u8; 16],
        product_revision: [u8; 4],
    ) -> Self {
        Self {
            header: InquiryHeader {
                peripheral_type,
                field_1: if is_removable { INQUIRY_RMB } else { 0 },
                version: INQUIRY_VERSION_SPC2,
                field_3: INQUIRY_FORMAT_SPC2,
                additional_length: std::mem::size_of::<InquiryFeatures>() as u8,
            },
            features: InquiryFeatures {
                vendor_id,
                product_id,
                product_revision,
                ..Default::default()
            },
        }
    }

    /// Builds inquiry data from identity strings, space-padding each field.
    pub fn simple(
        peripheral_type: u8,
        is_removable: bool,
        vendor: &[u8],
        product: &[u8],
        revision: &[u8],
    ) -> color_eyre::Result<Self> {
        Ok(Self::new(
            peripheral_type,
            is_removable,
            space_padded("vendor", vendor)?,
            space_padded("product", product)?,
            space_padded("revision", revision)?,
        ))
    }

    pub fn is_removable(&self) -> bool {
        self.header.field_1 & INQUIRY_RMB != 0
    }
}

fn space_padded<const N: usize>(what: &str, value: &[u8]) -> color_eyre::Result<[u8; N]> {
    ensure!(
        value.len() <= N,
        "{what} string too large, {} bytes where {N} fit",
        value.len()
    );
    let mut field = [b' '; N];
    field[..value.len()].copy_from_slice(value);
    Ok(field)
}

/// Mode parameter header for MODE SENSE (6), SPC-2 8.3.3 table 146.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModeSense6Header {
    /// Bytes following this field.
    pub mode_data_length: u8,
    pub medium_type: u8,
    /// Bit 7 is `WP` (write protected).
    pub device_specific_params: u8,
    pub block_descriptor_length: u8,
}

impl ModeSense6Header {
    /// A header with no block descriptors and no mode pages.
    pub fn empty() -> Self {
        Self {
            mode_data_length: (std::mem::size_of::<Self>() - 1) as u8,
            ..Default::default()
        }
    }
}

/// Mode parameter header for MODE SENSE (10), SPC-2 8.3.3 table 147.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModeSense10Header {
    pub mode_data_length: [u8; 2],
    pub medium_type: u8,
    pub device_specific_params: u8,
    /// Bit 0 is `LONGLBA`.
    pub flags: u8,
    _reserved: u8,
    pub block_descriptor_length: [u8; 2],
}

impl ModeSense10Header {
    /// A header with no block descriptors and no mode pages.
    pub fn empty() -> Self {
        Self {
            mode_data_length: ((std::mem::size_of::<Self>() - 2) as u16).to_be_bytes(),
            ..Default::default()
        }
    }
}

/// READ CAPACITY (10) parameter data, SBC-2 5.1.10 table 28.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadCapacity10Response {
    /// Address of the last logical block, not the block count.
    pub returned_lba: [u8; 4],
    pub block_length: [u8; 4],
}

impl ReadCapacity10Response {
    pub fn new(last_lba: u32, block_length: u32) -> Self {
        Self {
            returned_lba: last_lba.to_be_bytes(),
            block_length: block_length.to_be_bytes(),
        }
    }

    pub fn last_lba(&self) -> u32 {
        u32::from_be_bytes(self.returned_lba)
    }

    pub fn block_length(&self) -> u32 {
        u32::from_be_bytes(self.block_length)
    }
}

// SAFETY: all of the below are `#[repr(C, packed)]` and made only of bytes or
// other `ByteStruct`s
unsafe impl ByteStruct for RequestSenseHeader {}
unsafe impl ByteStruct for RequestSenseExt {}
unsafe impl ByteStruct for RequestSenseResponse {}
unsafe impl ByteStruct for InquiryHeader {}
unsafe impl ByteStruct for InquiryFeatures {}
unsafe impl ByteStruct for InquiryResponse {}
unsafe impl ByteStruct for ModeSense6Header {}
unsafe impl ByteStruct for ModeSense10Header {}
unsafe impl ByteStruct for ReadCapacity10Response {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_sense_zeroes_reserved_fields() {
        let sense = RequestSenseResponse::simple(SenseKey::IllegalRequest, AscAscq::NONE);
        let bytes = sense.as_slice();
        assert_eq!(bytes.len(), 18);
        assert_eq!(sense.sense_key(), 0x05);
        assert_eq!(sense.error_code(), ERROR_CODE_CURRENT);
        assert_eq!(
            bytes,
            &[0x70, 0, 0x05, 0, 0, 0, 0, 10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn sense_asc_ascq_is_big_endian() {
        let sense =
            RequestSenseResponse::simple(SenseKey::IllegalRequest, AscAscq::LBA_OUT_OF_RANGE);
        assert_eq!(&sense.as_slice()[12..14], &[0x21, 0x00]);
        assert_eq!(sense.asc_ascq(), AscAscq::LBA_OUT_OF_RANGE);
    }

    #[test]
    fn sense_key_setter_keeps_other_bits() {
        let mut sense = RequestSenseResponse::default();
        sense.header.field_2 = 0xe0;
        sense.set_sense_key(SenseKey::Miscompare as u8);
        assert_eq!(sense.header.field_2, 0xee);
        assert_eq!(sense.sense_key(), 0x0e);
    }

    #[test]
    fn inquiry_is_36_bytes_and_space_padded() {
        let inquiry = InquiryResponse::simple(
            PERIPHERAL_QUALIFIER_LOADED | PERIPHERAL_TYPE_DIRECT,
            true,
            b"GLASS",
            b"USBMS",
            b"0000",
        )
        .unwrap();
        let bytes = inquiry.as_slice();
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[..5], &[0x00, 0x80, 0x04, 0x02, 31]);
        assert_eq!(&bytes[8..16], b"GLASS   ");
        assert_eq!(&bytes[16..32], b"USBMS           ");
        assert_eq!(&bytes[32..36], b"0000");
        assert!(inquiry.is_removable());
    }

    #[test]
    fn inquiry_rejects_oversized_identity() {
        let err = InquiryResponse::simple(0, false, b"TOO LONG VENDOR", b"", b"")
            .expect_err("vendor only has 8 bytes");
        assert!(err.to_string().contains("vendor"));
    }

    #[test]
    fn mode_sense_headers_describe_themselves() {
        assert_eq!(ModeSense6Header::empty().as_slice(), &[3, 0, 0, 0]);
        assert_eq!(ModeSense10Header::empty().as_slice(), &[0, 6, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn read_capacity_layout() {
        let response = ReadCapacity10Response::new(0x7fff, 512);
        assert_eq!(response.as_slice(), &[0, 0, 0x7f, 0xff, 0, 0, 2, 0]);
        let parsed = ReadCapacity10Response::from_slice(response.as_slice()).unwrap();
        assert_eq!(parsed.last_lba(), 0x7fff);
        assert_eq!(parsed.block_length(), 512);
    }

    #[test]
    fn fit_allocation_pads_and_truncates() {
        assert_eq!(fit_allocation(&[1, 2, 3], 5), vec![1, 2, 3, 0, 0]);
        assert_eq!(fit_allocation(&[1, 2, 3], 2), vec![1, 2]);
        assert!(fit_allocation(&[1, 2, 3], 0).is_empty());
    }
}
