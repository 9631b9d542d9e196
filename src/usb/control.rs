//! Class-specific requests on the control endpoint.
//!
//! As described by the USB Mass Storage Class - Bulk Only Transport document,
//! section 3.

/// `bRequest` of Bulk-Only Mass Storage Reset (section 3.1).
pub const BULK_ONLY_RESET: u8 = 0xff;
/// `bRequest` of Get Max LUN (section 3.2).
///
/// LUN stands for Logical Unit Number, and it's a number
/// used as a unique identifier for a storage device or logical volume.
///
/// <https://en.wikipedia.org/wiki/Logical_unit_number>
pub const GET_MAX_LUN: u8 = 0xfe;

const DIR_MASK: u8 = 0x80;
const DIR_IN: u8 = 0x80;
const DIR_OUT: u8 = 0x00;
const TYPE_MASK: u8 = 0x60;
const TYPE_CLASS: u8 = 0x20;
const RECIPIENT_MASK: u8 = 0x1f;
const RECIPIENT_INTERFACE: u8 = 0x01;

/// The 8 byte setup packet that starts every control transfer (USB 2.0, 9.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// The class requests a Bulk-Only function answers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassRequest {
    GetMaxLun,
    BulkOnlyReset,
}

impl SetupPacket {
    pub fn from_bytes(buf: [u8; 8]) -> Self {
        Self {
            request_type: buf[0],
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0; 8];
        buf[0] = self.request_type;
        buf[1] = self.request;
        buf[2..4].copy_from_slice(&self.value.to_le_bytes());
        buf[4..6].copy_from_slice(&self.index.to_le_bytes());
        buf[6..8].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// "The host shall send Get Max LUN as a class, interface, device-to-host request
    /// with a `wLength` of 1."
    pub fn get_max_lun(interface: u16) -> Self {
        Self {
            request_type: DIR_IN | TYPE_CLASS | RECIPIENT_INTERFACE,
            request: GET_MAX_LUN,
            value: 0,
            index: interface,
            length: 1,
        }
    }

    /// A class, interface, host-to-device request with no data stage.
    pub fn bulk_only_reset(interface: u16) -> Self {
        Self {
            request_type: DIR_OUT | TYPE_CLASS | RECIPIENT_INTERFACE,
            request: BULK_ONLY_RESET,
            value: 0,
            index: interface,
            length: 0,
        }
    }

    /// Identifies the Bulk-Only class request this packet carries, if any.
    pub fn class_request(&self) -> Option<ClassRequest> {
        if self.request_type & TYPE_MASK != TYPE_CLASS
            || self.request_type & RECIPIENT_MASK != RECIPIENT_INTERFACE
        {
            return None;
        }
        match (self.request_type & DIR_MASK, self.request) {
            (DIR_IN, GET_MAX_LUN) => Some(ClassRequest::GetMaxLun),
            (DIR_OUT, BULK_ONLY_RESET) => Some(ClassRequest::BulkOnlyReset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_class_requests() {
        assert_eq!(
            SetupPacket::get_max_lun(0).class_request(),
            Some(ClassRequest::GetMaxLun)
        );
        assert_eq!(
            SetupPacket::bulk_only_reset(0).class_request(),
            Some(ClassRequest::BulkOnlyReset)
        );
    }

    #[test]
    fn wrong_direction_is_not_a_class_request() {
        let mut setup = SetupPacket::get_max_lun(0);
        setup.request_type &= !DIR_IN;
        assert_eq!(setup.class_request(), None);
    }

    #[test]
    fn standard_requests_are_ignored() {
        // GET_DESCRIPTOR (device)
        let setup = SetupPacket::from_bytes([0x80, 0x06, 0x00, 0x01, 0, 0, 0x12, 0]);
        assert_eq!(setup.class_request(), None);
        assert_eq!(setup.length, 0x12);
    }

    #[test]
    fn setup_bytes_match_bot_table() {
        assert_eq!(
            SetupPacket::get_max_lun(2).to_bytes(),
            [0b1010_0001, 0xfe, 0, 0, 2, 0, 1, 0]
        );
        assert_eq!(
            SetupPacket::bulk_only_reset(0).to_bytes(),
            [0b0010_0001, 0xff, 0, 0, 0, 0, 0, 0]
        );
    }
}
