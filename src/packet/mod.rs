//! Protocol packet model.
//!
//! A [`Header`] is one protocol packet: type, sequence numbers, the 4-bit
//! CCVal window counter, options and an optional payload. The wire codec
//! lives in [`wire`]; option semantics and their direction classification in
//! [`options`].

use bytes::Bytes;

pub mod options;
pub mod wire;

pub use options::{Direction, OptionKind, PacketOption};
pub use wire::WireError;

/// Largest sequence number representable in the extended (48-bit) form.
pub const SEQNO_MAX_LONG: u64 = (1 << 48) - 1;
/// Largest sequence number representable in the short (24-bit) form.
pub const SEQNO_MAX_SHORT: u64 = (1 << 24) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Request,
    Response,
    Data,
    Ack,
    DataAck,
    CloseReq,
    Close,
    Reset,
    Sync,
    SyncAck,
}

impl PacketType {
    pub fn to_wire(self) -> u8 {
        match self {
            PacketType::Request => 0,
            PacketType::Response => 1,
            PacketType::Data => 2,
            PacketType::Ack => 3,
            PacketType::DataAck => 4,
            PacketType::CloseReq => 5,
            PacketType::Close => 6,
            PacketType::Reset => 7,
            PacketType::Sync => 8,
            PacketType::SyncAck => 9,
        }
    }

    pub fn from_wire(code: u8) -> Option<Self> {
        Some(match code {
            0 => PacketType::Request,
            1 => PacketType::Response,
            2 => PacketType::Data,
            3 => PacketType::Ack,
            4 => PacketType::DataAck,
            5 => PacketType::CloseReq,
            6 => PacketType::Close,
            7 => PacketType::Reset,
            8 => PacketType::Sync,
            9 => PacketType::SyncAck,
            _ => return None,
        })
    }

    /// Data-bearing packets are the ones the congestion-control strober
    /// paces.
    pub fn is_data_bearing(self) -> bool {
        matches!(self, PacketType::Data | PacketType::DataAck)
    }

    /// Whether this type carries an acknowledgement number.
    pub fn carries_ack(self) -> bool {
        !matches!(self, PacketType::Request | PacketType::Data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    /// Extended-sequence-number flag: 48-bit seqnos when set, 24-bit
    /// otherwise.
    pub x: bool,
    /// 4-bit window counter reported by the sender CCID.
    pub ccval: u8,
    pub seqno: u64,
    pub ackno: Option<u64>,
    pub options: Vec<PacketOption>,
    pub payload: Bytes,
}

impl Header {
    /// A bare control header with no options or payload.
    pub fn control(packet_type: PacketType, seqno: u64, ackno: Option<u64>) -> Self {
        debug_assert_eq!(packet_type.carries_ack(), ackno.is_some());
        Self {
            packet_type,
            x: true,
            ccval: 0,
            seqno,
            ackno,
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// A DataAck carrying application payload.
    pub fn data_ack(seqno: u64, ackno: u64, payload: Bytes) -> Self {
        Self {
            packet_type: PacketType::DataAck,
            x: true,
            ccval: 0,
            seqno,
            ackno: Some(ackno),
            options: Vec::new(),
            payload,
        }
    }

    pub fn seqno_limit(&self) -> u64 {
        if self.x {
            SEQNO_MAX_LONG
        } else {
            SEQNO_MAX_SHORT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_wire_codes_are_stable() {
        for code in 0..=9 {
            let ty = PacketType::from_wire(code).unwrap();
            assert_eq!(ty.to_wire(), code);
        }
        assert_eq!(PacketType::from_wire(10), None);
    }

    #[test]
    fn only_data_types_are_strobed() {
        assert!(PacketType::Data.is_data_bearing());
        assert!(PacketType::DataAck.is_data_bearing());
        assert!(!PacketType::Ack.is_data_bearing());
        assert!(!PacketType::Close.is_data_bearing());
    }
}
