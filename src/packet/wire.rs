//! Header frame codec.
//!
//! Layout, all integers network order:
//!
//! ```text
//! [type u8][flags u8][ccval u8][seqno 6|3][ackno 6|3]?[optlen u16][options][payload]
//! ```
//!
//! flags bit 0 is the extended-sequence-number X flag (6-byte seqnos when
//! set, 3-byte otherwise); bit 1 marks the presence of an ackno. Encode
//! followed by decode is the identity for every valid header.

use byteorder::{ByteOrder, NetworkEndian};
use bytes::Bytes;

use super::{options::PacketOption, Header, PacketType};

const FLAG_X: u8 = 0b0000_0001;
const FLAG_HAS_ACKNO: u8 = 0b0000_0010;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("packet truncated")]
    Truncated,
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("unknown single-byte option {0}")]
    UnknownOption(u8),
    #[error("option {code} has bad length {len}")]
    BadOptionLength { code: u8, len: u8 },
    #[error("sequence number {seqno} does not fit the {width}-bit form")]
    SeqnoOverflow { seqno: u64, width: u8 },
    #[error("ccval {0} exceeds 4 bits")]
    CcvalOverflow(u8),
    #[error("options longer than 65535 bytes")]
    OptionsTooLong,
}

fn seqno_width(x: bool) -> usize {
    if x {
        6
    } else {
        3
    }
}

fn take<'a>(buf: &'a [u8], at: &mut usize, n: usize) -> Result<&'a [u8], WireError> {
    let slice = buf.get(*at..*at + n).ok_or(WireError::Truncated)?;
    *at += n;
    Ok(slice)
}

pub fn encode(header: &Header) -> Result<Vec<u8>, WireError> {
    let width = seqno_width(header.x);
    let limit = header.seqno_limit();
    if header.seqno > limit {
        return Err(WireError::SeqnoOverflow {
            seqno: header.seqno,
            width: (width * 8) as u8,
        });
    }
    if let Some(ackno) = header.ackno {
        if ackno > limit {
            return Err(WireError::SeqnoOverflow {
                seqno: ackno,
                width: (width * 8) as u8,
            });
        }
    }
    if header.ccval > 0xF {
        return Err(WireError::CcvalOverflow(header.ccval));
    }

    let mut opt_bytes = Vec::new();
    for opt in &header.options {
        opt.encode_into(&mut opt_bytes);
    }
    if opt_bytes.len() > u16::MAX as usize {
        return Err(WireError::OptionsTooLong);
    }

    let mut buf = Vec::with_capacity(3 + width * 2 + 2 + opt_bytes.len() + header.payload.len());
    buf.push(header.packet_type.to_wire());
    let mut flags = 0u8;
    if header.x {
        flags |= FLAG_X;
    }
    if header.ackno.is_some() {
        flags |= FLAG_HAS_ACKNO;
    }
    buf.push(flags);
    buf.push(header.ccval);

    let mut num = [0u8; 6];
    NetworkEndian::write_uint(&mut num[..width], header.seqno, width);
    buf.extend_from_slice(&num[..width]);
    if let Some(ackno) = header.ackno {
        NetworkEndian::write_uint(&mut num[..width], ackno, width);
        buf.extend_from_slice(&num[..width]);
    }

    let mut len = [0u8; 2];
    NetworkEndian::write_u16(&mut len, opt_bytes.len() as u16);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&opt_bytes);
    buf.extend_from_slice(&header.payload);
    Ok(buf)
}

pub fn decode(buf: &[u8]) -> Result<Header, WireError> {
    if buf.len() < 3 {
        return Err(WireError::Truncated);
    }
    let packet_type =
        PacketType::from_wire(buf[0]).ok_or(WireError::UnknownPacketType(buf[0]))?;
    let flags = buf[1];
    let ccval = buf[2];
    if ccval > 0xF {
        return Err(WireError::CcvalOverflow(ccval));
    }
    let x = flags & FLAG_X != 0;
    let width = seqno_width(x);

    let mut at = 3;
    let seqno = NetworkEndian::read_uint(take(buf, &mut at, width)?, width);
    let ackno = if flags & FLAG_HAS_ACKNO != 0 {
        Some(NetworkEndian::read_uint(take(buf, &mut at, width)?, width))
    } else {
        None
    };

    let opt_len = NetworkEndian::read_u16(take(buf, &mut at, 2)?) as usize;
    let opt_bytes = take(buf, &mut at, opt_len)?;
    let mut options = Vec::new();
    let mut opt_at = 0;
    while opt_at < opt_bytes.len() {
        let (opt, consumed) = PacketOption::decode(&opt_bytes[opt_at..])?;
        if let Some(opt) = opt {
            options.push(opt);
        }
        opt_at += consumed;
    }

    Ok(Header {
        packet_type,
        x,
        ccval,
        seqno,
        ackno,
        options,
        payload: Bytes::copy_from_slice(&buf[at..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(header: &Header) {
        let encoded = encode(header).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded, header);
    }

    #[test]
    fn data_ack_with_options_roundtrips() {
        roundtrip(&Header {
            packet_type: PacketType::DataAck,
            x: true,
            ccval: 9,
            seqno: 0x1234_5678_9a,
            ackno: Some(42),
            options: vec![
                PacketOption::loss_event_rate(0.125),
                PacketOption::receive_rate(40_000),
                PacketOption::elapsed_time(17),
            ],
            payload: Bytes::from_static(b"hello"),
        });
    }

    #[test]
    fn short_form_roundtrips() {
        roundtrip(&Header {
            packet_type: PacketType::Data,
            x: false,
            ccval: 15,
            seqno: 0xFF_FFFF,
            ackno: None,
            options: vec![PacketOption::padding()],
            payload: Bytes::new(),
        });
    }

    #[test]
    fn control_packets_roundtrip() {
        for ty in [
            PacketType::Request,
            PacketType::Response,
            PacketType::Ack,
            PacketType::Close,
            PacketType::Reset,
            PacketType::Sync,
            PacketType::SyncAck,
        ] {
            roundtrip(&Header {
                packet_type: ty,
                x: true,
                ccval: 0,
                seqno: 7,
                ackno: ty.carries_ack().then_some(3),
                options: Vec::new(),
                payload: Bytes::new(),
            });
        }
    }

    #[test]
    fn seqno_overflow_is_rejected() {
        let mut header = Header::control(PacketType::Ack, 1, Some(1));
        header.x = false;
        header.seqno = 1 << 24;
        assert!(matches!(
            encode(&header),
            Err(WireError::SeqnoOverflow { .. })
        ));
    }

    #[test]
    fn truncated_packets_are_rejected() {
        let header = Header::data_ack(100, 50, Bytes::from_static(b"xyz"));
        let encoded = encode(&header).unwrap();
        // Cutting anywhere inside the fixed part must fail cleanly. (The
        // payload is length-delimited by the datagram, so cuts there just
        // shorten it.)
        for cut in 0..15 {
            assert!(decode(&encoded[..cut]).is_err(), "cut at {cut} decoded");
        }
    }

    #[test]
    fn unknown_packet_type_is_rejected() {
        let header = Header::control(PacketType::Ack, 1, Some(1));
        let mut encoded = encode(&header).unwrap();
        encoded[0] = 99;
        assert!(matches!(
            decode(&encoded),
            Err(WireError::UnknownPacketType(99))
        ));
    }

    mod property_tests {
        use super::*;
        use arbitrary::{Arbitrary, Unstructured};

        fn arbitrary_header(u: &mut Unstructured) -> arbitrary::Result<Header> {
            let packet_type = *u.choose(&[
                PacketType::Request,
                PacketType::Response,
                PacketType::Data,
                PacketType::Ack,
                PacketType::DataAck,
                PacketType::Close,
                PacketType::Reset,
            ])?;
            let x = bool::arbitrary(u)?;
            let limit = if x { (1u64 << 48) - 1 } else { (1u64 << 24) - 1 };
            let options = (0..u.int_in_range(0..=4)?)
                .map(|_| {
                    Ok(match u.int_in_range(0..=3)? {
                        0 => PacketOption::loss_event_rate(0.5),
                        1 => PacketOption::receive_rate(u32::arbitrary(u)?),
                        2 => PacketOption::elapsed_time(u.int_in_range(0..=100_000)?),
                        _ => PacketOption::request_loss_intervals(),
                    })
                })
                .collect::<arbitrary::Result<Vec<_>>>()?;
            Ok(Header {
                packet_type,
                x,
                ccval: u.int_in_range(0..=15)?,
                seqno: u64::arbitrary(u)? & limit,
                ackno: if packet_type.carries_ack() {
                    Some(u64::arbitrary(u)? & limit)
                } else {
                    None
                },
                options,
                payload: Bytes::from(Vec::<u8>::arbitrary(u)?),
            })
        }

        #[test]
        fn property_encode_decode_identity() {
            let mut seed = 0x9e37_79b9_u64;
            for _ in 0..200 {
                // Cheap deterministic byte soup; no RNG state to carry.
                let bytes: Vec<u8> = (0..512)
                    .map(|i| {
                        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(i);
                        (seed >> 33) as u8
                    })
                    .collect();
                let mut u = Unstructured::new(&bytes);
                if let Ok(header) = arbitrary_header(&mut u) {
                    roundtrip(&header);
                }
            }
        }
    }
}
