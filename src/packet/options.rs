//! Header options and their direction classification.
//!
//! Wire format per RFC 4340 §5.8: a one-byte type; types ≥ 32 carry a length
//! byte covering type + length + data. Multi-byte integers are network
//! order. Direction is not encoded — it is a property of each type that both
//! peers know, and the congestion-control binding enforces it on egress.

use byteorder::{ByteOrder, NetworkEndian};

use super::wire::WireError;

/// Who is allowed to emit an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Produced by the sender congestion control (data direction).
    SenderToReceiver,
    /// Produced by the receiver congestion control (feedback direction).
    ReceiverToSender,
    /// Legal from either side.
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKind {
    Padding,
    /// Time the ack spent at the receiver, in tens of microseconds.
    ElapsedTime,
    /// Sender asks the receiver to report its loss-interval history.
    RequestLossIntervals,
    /// Receiver-reported loss event rate, encoded as the rounded inverse.
    LossEventRate,
    /// Receiver-reported loss interval lengths, most recent first.
    LossIntervals,
    /// Receiver-reported receive rate in bytes per second.
    ReceiveRate,
}

impl OptionKind {
    pub fn code(self) -> u8 {
        match self {
            OptionKind::Padding => 0,
            OptionKind::ElapsedTime => 43,
            OptionKind::RequestLossIntervals => 160,
            OptionKind::LossEventRate => 192,
            OptionKind::LossIntervals => 193,
            OptionKind::ReceiveRate => 194,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => OptionKind::Padding,
            43 => OptionKind::ElapsedTime,
            160 => OptionKind::RequestLossIntervals,
            192 => OptionKind::LossEventRate,
            193 => OptionKind::LossIntervals,
            194 => OptionKind::ReceiveRate,
            _ => return None,
        })
    }

    pub fn direction(self) -> Direction {
        match self {
            OptionKind::Padding => Direction::Either,
            OptionKind::RequestLossIntervals => Direction::SenderToReceiver,
            OptionKind::ElapsedTime
            | OptionKind::LossEventRate
            | OptionKind::LossIntervals
            | OptionKind::ReceiveRate => Direction::ReceiverToSender,
        }
    }

    /// Types below 32 are a single byte on the wire, with no length or data.
    pub fn is_single_byte(self) -> bool {
        self.code() < 32
    }

    /// Feedback options describe an acknowledged stream and are not legal on
    /// pure Data packets (which carry no ack).
    pub fn legal_on_data(self) -> bool {
        !matches!(
            self,
            OptionKind::ElapsedTime
                | OptionKind::LossEventRate
                | OptionKind::LossIntervals
                | OptionKind::ReceiveRate
        )
    }
}

/// A tag plus opaque payload carried in a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOption {
    pub kind: OptionKind,
    pub data: Vec<u8>,
}

impl PacketOption {
    pub fn padding() -> Self {
        Self {
            kind: OptionKind::Padding,
            data: Vec::new(),
        }
    }

    pub fn request_loss_intervals() -> Self {
        Self {
            kind: OptionKind::RequestLossIntervals,
            data: Vec::new(),
        }
    }

    /// Loss event rate, carried as the rounded inverse of `p`. Zero encodes
    /// "no loss observed yet".
    pub fn loss_event_rate(p: f64) -> Self {
        let inverse = if p > 0.0 {
            (1.0 / p).round().clamp(1.0, u32::MAX as f64) as u32
        } else {
            0
        };
        let mut data = vec![0u8; 4];
        NetworkEndian::write_u32(&mut data, inverse);
        Self {
            kind: OptionKind::LossEventRate,
            data,
        }
    }

    pub fn receive_rate(bytes_per_sec: u32) -> Self {
        let mut data = vec![0u8; 4];
        NetworkEndian::write_u32(&mut data, bytes_per_sec);
        Self {
            kind: OptionKind::ReceiveRate,
            data,
        }
    }

    /// Elapsed time in tens of microseconds; two bytes when it fits, four
    /// otherwise (RFC 4340 §13.2).
    pub fn elapsed_time(tens_of_micros: u32) -> Self {
        let data = if tens_of_micros <= u16::MAX as u32 {
            let mut d = vec![0u8; 2];
            NetworkEndian::write_u16(&mut d, tens_of_micros as u16);
            d
        } else {
            let mut d = vec![0u8; 4];
            NetworkEndian::write_u32(&mut d, tens_of_micros);
            d
        };
        Self {
            kind: OptionKind::ElapsedTime,
            data,
        }
    }

    /// Loss interval lengths in packets, most recent first.
    pub fn loss_intervals(lengths: &[u32]) -> Self {
        let mut data = Vec::with_capacity(lengths.len() * 4);
        for &len in lengths {
            let mut d = [0u8; 4];
            NetworkEndian::write_u32(&mut d, len);
            data.extend_from_slice(&d);
        }
        Self {
            kind: OptionKind::LossIntervals,
            data,
        }
    }

    pub fn as_loss_event_rate(&self) -> Option<f64> {
        if self.kind != OptionKind::LossEventRate || self.data.len() != 4 {
            return None;
        }
        let inverse = NetworkEndian::read_u32(&self.data);
        Some(if inverse == 0 { 0.0 } else { 1.0 / inverse as f64 })
    }

    pub fn as_receive_rate(&self) -> Option<u32> {
        if self.kind != OptionKind::ReceiveRate || self.data.len() != 4 {
            return None;
        }
        Some(NetworkEndian::read_u32(&self.data))
    }

    pub fn as_elapsed_tens_of_micros(&self) -> Option<u32> {
        if self.kind != OptionKind::ElapsedTime {
            return None;
        }
        match self.data.len() {
            2 => Some(NetworkEndian::read_u16(&self.data) as u32),
            4 => Some(NetworkEndian::read_u32(&self.data)),
            _ => None,
        }
    }

    /// Appends the wire form to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind.code());
        if self.kind.is_single_byte() {
            debug_assert!(self.data.is_empty(), "single-byte option with data");
            return;
        }
        let total = self
            .data
            .len()
            .checked_add(2)
            .filter(|&t| t <= u8::MAX as usize)
            .expect("option data too long for one-byte length");
        buf.push(total as u8);
        buf.extend_from_slice(&self.data);
    }

    /// Decodes one option from the front of `buf`, returning it with the
    /// number of bytes consumed. Unknown long-form options are skipped and
    /// reported as `Ok(None)`.
    pub fn decode(buf: &[u8]) -> Result<(Option<Self>, usize), WireError> {
        let &code = buf.first().ok_or(WireError::Truncated)?;
        if code < 32 {
            let kind = OptionKind::from_code(code).ok_or(WireError::UnknownOption(code))?;
            return Ok((
                Some(Self {
                    kind,
                    data: Vec::new(),
                }),
                1,
            ));
        }
        let &len = buf.get(1).ok_or(WireError::Truncated)?;
        if len < 2 || buf.len() < len as usize {
            return Err(WireError::BadOptionLength { code, len });
        }
        let data = buf[2..len as usize].to_vec();
        let consumed = len as usize;
        match OptionKind::from_code(code) {
            Some(kind) => Ok((Some(Self { kind, data }), consumed)),
            None => {
                tracing::debug!(code, len, "skipping unknown option");
                Ok((None, consumed))
            }
        }
    }
}

/// True when every option is legal for a producer of the given direction.
pub fn permitted_for(options: &[PacketOption], producer: Direction) -> bool {
    options.iter().all(|opt| {
        matches!(opt.kind.direction(), Direction::Either) || opt.kind.direction() == producer
    })
}
