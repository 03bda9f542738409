//! Congestion-control profile interface.
//!
//! A connection owns two independent half-connection controls: the sender
//! side (paces outgoing data, consumes feedback) and the receiver side
//! (observes incoming data, produces feedback). Both implement
//! [`CongestionControl`]; the connection never shares them and they never
//! reference the connection back — they communicate exclusively through
//! return values that the connection interprets.

use crate::packet::{PacketOption, PacketType};

/// CCID identifier assigned to the TFRC profile.
pub const CCID3: u8 = 3;

/// Verdict of `on_read` when a packet must not be processed further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CcidError {
    /// Discard the packet; not fatal.
    #[error("packet dropped by congestion control")]
    Drop,
    /// The connection must send a Reset and tear down.
    #[error("congestion control requested connection reset")]
    Reset,
}

/// Control-path injection requested from `on_idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// Tear the connection down with a Reset.
    CongestionReset,
    /// Inject an Ack so pending feedback can ride out.
    CongestionAck,
}

/// Half-connection congestion control.
///
/// When a control is not active (before `open`, after `close`): `on_write`
/// returns `(0, [])`, `on_read` returns `Ok`, `strobe` returns immediately
/// and `on_idle` returns `None`. `close` is idempotent and terminal.
pub trait CongestionControl: Send + Sync + 'static {
    /// CCID identifier of this profile.
    fn id(&self) -> u8;

    /// Congestion Control Maximum Packet Size.
    fn ccmps(&self) -> i32;

    /// RTT estimate in nanoseconds, negative while no sample exists.
    fn rtt(&self) -> i64;

    /// The connection has reached OPEN or PARTOPEN.
    fn open(&self);

    /// The half-connection is no longer needed.
    fn close(&self);

    /// Called before a packet is sent; returns the CCVal for the header and
    /// options to attach. Sender controls may emit only sender-to-receiver
    /// options, receiver controls only receiver-to-sender ones — the binding
    /// layer treats a violation as fatal.
    fn on_write(&self, packet_type: PacketType, x: bool, seqno: u64) -> (u8, Vec<PacketOption>);

    /// Called after an incoming packet has been accepted and validated.
    fn on_read(
        &self,
        packet_type: PacketType,
        x: bool,
        seqno: u64,
        ackno: Option<u64>,
        options: &[PacketOption],
    ) -> Result<(), CcidError>;

    /// Blocks until the rate limit permits the next emission. Meaningful for
    /// sender controls; receiver controls return immediately.
    fn strobe(&self);

    /// Periodic grace call; may request a control-path injection.
    fn on_idle(&self) -> Option<IdleAction>;
}
