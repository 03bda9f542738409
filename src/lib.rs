//! Datagram Congestion Control Protocol (RFC 4340) with CCID3/TFRC
//! congestion control (RFC 4342, RFC 5348), on top of a pluggable packet
//! transport, together with a deterministic synthetic-time simulation
//! harness for protocol testing.
//!
//! The interesting machinery is the congestion-controlled send path:
//! a per-connection write pipeline with strict control-over-data priority,
//! the CCID3 sender state machine with slow-start and equation phases, and
//! a virtual-time runtime that discovers global quiescence to advance the
//! clock, so the whole stack is testable without wall-clock delays.

pub mod ccid;
pub mod ccid3;
pub mod config;
pub mod conn;
pub mod packet;
pub mod runtime;
pub mod sandbox;
pub mod transport;

pub use ccid::{CcidError, CongestionControl, IdleAction};
pub use config::{Ccid3Config, ConnConfig};
pub use conn::{Conn, ConnError, SocketState};
pub use packet::{Header, PacketOption, PacketType};
pub use runtime::{RealRuntime, Runtime, SyntheticRuntime};
pub use transport::{HeaderTransport, TransportError};
