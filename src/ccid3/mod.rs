//! CCID3: TFRC-based congestion control (RFC 4342, RFC 5348).
//!
//! The sender half paces emissions with a rate derived from slow start or
//! the TFRC throughput equation; the receiver half estimates the loss event
//! rate from sequence-number gaps and produces the feedback options the
//! sender consumes.

pub mod receiver;
pub mod sender;
pub mod tfrc;

pub use receiver::{Ccid3Receiver, Ccid3ReceiverStats};
pub use sender::{Ccid3Sender, Ccid3SenderStats, Phase};
