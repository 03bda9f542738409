//! Connection and congestion-control configuration.

use serde::{Deserialize, Serialize};

use crate::runtime::{Nanos, NANOS_PER_SEC};

/// Tunables for the TFRC sender and receiver halves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ccid3Config {
    /// Congestion Control Maximum Packet Size in bytes. The TFRC segment
    /// size `s`; every rate is expressed against it.
    pub ccmps: i32,
    /// Initial window in packets per RTT, clamped to 1..=4 (RFC 4342).
    pub initial_window_packets: u32,
    /// Pins the strober to a fixed packet rate and ignores rate adaptation.
    /// Test harness knob; `None` in production.
    pub fixed_rate_pps: Option<u32>,
}

impl Default for Ccid3Config {
    fn default() -> Self {
        Self {
            ccmps: 1460,
            initial_window_packets: 4,
            fixed_rate_pps: None,
        }
    }
}

impl Ccid3Config {
    /// Initial window in bytes: `min(W₀·s, max(2s, 4380))` (RFC 5348 §4.2).
    pub fn initial_window_bytes(&self) -> f64 {
        let s = self.ccmps as f64;
        let w0 = self.initial_window_packets.clamp(1, 4) as f64;
        (w0 * s).min((2.0 * s).max(4380.0))
    }
}

/// Per-connection tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnConfig {
    /// Capacity of the control-packet pipeline. Senders never block on it;
    /// overflow drops the packet with a log entry.
    pub nondata_capacity: usize,
    /// Capacity of the application-data pipeline; writers block when full.
    pub data_capacity: usize,
    /// Capacity of the inbound delivery channel read by the application.
    pub read_capacity: usize,
    /// Period of the idle loop that polls both CCIDs' `on_idle`.
    pub idle_interval: Nanos,
    /// Linger after an orderly close before the socket fully dies.
    pub timewait: Nanos,
    pub ccid3: Ccid3Config,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            nondata_capacity: 16,
            data_capacity: 16,
            read_capacity: 32,
            idle_interval: 10_000_000,  // 10ms
            timewait: 2 * NANOS_PER_SEC,
            ccid3: Ccid3Config::default(),
        }
    }
}
