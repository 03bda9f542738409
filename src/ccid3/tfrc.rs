//! TFRC throughput equation (RFC 5348 §3.1).
//!
//! ```text
//!                              s
//! X_calc = ---------------------------------------------
//!          R·√(2bp/3) + t_RTO·(3·√(3bp/8))·p·(1 + 32p²)
//! ```
//!
//! with `b = 1` (no delayed-ack accounting). All rates are bytes per
//! second; `R` and `t_RTO` are seconds.

/// Maximum backoff interval: the rate never falls below one segment per
/// `t_mbi` (RFC 5348 §4.3).
pub const T_MBI_SECS: f64 = 64.0;

/// Lower bound on the retransmission-timeout term.
pub const MIN_RTO_SECS: f64 = 0.01;

/// Loss events per acknowledged packet, per RFC 5348 with b = 1.
const B: f64 = 1.0;

/// Allowed sending rate in bytes/s for segment size `s` (bytes), round-trip
/// time `rtt_secs`, loss event rate `p` in (0, 1], and timeout `rto_secs`.
pub fn x_calc(s: f64, rtt_secs: f64, p: f64, rto_secs: f64) -> f64 {
    debug_assert!(p > 0.0 && p <= 1.0, "loss event rate out of range: {p}");
    let root_term = (2.0 * B * p / 3.0).sqrt();
    let rto_term = rto_secs * (3.0 * (3.0 * B * p / 8.0).sqrt()) * p * (1.0 + 32.0 * p * p);
    s / (rtt_secs * root_term + rto_term)
}

/// The `t_RTO = 4·RTT` rule, bounded below.
pub fn rto_secs(rtt_secs: f64) -> f64 {
    (4.0 * rtt_secs).max(MIN_RTO_SECS)
}

/// Absolute rate floor: one segment per maximum backoff interval.
pub fn min_rate(s: f64) -> f64 {
    s / T_MBI_SECS
}
