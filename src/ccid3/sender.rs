//! TFRC sender half-connection.
//!
//! The sender starts in a slow-start phase, roughly doubling its allowed
//! sending rate each round-trip time. The first receiver report of a
//! non-zero loss event rate ends slow start, after which the allowed rate
//! follows the TFRC throughput equation. The strober turns the allowed rate
//! into a pacing barrier: one emission per `s/X` interval, no catch-up
//! bursts after idle periods.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ccid::{CcidError, CongestionControl, IdleAction, CCID3};
use crate::config::Ccid3Config;
use crate::packet::{OptionKind, PacketOption, PacketType};
use crate::runtime::{Nanos, Runtime, NANOS_PER_SEC};

use super::tfrc;

/// EWMA gain for RTT samples (RFC 5348 §4.3).
const RTT_GAIN: f64 = 0.1;

/// One packet per this interval while no RTT sample exists.
const NO_RTT_SEND_INTERVAL: Nanos = NANOS_PER_SEC;

/// The window counter advances at most this many quarter-RTTs per packet
/// (RFC 4342 §8.1).
const WINDOW_COUNTER_MAX_ADVANCE: i64 = 5;

/// Idle gaps longer than this many inter-packet intervals reset the strober
/// instead of releasing a burst.
const IDLE_BURST_GUARD: i64 = 4;

/// Upper bound on a single strobe sleep, so `close` is observed promptly.
const STROBE_SLICE: Nanos = 100_000_000; // 100ms

/// Send-time records kept for RTT sampling.
const SENT_HISTORY: usize = 512;

/// A loss-interval report is requested after this many data packets in the
/// equation phase.
const LOSS_INTERVAL_REQUEST_PERIOD: u32 = 32;

/// Feedback silence after which the connection is asked to reset.
const SILENCE_RESET_AFTER: Nanos = 64 * NANOS_PER_SEC;

/// `last_emit` sentinel: far enough in the past that the first strobe never
/// waits, without risking overflow when an interval is added.
const NEVER_EMITTED: Nanos = i64::MIN / 4;

/// Sender phase. CLOSED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    SlowStart,
    Equation,
    Closed,
}

impl Phase {
    fn is_active(self) -> bool {
        matches!(self, Phase::SlowStart | Phase::Equation)
    }
}

struct WindowCounter {
    value: u8,
    last_increment: Nanos,
}

struct SentRecord {
    seqno: u64,
    at: Nanos,
}

struct SenderState {
    phase: Phase,
    /// RTT estimate in nanoseconds; negative until the first sample.
    rtt: Nanos,
    /// Allowed sending rate, bytes per second.
    x_bps: f64,
    /// Receive rate last reported by the peer; 0 when none yet.
    x_recv_bps: f64,
    /// Loss event rate last reported by the peer.
    p: f64,
    /// Time of the last slow-start doubling; negative until the first.
    time_last_doubled: Nanos,
    /// Time of the last feedback packet (or of `open`).
    last_feedback: Nanos,
    /// No-feedback timer deadline; negative while disarmed.
    nofeedback_deadline: Nanos,
    /// Whether any data-bearing packet has been sent since `open`.
    data_sent: bool,
    window: WindowCounter,
    /// Instant the strober last released an emission; [`NEVER_EMITTED`]
    /// before the first. The next permitted instant is derived from this
    /// plus the current inter-packet interval, so rate changes take effect
    /// immediately.
    last_emit: Nanos,
    sent: VecDeque<SentRecord>,
    data_since_interval_request: u32,
}

/// Point-in-time view of the sender for tests and telemetry.
#[derive(Debug, Clone)]
pub struct Ccid3SenderStats {
    pub phase: Phase,
    pub rtt: Nanos,
    pub loss_event_rate: f64,
    pub allowed_rate_bps: f64,
    pub window_counter: u8,
}

pub struct Ccid3Sender {
    rt: Arc<dyn Runtime>,
    config: Ccid3Config,
    state: Mutex<SenderState>,
}

impl Ccid3Sender {
    pub fn new(rt: Arc<dyn Runtime>, config: Ccid3Config) -> Self {
        Self {
            rt,
            config,
            state: Mutex::new(SenderState {
                phase: Phase::Init,
                rtt: -1,
                x_bps: 0.0,
                x_recv_bps: 0.0,
                p: 0.0,
                time_last_doubled: -1,
                last_feedback: -1,
                nofeedback_deadline: -1,
                data_sent: false,
                window: WindowCounter {
                    value: 0,
                    last_increment: 0,
                },
                last_emit: NEVER_EMITTED,
                sent: VecDeque::new(),
                data_since_interval_request: 0,
            }),
        }
    }

    pub fn stats(&self) -> Ccid3SenderStats {
        let st = self.state.lock();
        Ccid3SenderStats {
            phase: st.phase,
            rtt: st.rtt,
            loss_event_rate: st.p,
            allowed_rate_bps: st.x_bps,
            window_counter: st.window.value,
        }
    }

    fn segment_size(&self) -> f64 {
        self.config.ccmps as f64
    }

    /// Nanoseconds between permitted emissions at the current rate.
    fn packet_interval(&self, st: &SenderState) -> Nanos {
        if let Some(pps) = self.config.fixed_rate_pps {
            return NANOS_PER_SEC / pps.max(1) as i64;
        }
        if st.rtt < 0 && st.phase == Phase::SlowStart && !st.data_sent {
            return NO_RTT_SEND_INTERVAL;
        }
        let s = self.segment_size();
        let rate = st.x_bps.max(tfrc::min_rate(s));
        let interval = (s / rate * NANOS_PER_SEC as f64) as Nanos;
        interval.clamp(0, (tfrc::T_MBI_SECS * NANOS_PER_SEC as f64) as Nanos)
    }
}

impl SenderState {
    fn update_rtt(&mut self, sample: Nanos) {
        if self.rtt < 0 {
            self.rtt = sample;
        } else {
            self.rtt =
                ((1.0 - RTT_GAIN) * self.rtt as f64 + RTT_GAIN * sample as f64) as Nanos;
        }
    }

    fn rtt_secs_or(&self, fallback: f64) -> f64 {
        if self.rtt > 0 {
            self.rtt as f64 / NANOS_PER_SEC as f64
        } else {
            fallback
        }
    }

    /// Looks up and removes the send time of `ackno`. Older records are
    /// discarded along the way; seqnos are monotone so they can never be
    /// acked later.
    fn take_send_time(&mut self, ackno: u64) -> Option<Nanos> {
        while let Some(front) = self.sent.front() {
            if front.seqno < ackno {
                self.sent.pop_front();
            } else if front.seqno == ackno {
                let at = front.at;
                self.sent.pop_front();
                return Some(at);
            } else {
                return None;
            }
        }
        None
    }

    /// `X = max(min(X_calc, 2·X_recv), s/t_mbi)` (RFC 5348 §4.3).
    fn recompute_equation_rate(&mut self, s: f64) {
        let rtt_secs = self.rtt_secs_or(1.0);
        let p = self.p.clamp(1.0 / u32::MAX as f64, 1.0);
        let mut x = tfrc::x_calc(s, rtt_secs, p, tfrc::rto_secs(rtt_secs));
        if self.x_recv_bps > 0.0 {
            x = x.min(2.0 * self.x_recv_bps);
        }
        self.x_bps = x.max(tfrc::min_rate(s));
    }

    fn arm_nofeedback(&mut self, now: Nanos, s: f64) {
        let rtt_secs = self.rtt_secs_or(1.0);
        let by_rtt = 4.0 * rtt_secs;
        let by_rate = 2.0 * s / self.x_bps.max(tfrc::min_rate(s));
        self.nofeedback_deadline = now + (by_rtt.max(by_rate) * NANOS_PER_SEC as f64) as Nanos;
    }
}

impl CongestionControl for Ccid3Sender {
    fn id(&self) -> u8 {
        CCID3
    }

    fn ccmps(&self) -> i32 {
        self.config.ccmps
    }

    fn rtt(&self) -> i64 {
        self.state.lock().rtt
    }

    fn open(&self) {
        let mut st = self.state.lock();
        if st.phase != Phase::Init {
            return;
        }
        let now = self.rt.now();
        st.phase = Phase::SlowStart;
        // One packet per second until the first RTT sample (RFC 5348 §4.2).
        st.x_bps = self.segment_size();
        st.window.last_increment = now;
        st.last_emit = NEVER_EMITTED;
        st.last_feedback = now;
        tracing::debug!("ccid3 sender open, entering slow start");
    }

    fn close(&self) {
        let mut st = self.state.lock();
        if st.phase != Phase::Closed {
            tracing::debug!(phase = ?st.phase, "ccid3 sender closed");
            st.phase = Phase::Closed;
        }
    }

    fn on_write(&self, packet_type: PacketType, _x: bool, seqno: u64) -> (u8, Vec<PacketOption>) {
        let mut st = self.state.lock();
        if !st.phase.is_active() {
            return (0, Vec::new());
        }
        let now = self.rt.now();

        // Advance the window counter one step per elapsed quarter-RTT,
        // capped per packet; a long pause re-anchors instead of spinning
        // the counter through many wraps.
        if st.rtt > 0 {
            let quarter = (st.rtt / 4).max(1);
            let steps = (now - st.window.last_increment) / quarter;
            if steps > WINDOW_COUNTER_MAX_ADVANCE {
                st.window.value =
                    ((st.window.value as i64 + WINDOW_COUNTER_MAX_ADVANCE) % 16) as u8;
                st.window.last_increment = now;
            } else if steps > 0 {
                st.window.value = ((st.window.value as i64 + steps) % 16) as u8;
                st.window.last_increment += steps * quarter;
            }
        }

        st.sent.push_back(SentRecord { seqno, at: now });
        if st.sent.len() > SENT_HISTORY {
            st.sent.pop_front();
        }

        let mut options = Vec::new();
        if packet_type.is_data_bearing() {
            st.data_sent = true;
            if st.phase == Phase::Equation {
                st.data_since_interval_request += 1;
                if st.data_since_interval_request >= LOSS_INTERVAL_REQUEST_PERIOD {
                    st.data_since_interval_request = 0;
                    options.push(PacketOption::request_loss_intervals());
                }
            }
        }
        (st.window.value, options)
    }

    fn on_read(
        &self,
        packet_type: PacketType,
        _x: bool,
        _seqno: u64,
        ackno: Option<u64>,
        options: &[PacketOption],
    ) -> Result<(), CcidError> {
        let mut st = self.state.lock();
        if !st.phase.is_active() || !packet_type.carries_ack() {
            return Ok(());
        }
        let now = self.rt.now();
        let s = self.segment_size();

        let mut reported_p = None;
        let mut elapsed: Nanos = 0;
        for opt in options {
            match opt.kind {
                OptionKind::LossEventRate => {
                    reported_p = Some(opt.as_loss_event_rate().ok_or(CcidError::Drop)?);
                }
                OptionKind::ReceiveRate => {
                    let rate = opt.as_receive_rate().ok_or(CcidError::Drop)?;
                    st.x_recv_bps = rate as f64;
                }
                OptionKind::ElapsedTime => {
                    let tens = opt.as_elapsed_tens_of_micros().ok_or(CcidError::Drop)?;
                    elapsed = tens as Nanos * 10_000;
                }
                _ => {}
            }
        }

        if let Some(ackno) = ackno {
            if let Some(sent_at) = st.take_send_time(ackno) {
                let sample = now - sent_at - elapsed;
                if sample > 0 {
                    let had_rtt = st.rtt >= 0;
                    st.update_rtt(sample);
                    if !had_rtt && st.phase == Phase::SlowStart {
                        // First RTT sample: jump from one-per-second to the
                        // initial window (RFC 5348 §4.2).
                        let rtt_secs = st.rtt as f64 / NANOS_PER_SEC as f64;
                        st.x_bps = self.config.initial_window_bytes() / rtt_secs;
                        st.time_last_doubled = now;
                        tracing::debug!(
                            rtt_ms = st.rtt / 1_000_000,
                            rate_bps = st.x_bps as u64,
                            "first rtt sample"
                        );
                    }
                }
            }
        }

        match st.phase {
            Phase::SlowStart => {
                if let Some(p) = reported_p.filter(|&p| p > 0.0) {
                    st.p = p;
                    st.recompute_equation_rate(s);
                    st.phase = Phase::Equation;
                    tracing::debug!(
                        p,
                        rate_bps = st.x_bps as u64,
                        "loss reported, entering equation phase"
                    );
                } else if st.rtt > 0
                    && (st.time_last_doubled < 0 || now - st.time_last_doubled >= st.rtt)
                {
                    let mut x = 2.0 * st.x_bps;
                    if st.x_recv_bps > 0.0 {
                        x = x.min(2.0 * st.x_recv_bps);
                    }
                    let rtt_secs = st.rtt as f64 / NANOS_PER_SEC as f64;
                    st.x_bps = x.max(self.config.initial_window_bytes() / rtt_secs);
                    st.time_last_doubled = now;
                    tracing::trace!(rate_bps = st.x_bps as u64, "slow start doubling");
                }
            }
            Phase::Equation => {
                if let Some(p) = reported_p.filter(|&p| p > 0.0) {
                    st.p = p;
                }
                st.recompute_equation_rate(s);
            }
            Phase::Init | Phase::Closed => unreachable!("inactive phases return early"),
        }

        st.last_feedback = now;
        st.arm_nofeedback(now, s);
        Ok(())
    }

    fn strobe(&self) {
        loop {
            let wait = {
                let mut st = self.state.lock();
                if !st.phase.is_active() {
                    return;
                }
                let now = self.rt.now();
                let interval = self.packet_interval(&st);
                let due = st.last_emit.saturating_add(interval);
                if now >= due {
                    st.last_emit = if now - due >= IDLE_BURST_GUARD * interval {
                        // Idle connection: restart pacing from now rather
                        // than releasing a burst of catch-up credits.
                        now
                    } else {
                        due
                    };
                    return;
                }
                (due - now).min(STROBE_SLICE)
            };
            self.rt.sleep(wait);
        }
    }

    fn on_idle(&self) -> Option<IdleAction> {
        let mut st = self.state.lock();
        if !st.phase.is_active() || !st.data_sent {
            return None;
        }
        let now = self.rt.now();
        let s = self.segment_size();
        if now - st.last_feedback >= SILENCE_RESET_AFTER {
            tracing::warn!("no feedback for 64s, requesting connection reset");
            return Some(IdleAction::CongestionReset);
        }
        if st.nofeedback_deadline >= 0 && now >= st.nofeedback_deadline {
            // No-feedback timer: halve the rate, never below one segment
            // per t_mbi (RFC 5348 §4.4).
            st.x_bps = (st.x_bps / 2.0).max(tfrc::min_rate(s));
            st.arm_nofeedback(now, s);
            tracing::debug!(rate_bps = st.x_bps as u64, "no-feedback timer expired");
        }
        None
    }
}
