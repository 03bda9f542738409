//! TFRC receiver half-connection.
//!
//! Watches the incoming sequence-number stream, groups losses into
//! intervals, and reports the loss event rate, receive rate and ack delay
//! back to the peer. Feedback rides on ack-bearing headers the connection
//! injects when `on_idle` asks for one.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ccid::{CcidError, CongestionControl, IdleAction, CCID3};
use crate::config::Ccid3Config;
use crate::packet::{PacketOption, PacketType};
use crate::runtime::{Nanos, Runtime, NANOS_PER_SEC};

/// Completed loss intervals kept for the weighted average.
const LOSS_HISTORY: usize = 8;

/// Interval weights, newest first (RFC 3448 §5.4).
const WEIGHTS: [f64; LOSS_HISTORY] = [1.0, 1.0, 1.0, 1.0, 0.8, 0.6, 0.4, 0.2];

/// Feedback is due after this many data packets...
const FEEDBACK_PACKET_PERIOD: u32 = 8;

/// ...or after this much time with any data pending, whichever first.
const FEEDBACK_TIME_FLOOR: Nanos = 100_000_000; // 100ms

struct ReceiverState {
    active: bool,
    closed: bool,
    /// Greatest (and, on an in-order transport, latest) seqno seen.
    last_seqno: Option<u64>,
    /// Arrival time of `last_seqno`, for the Elapsed Time report.
    last_arrival: Nanos,
    /// First seqno of the most recent loss gap.
    last_gap_start: Option<u64>,
    /// Completed loss intervals, newest at the back.
    intervals: VecDeque<u64>,
    data_since_feedback: u32,
    window_start: Nanos,
    last_feedback_sent: Nanos,
    total_data: u64,
    total_lost: u64,
}

/// Point-in-time view of the receiver for tests and telemetry.
#[derive(Debug, Clone)]
pub struct Ccid3ReceiverStats {
    pub loss_event_rate: f64,
    pub completed_intervals: usize,
    pub total_data: u64,
    pub total_lost: u64,
}

pub struct Ccid3Receiver {
    rt: Arc<dyn Runtime>,
    config: Ccid3Config,
    state: Mutex<ReceiverState>,
}

impl Ccid3Receiver {
    pub fn new(rt: Arc<dyn Runtime>, config: Ccid3Config) -> Self {
        Self {
            rt,
            config,
            state: Mutex::new(ReceiverState {
                active: false,
                closed: false,
                last_seqno: None,
                last_arrival: -1,
                last_gap_start: None,
                intervals: VecDeque::with_capacity(LOSS_HISTORY),
                data_since_feedback: 0,
                window_start: -1,
                last_feedback_sent: -1,
                total_data: 0,
                total_lost: 0,
            }),
        }
    }

    pub fn stats(&self) -> Ccid3ReceiverStats {
        let st = self.state.lock();
        Ccid3ReceiverStats {
            loss_event_rate: st.loss_event_rate(),
            completed_intervals: st.intervals.len(),
            total_data: st.total_data,
            total_lost: st.total_lost,
        }
    }
}

impl ReceiverState {
    /// p̂ = 1 / weighted mean of the completed intervals, newest weighted
    /// highest. Zero until an interval has completed.
    fn loss_event_rate(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        let mut num = 0.0;
        let mut den = 0.0;
        for (i, &len) in self.intervals.iter().rev().take(LOSS_HISTORY).enumerate() {
            num += WEIGHTS[i] * len as f64;
            den += WEIGHTS[i];
        }
        den / num
    }

    fn note_gap(&mut self, first_lost: u64, lost: u64) {
        if let Some(prev) = self.last_gap_start {
            let interval = first_lost - prev;
            self.intervals.push_back(interval);
            if self.intervals.len() > LOSS_HISTORY {
                self.intervals.pop_front();
            }
        }
        self.last_gap_start = Some(first_lost);
        self.total_lost += lost;
    }
}

impl CongestionControl for Ccid3Receiver {
    fn id(&self) -> u8 {
        CCID3
    }

    fn ccmps(&self) -> i32 {
        self.config.ccmps
    }

    fn rtt(&self) -> i64 {
        -1
    }

    fn open(&self) {
        let mut st = self.state.lock();
        if st.closed || st.active {
            return;
        }
        st.active = true;
        st.window_start = self.rt.now();
        tracing::debug!("ccid3 receiver open");
    }

    fn close(&self) {
        let mut st = self.state.lock();
        st.active = false;
        st.closed = true;
    }

    fn on_write(&self, packet_type: PacketType, _x: bool, _seqno: u64) -> (u8, Vec<PacketOption>) {
        let mut st = self.state.lock();
        // Feedback describes the acked stream; nothing rides on pure Data
        // headers, and there is nothing to say before any data arrived.
        if !st.active || packet_type == PacketType::Data || st.last_arrival < 0 {
            return (0, Vec::new());
        }
        let now = self.rt.now();

        let mut options = Vec::new();
        let elapsed_tens = ((now - st.last_arrival) / 10_000).max(0) as u32;
        options.push(PacketOption::elapsed_time(elapsed_tens));

        let window = now - st.window_start;
        if window > 0 && st.data_since_feedback > 0 {
            let bytes = st.data_since_feedback as f64 * self.config.ccmps as f64;
            let rate = bytes / (window as f64 / NANOS_PER_SEC as f64);
            options.push(PacketOption::receive_rate(rate.min(u32::MAX as f64) as u32));
        }

        let p = st.loss_event_rate();
        if p > 0.0 {
            options.push(PacketOption::loss_event_rate(p));
            let intervals: Vec<u32> = st
                .intervals
                .iter()
                .rev()
                .map(|&len| len.min(u32::MAX as u64) as u32)
                .collect();
            options.push(PacketOption::loss_intervals(&intervals));
        }

        st.data_since_feedback = 0;
        st.window_start = now;
        st.last_feedback_sent = now;
        (0, options)
    }

    fn on_read(
        &self,
        packet_type: PacketType,
        _x: bool,
        seqno: u64,
        _ackno: Option<u64>,
        _options: &[PacketOption],
    ) -> Result<(), CcidError> {
        let mut st = self.state.lock();
        if !st.active {
            return Ok(());
        }
        let now = self.rt.now();

        match st.last_seqno {
            Some(last) if seqno <= last => {
                // Duplicate or reordered beyond what this profile tracks.
                return Err(CcidError::Drop);
            }
            Some(last) => {
                if seqno > last + 1 {
                    let first_lost = last + 1;
                    st.note_gap(first_lost, seqno - last - 1);
                    tracing::trace!(
                        first_lost,
                        lost = seqno - last - 1,
                        intervals = st.intervals.len(),
                        "loss gap detected"
                    );
                }
            }
            None => {}
        }
        st.last_seqno = Some(seqno);
        st.last_arrival = now;
        if packet_type.is_data_bearing() {
            st.total_data += 1;
            st.data_since_feedback += 1;
        }
        Ok(())
    }

    fn strobe(&self) {}

    fn on_idle(&self) -> Option<IdleAction> {
        let mut st = self.state.lock();
        if !st.active || st.data_since_feedback == 0 {
            return None;
        }
        let now = self.rt.now();
        let due = st.data_since_feedback >= FEEDBACK_PACKET_PERIOD
            || st.last_feedback_sent < 0
            || now - st.last_feedback_sent >= FEEDBACK_TIME_FLOOR;
        if due {
            // Rearmed when the feedback actually rides out in on_write.
            st.last_feedback_sent = now;
            return Some(IdleAction::CongestionAck);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::OptionKind;
    use crate::runtime::testing::StepRuntime;

    const MS: Nanos = 1_000_000;

    fn receiver_with_clock() -> (Arc<StepRuntime>, Ccid3Receiver) {
        let rt = Arc::new(StepRuntime::new());
        let handle: Arc<dyn Runtime> = rt.clone();
        let recv = Ccid3Receiver::new(
            handle,
            Ccid3Config {
                ccmps: 1000,
                ..Default::default()
            },
        );
        recv.open();
        (rt, recv)
    }

    fn read_data(recv: &Ccid3Receiver, seqno: u64) -> Result<(), CcidError> {
        recv.on_read(PacketType::DataAck, true, seqno, Some(0), &[])
    }

    #[test]
    fn alternating_loss_converges_to_half() {
        let (rt, recv) = receiver_with_clock();
        // Every other seqno missing: 1, 3, 5, ...
        for seqno in (1..100u64).step_by(2) {
            read_data(&recv, seqno).unwrap();
            rt.advance(50 * MS);
        }
        let p = recv.stats().loss_event_rate;
        assert!((p - 0.5).abs() < 1e-9, "p = {p}");
    }

    #[test]
    fn lossless_stream_reports_zero() {
        let (_rt, recv) = receiver_with_clock();
        for seqno in 1..50u64 {
            read_data(&recv, seqno).unwrap();
        }
        assert_eq!(recv.stats().loss_event_rate, 0.0);
        assert_eq!(recv.stats().total_lost, 0);
    }

    #[test]
    fn burst_gap_counts_as_one_event() {
        let (_rt, recv) = receiver_with_clock();
        read_data(&recv, 1).unwrap();
        read_data(&recv, 5).unwrap(); // 2,3,4 lost: one event
        read_data(&recv, 6).unwrap();
        read_data(&recv, 10).unwrap(); // 7,8,9 lost: second event
        let stats = recv.stats();
        assert_eq!(stats.total_lost, 6);
        // One completed interval, spanning gap start 2 to gap start 7.
        assert_eq!(stats.completed_intervals, 1);
        assert!((stats.loss_event_rate - 0.2).abs() < 1e-9);
    }

    #[test]
    fn duplicates_are_dropped() {
        let (_rt, recv) = receiver_with_clock();
        read_data(&recv, 3).unwrap();
        assert_eq!(read_data(&recv, 3), Err(CcidError::Drop));
        assert_eq!(read_data(&recv, 2), Err(CcidError::Drop));
    }

    #[test]
    fn feedback_options_ride_on_acks_only() {
        let (rt, recv) = receiver_with_clock();
        read_data(&recv, 1).unwrap();
        read_data(&recv, 3).unwrap();
        read_data(&recv, 5).unwrap();
        rt.advance(10 * MS);

        let (_, on_data) = recv.on_write(PacketType::Data, true, 100);
        assert!(on_data.is_empty());

        let (_, opts) = recv.on_write(PacketType::Ack, true, 100);
        let kinds: Vec<_> = opts.iter().map(|o| o.kind).collect();
        assert!(kinds.contains(&OptionKind::ElapsedTime));
        assert!(kinds.contains(&OptionKind::ReceiveRate));
        assert!(kinds.contains(&OptionKind::LossEventRate));
        assert!(kinds.contains(&OptionKind::LossIntervals));
        // Everything produced here must be receiver-to-sender classified.
        assert!(crate::packet::options::permitted_for(
            &opts,
            crate::packet::Direction::ReceiverToSender
        ));
    }

    #[test]
    fn elapsed_time_reflects_ack_delay() {
        let (rt, recv) = receiver_with_clock();
        read_data(&recv, 1).unwrap();
        rt.advance(30 * MS);
        let (_, opts) = recv.on_write(PacketType::Ack, true, 9);
        let elapsed = opts
            .iter()
            .find_map(|o| o.as_elapsed_tens_of_micros())
            .unwrap();
        assert_eq!(elapsed, 3000); // 30ms in tens of µs
    }

    #[test]
    fn feedback_cadence_follows_packets_and_time() {
        let (rt, recv) = receiver_with_clock();
        assert_eq!(recv.on_idle(), None); // nothing received yet
        read_data(&recv, 1).unwrap();
        // First data: feedback due immediately.
        assert_eq!(recv.on_idle(), Some(IdleAction::CongestionAck));
        recv.on_write(PacketType::Ack, true, 50);
        assert_eq!(recv.on_idle(), None); // nothing new since
        read_data(&recv, 2).unwrap();
        assert_eq!(recv.on_idle(), None); // too soon
        rt.advance(FEEDBACK_TIME_FLOOR);
        assert_eq!(recv.on_idle(), Some(IdleAction::CongestionAck));
    }

    #[test]
    fn inactive_receiver_is_inert() {
        let rt = Arc::new(StepRuntime::new());
        let handle: Arc<dyn Runtime> = rt.clone();
        let recv = Ccid3Receiver::new(handle, Ccid3Config::default());
        assert!(read_data(&recv, 1).is_ok());
        let (ccval, opts) = recv.on_write(PacketType::Ack, true, 1);
        assert_eq!((ccval, opts.len()), (0, 0));
        assert_eq!(recv.on_idle(), None);
    }
}
