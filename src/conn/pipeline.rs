//! Per-connection write pipeline and congestion-control binding.
//!
//! One long-lived task serves two bounded channels: `writeNonData` carries
//! decorated control headers (plus `Poke` wakeups), `writeData` carries raw
//! application payloads. Control strictly preempts data in every phase that
//! reads control. The pipeline moves through three phases — pre-open, open,
//! closing — driven by socket state and channel closure, written as an
//! explicit state variable rather than jump labels.

use std::sync::Arc;

use bytes::Bytes;

use crate::ccid::CongestionControl;
use crate::packet::{options, Direction, Header, PacketType};
use crate::runtime::{sync, Nanos};

use super::ConnInner;

/// Park interval while both channels are empty.
const PIPELINE_PARK: Nanos = 1_000_000; // 1ms

/// A unit of work for the write pipeline.
pub(crate) enum WriteCommand {
    /// Emit this already-decorated control header.
    Packet(Header),
    /// No packet; re-examine socket state. The state machine sends this to
    /// prompt a phase check after a transition.
    Poke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelinePhase {
    PreOpen,
    Open,
    Closing,
}

/// Decorates an outgoing header with both CCIDs' contributions: the sender's
/// CCVal and options first, then the receiver's options.
///
/// Violating the option direction classification, or attaching ack-stream
/// feedback to a Data packet, is a bug in a congestion control
/// implementation, not a runtime condition: both panic.
pub(crate) fn decorate(
    scc: &dyn CongestionControl,
    rcc: &dyn CongestionControl,
    header: &mut Header,
) {
    let (ccval, sr_opts) = scc.on_write(header.packet_type, header.x, header.seqno);
    assert!(
        options::permitted_for(&sr_opts, Direction::SenderToReceiver),
        "sender congestion control wrote disallowed options"
    );
    header.ccval = ccval;
    let (_, rs_opts) = rcc.on_write(header.packet_type, header.x, header.seqno);
    assert!(
        options::permitted_for(&rs_opts, Direction::ReceiverToSender),
        "receiver congestion control wrote disallowed options"
    );
    if header.packet_type == PacketType::Data {
        assert!(
            sr_opts.iter().chain(rs_opts.iter()).all(|o| o.kind.legal_on_data()),
            "congestion control wrote options not legal on Data packets"
        );
    }
    header.options.extend(sr_opts);
    header.options.extend(rs_opts);
}

/// The dedicated writer task for one connection.
pub(crate) fn write_loop(
    inner: Arc<ConnInner>,
    nondata_rx: sync::Receiver<WriteCommand>,
    data_rx: sync::Receiver<Bytes>,
) {
    let mut phase = PipelinePhase::PreOpen;
    loop {
        match phase {
            // Only control is served; every command prompts a state check so
            // the pipeline notices OPEN/PARTOPEN.
            PipelinePhase::PreOpen => match nondata_rx.recv() {
                Err(_) => break,
                Ok(cmd) => {
                    if let WriteCommand::Packet(header) = cmd {
                        if inner.write_packet(&header).is_err() {
                            inner.abort_quietly();
                            break;
                        }
                    }
                    if inner.state.lock().state.data_transfer_allowed() {
                        tracing::debug!("write pipeline open");
                        phase = PipelinePhase::Open;
                    }
                }
            },
            // Both channels served, control first in every iteration.
            PipelinePhase::Open => match nondata_rx.try_recv() {
                Ok(WriteCommand::Packet(header)) => {
                    if inner.write_packet(&header).is_err() {
                        inner.abort_quietly();
                        break;
                    }
                }
                Ok(WriteCommand::Poke) => {}
                Err(sync::TryRecvError::Closed) => break,
                Err(sync::TryRecvError::Empty) => match data_rx.try_recv() {
                    Ok(payload) => {
                        let header = inner.build_data_ack(payload);
                        if inner.write_packet(&header).is_err() {
                            inner.abort_quietly();
                            break;
                        }
                    }
                    Err(sync::TryRecvError::Closed) => {
                        if let Some(close) = inner.begin_closing() {
                            if inner.write_packet(&close).is_err() {
                                inner.abort_quietly();
                                break;
                            }
                        }
                        phase = PipelinePhase::Closing;
                    }
                    Err(sync::TryRecvError::Empty) => inner.rt.sleep(PIPELINE_PARK),
                },
            },
            // Data is gone; drain control until the channel closes.
            PipelinePhase::Closing => match nondata_rx.recv() {
                Err(_) => break,
                Ok(cmd) => {
                    if let WriteCommand::Packet(header) = cmd {
                        if inner.write_packet(&header).is_err() {
                            inner.abort_quietly();
                            break;
                        }
                    }
                }
            },
        }
    }
    tracing::debug!("write pipeline exited");
}
