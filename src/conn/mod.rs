//! Connection: socket state machine, per-connection tasks and the
//! congestion-control binding.
//!
//! Each connection runs three cooperative tasks on its runtime: the write
//! pipeline (see [`pipeline`]), a read loop that feeds ingress packets
//! through the receiver CCID then the sender CCID, and an idle loop that
//! polls both CCIDs for injection requests. The connection owns its two
//! CCIDs exclusively; they communicate only through return values.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::ccid::{CcidError, CongestionControl, IdleAction};
use crate::ccid3::{Ccid3Receiver, Ccid3ReceiverStats, Ccid3Sender, Ccid3SenderStats};
use crate::config::ConnConfig;
use crate::packet::{Header, PacketType};
use crate::runtime::{go, sync, Nanos, Runtime};
use crate::transport::{HeaderTransport, TransportError};

pub(crate) mod pipeline;
mod state;

pub use state::SocketState;

use pipeline::WriteCommand;

/// Poll period for `Conn::join`.
const JOIN_PARK: Nanos = 1_000_000; // 1ms

/// A Close is repeated at this interval until the peer's Reset arrives.
const CLOSE_RETRANSMIT: Nanos = 500_000_000; // 500ms

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("end of stream")]
    Eof,
    #[error("connection closed")]
    Closed,
    #[error("payload exceeds congestion control maximum packet size")]
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

pub(crate) struct SocketCore {
    pub(crate) state: SocketState,
    /// Greatest sequence number sent.
    gss: u64,
    /// Greatest sequence number received; acks report this.
    pub(crate) gsr: Option<u64>,
    last_close_sent: Nanos,
    role: Role,
}

impl SocketCore {
    fn next_seqno(&mut self) -> u64 {
        self.gss += 1;
        self.gss
    }
}

/// Write-side channel references, guarded separately from the socket state
/// so teardown can retire them without holding the connection lock.
pub(crate) struct WriteSide {
    pub(crate) nondata_tx: Option<sync::Sender<WriteCommand>>,
    pub(crate) data_tx: Option<sync::Sender<Bytes>>,
    pub(crate) read_tx: Option<sync::Sender<Bytes>>,
}

pub(crate) struct ConnInner {
    pub(crate) rt: Arc<dyn Runtime>,
    pub(crate) config: ConnConfig,
    pub(crate) transport: Arc<dyn HeaderTransport>,
    pub(crate) scc: Arc<Ccid3Sender>,
    pub(crate) rcc: Arc<Ccid3Receiver>,
    pub(crate) state: Mutex<SocketCore>,
    pub(crate) write_side: Mutex<WriteSide>,
    read_rx: sync::Receiver<Bytes>,
    dead: AtomicBool,
}

impl ConnInner {
    pub(crate) fn new(
        rt: Arc<dyn Runtime>,
        transport: Arc<dyn HeaderTransport>,
        config: ConnConfig,
        role: Role,
    ) -> (Arc<Self>, sync::Receiver<WriteCommand>, sync::Receiver<Bytes>) {
        let (nondata_tx, nondata_rx) = sync::channel(&rt, config.nondata_capacity);
        let (data_tx, data_rx) = sync::channel(&rt, config.data_capacity);
        let (read_tx, read_rx) = sync::channel(&rt, config.read_capacity);
        let scc = Arc::new(Ccid3Sender::new(rt.clone(), config.ccid3.clone()));
        let rcc = Arc::new(Ccid3Receiver::new(rt.clone(), config.ccid3.clone()));
        let inner = Arc::new(ConnInner {
            rt,
            config,
            transport,
            scc,
            rcc,
            state: Mutex::new(SocketCore {
                state: SocketState::Closed,
                gss: 0,
                gsr: None,
                last_close_sent: 0,
                role,
            }),
            write_side: Mutex::new(WriteSide {
                nondata_tx: Some(nondata_tx),
                data_tx: Some(data_tx),
                read_tx: Some(read_tx),
            }),
            read_rx,
            dead: AtomicBool::new(false),
        });
        (inner, nondata_rx, data_rx)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn open_ccids(&self) {
        self.scc.open();
        self.rcc.open();
    }

    /// Builds and decorates a control header under the connection lock.
    pub(crate) fn build_control(&self, packet_type: PacketType) -> Header {
        let mut core = self.state.lock();
        let seqno = core.next_seqno();
        let ackno = packet_type.carries_ack().then(|| core.gsr.unwrap_or(0));
        let mut header = Header::control(packet_type, seqno, ackno);
        pipeline::decorate(self.scc.as_ref(), self.rcc.as_ref(), &mut header);
        header
    }

    /// Builds and decorates a DataAck for an application payload under the
    /// connection lock.
    pub(crate) fn build_data_ack(&self, payload: Bytes) -> Header {
        let mut core = self.state.lock();
        let seqno = core.next_seqno();
        let ackno = core.gsr.unwrap_or(0);
        let mut header = Header::data_ack(seqno, ackno, payload);
        pipeline::decorate(self.scc.as_ref(), self.rcc.as_ref(), &mut header);
        header
    }

    /// Strobes data-bearing packets, then hands the header to the transport.
    pub(crate) fn write_packet(&self, header: &Header) -> Result<(), TransportError> {
        if header.packet_type.is_data_bearing() {
            self.scc.strobe();
        }
        self.transport.write_header(header)
    }

    /// Enqueues a control command without blocking. A full pipeline drops
    /// the packet: the congestion rate is too slow to flush control traffic
    /// and protocol correctness does not depend on any single one.
    pub(crate) fn inject(&self, header: Option<Header>) {
        let ws = self.write_side.lock();
        let Some(tx) = ws.nondata_tx.as_ref() else {
            return;
        };
        let cmd = match header {
            Some(h) => WriteCommand::Packet(h),
            None => WriteCommand::Poke,
        };
        match tx.try_send(cmd) {
            Ok(()) => {}
            Err(sync::TrySendError::Full(cmd)) => {
                if let WriteCommand::Packet(h) = cmd {
                    tracing::warn!(
                        packet_type = ?h.packet_type,
                        seqno = h.seqno,
                        "dropping non-data packet, congestion rate too slow"
                    );
                }
            }
            Err(sync::TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn send_control(&self, packet_type: PacketType) {
        let header = self.build_control(packet_type);
        self.inject(Some(header));
    }

    /// Entered by the write pipeline when the data channel closes: moves the
    /// socket to CLOSING and yields the Close header to emit after the
    /// drained data.
    pub(crate) fn begin_closing(&self) -> Option<Header> {
        let mut core = self.state.lock();
        if !core.state.data_transfer_allowed() {
            return None;
        }
        core.state = SocketState::Closing;
        core.last_close_sent = self.rt.now();
        let seqno = core.next_seqno();
        let ackno = core.gsr.unwrap_or(0);
        let mut header = Header::control(PacketType::Close, seqno, Some(ackno));
        pipeline::decorate(self.scc.as_ref(), self.rcc.as_ref(), &mut header);
        tracing::debug!("application data drained, closing");
        Some(header)
    }

    /// Handles one accepted ingress packet. Returns false when the read
    /// loop should exit.
    pub(crate) fn on_packet(self: &Arc<Self>, header: Header) -> bool {
        let mut core = self.state.lock();
        if core.gsr.map_or(true, |gsr| header.seqno > gsr) {
            core.gsr = Some(header.seqno);
        }

        // Receiver CCID first, then sender; options are never stripped, the
        // direction of each type decides which side consumes it.
        match self.rcc.on_read(
            header.packet_type,
            header.x,
            header.seqno,
            header.ackno,
            &header.options,
        ) {
            Ok(()) => {}
            Err(CcidError::Drop) => {
                tracing::trace!(seqno = header.seqno, "packet dropped by receiver ccid");
                return true;
            }
            Err(CcidError::Reset) => {
                drop(core);
                self.reset_and_teardown();
                return false;
            }
        }
        match self.scc.on_read(
            header.packet_type,
            header.x,
            header.seqno,
            header.ackno,
            &header.options,
        ) {
            Ok(()) => {}
            Err(CcidError::Drop) => {
                tracing::trace!(seqno = header.seqno, "packet dropped by sender ccid");
                return true;
            }
            Err(CcidError::Reset) => {
                drop(core);
                self.reset_and_teardown();
                return false;
            }
        }

        let state = core.state;
        match (state, header.packet_type) {
            // Teardown-family packets apply in every state and must not be
            // shadowed by the handshake arms below.
            (_, PacketType::CloseReq) => {
                drop(core);
                tracing::debug!("close requested by peer");
                self.close();
            }
            (_, PacketType::Close) => {
                core.state = SocketState::Closed;
                drop(core);
                tracing::debug!("close received, resetting");
                let reset = self.build_control(PacketType::Reset);
                let _ = self.write_packet(&reset);
                self.teardown();
                return false;
            }
            (_, PacketType::Reset) => {
                let was_closing =
                    matches!(state, SocketState::Closing | SocketState::CloseReq);
                core.state = SocketState::TimeWait;
                drop(core);
                if was_closing {
                    self.rt.sleep(self.config.timewait);
                }
                self.teardown();
                return false;
            }
            (_, PacketType::Sync) => {
                drop(core);
                self.send_control(PacketType::SyncAck);
            }
            (SocketState::Listen, PacketType::Request) => {
                core.state = SocketState::Respond;
                drop(core);
                tracing::debug!("request received, responding");
                self.send_control(PacketType::Response);
            }
            (SocketState::Request, PacketType::Response) => {
                core.state = SocketState::PartOpen;
                drop(core);
                tracing::debug!("response received, part-open");
                self.open_ccids();
                self.send_control(PacketType::Ack);
            }
            (SocketState::Respond, PacketType::Ack | PacketType::DataAck) => {
                core.state = SocketState::Open;
                drop(core);
                tracing::debug!("handshake acked, open");
                self.open_ccids();
                self.inject(None); // poke the writer to observe OPEN
            }
            (SocketState::PartOpen, ty) if ty != PacketType::Response => {
                core.state = SocketState::Open;
                drop(core);
                tracing::debug!("open");
            }
            _ => {
                drop(core);
            }
        }

        if header.packet_type.is_data_bearing() && !header.payload.is_empty() {
            let read_tx = {
                let ws = self.write_side.lock();
                ws.read_tx.clone()
            };
            if let Some(tx) = read_tx {
                if tx.send(header.payload).is_err() {
                    tracing::trace!("payload discarded, connection tearing down");
                }
            }
        }
        true
    }

    /// Closes the application write path; the pipeline drains it and sends
    /// Close on its own schedule, preserving data-before-Close order.
    pub(crate) fn close(&self) {
        let data_tx = {
            let mut ws = self.write_side.lock();
            ws.data_tx.take()
        };
        let Some(tx) = data_tx else {
            return; // already closing or dead
        };
        tx.close();
        self.inject(None);
    }

    /// Emits a Reset directly (queue-jumping is fine, teardown is imminent)
    /// and kills the connection.
    pub(crate) fn reset_and_teardown(&self) {
        if !self.is_dead() {
            let reset = self.build_control(PacketType::Reset);
            let _ = self.write_packet(&reset);
        }
        self.teardown();
    }

    /// Aborts without notifying the peer; the transport-error path.
    pub(crate) fn abort_quietly(&self) {
        self.teardown();
    }

    /// Idempotent death: retire the channels, close the CCIDs, close the
    /// transport.
    pub(crate) fn teardown(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        let role = {
            let mut core = self.state.lock();
            core.state = SocketState::Closed;
            core.role
        };
        self.scc.close();
        self.rcc.close();
        let (nondata_tx, data_tx, read_tx) = {
            let mut ws = self.write_side.lock();
            (ws.nondata_tx.take(), ws.data_tx.take(), ws.read_tx.take())
        };
        if let Some(tx) = nondata_tx {
            tx.close();
        }
        if let Some(tx) = data_tx {
            tx.close();
        }
        if let Some(tx) = read_tx {
            tx.close();
        }
        self.transport.close();
        tracing::debug!(role = ?role, "connection torn down");
    }
}

fn read_loop(inner: Arc<ConnInner>) {
    loop {
        match inner.transport.read_header() {
            Ok(header) => {
                tracing::trace!(
                    packet_type = ?header.packet_type,
                    seqno = header.seqno,
                    "packet accepted"
                );
                if !inner.on_packet(header) {
                    return;
                }
            }
            Err(err) => {
                if !inner.is_dead() {
                    tracing::debug!(%err, "transport read failed, aborting quietly");
                }
                inner.abort_quietly();
                return;
            }
        }
    }
}

fn idle_loop(inner: Arc<ConnInner>) {
    loop {
        inner.rt.sleep(inner.config.idle_interval);
        if inner.is_dead() {
            return;
        }
        let retransmit_close = {
            let mut core = inner.state.lock();
            let now = inner.rt.now();
            if core.state == SocketState::Closing
                && now - core.last_close_sent >= CLOSE_RETRANSMIT
            {
                core.last_close_sent = now;
                true
            } else {
                false
            }
        };
        if retransmit_close {
            tracing::debug!("retransmitting close");
            inner.send_control(PacketType::Close);
        }
        let ccids: [&dyn CongestionControl; 2] = [inner.scc.as_ref(), inner.rcc.as_ref()];
        for ccid in ccids {
            match ccid.on_idle() {
                None => {}
                Some(IdleAction::CongestionAck) => inner.send_control(PacketType::Ack),
                Some(IdleAction::CongestionReset) => {
                    tracing::warn!("congestion control requested reset");
                    inner.reset_and_teardown();
                    return;
                }
            }
        }
    }
}

/// One endpoint of a congestion-controlled connection.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    /// Creates the active endpoint: sends the Request and drives the
    /// handshake from REQUEST.
    pub fn client(
        rt: Arc<dyn Runtime>,
        transport: Arc<dyn HeaderTransport>,
        config: ConnConfig,
    ) -> Self {
        let conn = Self::start(rt, transport, config, Role::Client);
        {
            let mut core = conn.inner.state.lock();
            core.state = SocketState::Request;
        }
        conn.inner.send_control(PacketType::Request);
        conn
    }

    /// Creates the passive endpoint, waiting in LISTEN for a Request.
    pub fn server(
        rt: Arc<dyn Runtime>,
        transport: Arc<dyn HeaderTransport>,
        config: ConnConfig,
    ) -> Self {
        let conn = Self::start(rt, transport, config, Role::Server);
        conn.inner.state.lock().state = SocketState::Listen;
        conn
    }

    fn start(
        rt: Arc<dyn Runtime>,
        transport: Arc<dyn HeaderTransport>,
        config: ConnConfig,
        role: Role,
    ) -> Self {
        let (inner, nondata_rx, data_rx) = ConnInner::new(rt.clone(), transport, config, role);
        {
            let writer = inner.clone();
            go(&rt, "conn-writer", move || {
                pipeline::write_loop(writer, nondata_rx, data_rx)
            });
        }
        {
            let reader = inner.clone();
            go(&rt, "conn-reader", move || read_loop(reader));
        }
        {
            let idler = inner.clone();
            go(&rt, "conn-idle", move || idle_loop(idler));
        }
        Self { inner }
    }

    /// Writes one application payload, blocking while the pipeline is full.
    pub fn write(&self, data: Bytes) -> Result<(), ConnError> {
        if data.len() > self.inner.scc.ccmps() as usize {
            return Err(ConnError::TooLarge);
        }
        let data_tx = {
            let ws = self.inner.write_side.lock();
            ws.data_tx.clone()
        };
        let Some(tx) = data_tx else {
            return Err(ConnError::Closed);
        };
        tx.send(data).map_err(|_| ConnError::Closed)
    }

    /// Reads the next payload; `Eof` once the peer has closed and all
    /// delivered data is drained.
    pub fn read(&self) -> Result<Bytes, ConnError> {
        self.inner.read_rx.recv().map_err(|_| ConnError::Eof)
    }

    /// Orderly close: drains written data, then runs the Close handshake.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Immediate teardown with a Reset to the peer.
    pub fn abort(&self) {
        self.inner.reset_and_teardown();
    }

    /// Blocks until the connection is fully torn down.
    pub fn join(&self) {
        while !self.inner.is_dead() {
            self.inner.rt.sleep(JOIN_PARK);
        }
    }

    pub fn state(&self) -> SocketState {
        self.inner.state.lock().state
    }

    pub fn sender_stats(&self) -> Ccid3SenderStats {
        self.inner.scc.stats()
    }

    pub fn receiver_stats(&self) -> Ccid3ReceiverStats {
        self.inner.rcc.stats()
    }
}
