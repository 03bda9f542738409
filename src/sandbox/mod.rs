//! In-memory transports and wiring helpers for protocol simulations.
//!
//! [`pipe`] builds a bidirectional header pipe whose directions can each be
//! given a transmit-rate cap (packets beyond the rate are silently dropped,
//! modeling tail-drop loss), a fixed one-way latency, and seeded random
//! loss. Everything blocks through the runtime, so simulations run under
//! virtual time with no wall-clock delays.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ConnConfig;
use crate::conn::Conn;
use crate::packet::Header;
use crate::runtime::{sync, Nanos, Runtime};
use crate::transport::{HeaderTransport, TransportError};

/// Per-direction in-flight packet budget, a stand-in for a network queue.
const PIPE_CAPACITY: usize = 64;

struct InFlight {
    header: Header,
    deliver_at: Nanos,
}

struct EgressPolicy {
    /// Earliest instant the next packet is admitted; meaningful only with
    /// an admission interval.
    next_admission: Nanos,
    /// Minimum spacing between admitted packets; `None` = unlimited.
    admission_interval: Option<Nanos>,
    latency: Nanos,
    loss_probability: f64,
    rng: Option<StdRng>,
    admitted: u64,
    dropped: u64,
}

/// One endpoint of an in-memory header pipe. Writing is governed by this
/// end's egress policy; reading delivers what the peer end admitted.
pub struct PipeEnd {
    rt: Arc<dyn Runtime>,
    tx: sync::Sender<InFlight>,
    rx: sync::Receiver<InFlight>,
    policy: Mutex<EgressPolicy>,
}

/// Creates a connected pair of pipe ends.
pub fn pipe(rt: &Arc<dyn Runtime>) -> (Arc<PipeEnd>, Arc<PipeEnd>) {
    let (a_tx, b_rx) = sync::channel(rt, PIPE_CAPACITY);
    let (b_tx, a_rx) = sync::channel(rt, PIPE_CAPACITY);
    let end = |tx, rx| {
        Arc::new(PipeEnd {
            rt: rt.clone(),
            tx,
            rx,
            policy: Mutex::new(EgressPolicy {
                next_admission: 0,
                admission_interval: None,
                latency: 0,
                loss_probability: 0.0,
                rng: None,
                admitted: 0,
                dropped: 0,
            }),
        })
    };
    (end(a_tx, a_rx), end(b_tx, b_rx))
}

impl PipeEnd {
    /// Caps this direction at `packets` per `window`: one admission per
    /// `window / packets`, everything in between is dropped on the floor.
    pub fn set_write_rate(&self, window: Nanos, packets: u32) {
        assert!(packets > 0, "rate cap of zero packets");
        let mut policy = self.policy.lock();
        policy.admission_interval = Some(window / packets as Nanos);
        policy.next_admission = self.rt.now();
    }

    /// Fixed one-way delivery delay.
    pub fn set_latency(&self, latency: Nanos) {
        assert!(latency >= 0, "negative latency");
        self.policy.lock().latency = latency;
    }

    /// Drops each packet independently with probability `p`, from a seeded
    /// generator so runs stay reproducible.
    pub fn set_loss_probability(&self, p: f64, seed: u64) {
        assert!((0.0..=1.0).contains(&p), "loss probability out of range");
        let mut policy = self.policy.lock();
        policy.loss_probability = p;
        policy.rng = Some(StdRng::seed_from_u64(seed));
    }

    pub fn admitted(&self) -> u64 {
        self.policy.lock().admitted
    }

    pub fn dropped(&self) -> u64 {
        self.policy.lock().dropped
    }
}

impl HeaderTransport for PipeEnd {
    fn write_header(&self, header: &Header) -> Result<(), TransportError> {
        let now = self.rt.now();
        let latency = {
            let mut policy = self.policy.lock();
            if policy.loss_probability > 0.0 {
                let p = policy.loss_probability;
                if let Some(rng) = policy.rng.as_mut() {
                    if rng.gen_bool(p) {
                        policy.dropped += 1;
                        tracing::trace!(seqno = header.seqno, "packet lost (random)");
                        return Ok(());
                    }
                }
            }
            if let Some(interval) = policy.admission_interval {
                if now < policy.next_admission {
                    policy.dropped += 1;
                    tracing::trace!(seqno = header.seqno, "packet lost (rate cap)");
                    return Ok(());
                }
                policy.next_admission = now + interval;
            }
            policy.admitted += 1;
            policy.latency
        };
        let deliver_at = now + latency;
        let in_flight = InFlight {
            header: header.clone(),
            deliver_at,
        };
        // Blocking send: a full pipe back-pressures the writer like a
        // saturated kernel buffer would.
        self.tx
            .send(in_flight)
            .map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    fn read_header(&self) -> Result<Header, TransportError> {
        let in_flight = self.rx.recv().map_err(|_| TransportError::Closed)?;
        let now = self.rt.now();
        if in_flight.deliver_at > now {
            self.rt.sleep(in_flight.deliver_at - now);
        }
        Ok(in_flight.header)
    }

    fn close(&self) {
        self.tx.close();
        self.rx.close();
    }
}

/// A connected client/server pair over a fresh pipe.
pub struct SandboxPair {
    pub client: Conn,
    pub server: Conn,
    /// The client's end: its egress policy shapes client→server traffic.
    pub client_to_server: Arc<PipeEnd>,
    /// The server's end: its egress policy shapes server→client traffic.
    pub server_to_client: Arc<PipeEnd>,
}

/// Wires a client and a server over an unconstrained pipe. To shape the
/// path before the handshake, build the pipe with [`pipe`] and the
/// connections by hand instead.
pub fn client_server_pipe(rt: &Arc<dyn Runtime>, config: ConnConfig) -> SandboxPair {
    let (client_end, server_end) = pipe(rt);
    let client = Conn::client(
        rt.clone(),
        client_end.clone() as Arc<dyn HeaderTransport>,
        config.clone(),
    );
    let server = Conn::server(
        rt.clone(),
        server_end.clone() as Arc<dyn HeaderTransport>,
        config,
    );
    SandboxPair {
        client,
        server,
        client_to_server: client_end,
        server_to_client: server_end,
    }
}

/// Joins both connections and records the orderly completion of a
/// bilateral session.
pub fn wait_both_done(client: &Conn, server: &Conn) {
    client.join();
    server.join();
    tracing::info!("Server and client done.");
}
