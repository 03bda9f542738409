//! Synthetic-time runtime for deterministic protocol tests.
//!
//! Tasks run on OS threads, but only one is logically runnable at any
//! simulated instant: every interaction with time goes through a single
//! request channel, so the scheduler observes a total order of `Sleep`,
//! `Now`, `Spawn` and `Die` requests. Virtual time advances only at
//! quiescence — when the number of parked sleepers equals the number of
//! live tasks — by popping the earliest wake from the sleeper heap.
//! Same program, same wake sequence, every run.
//!
//! An empty sleeper heap at quiescence means every task has terminated and
//! the simulation ends cleanly.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use super::{Nanos, Runtime};

enum Request {
    Sleep { duration: Nanos, wake: Sender<()> },
    Now { reply: Sender<Nanos> },
    Spawn,
    Die,
}

/// A task parked until virtual time reaches `wake_at`.
///
/// Heap order: earliest wake first, ties broken by registration order
/// (smaller `seq` pops first).
struct Sleeper {
    wake_at: Nanos,
    seq: u64,
    signal: Sender<()>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the smallest wake time wins.
        match other.wake_at.cmp(&self.wake_at) {
            CmpOrdering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct SchedulerStats {
    final_now: AtomicI64,
    residual_sleepers: AtomicUsize,
    terminated: AtomicBool,
}

/// Virtual-time scheduler. Cloning yields another handle to the same
/// simulation.
#[derive(Clone)]
pub struct SyntheticRuntime {
    requests: Sender<Request>,
    done: Receiver<()>,
    stats: Arc<SchedulerStats>,
}

impl SyntheticRuntime {
    pub fn new() -> Self {
        let (req_tx, req_rx) = channel::unbounded();
        // The scheduler never sends on `done`; dropping its end on exit is
        // what unblocks every `join`.
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        let stats = Arc::new(SchedulerStats {
            final_now: AtomicI64::new(0),
            residual_sleepers: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        });
        let loop_stats = stats.clone();
        std::thread::Builder::new()
            .name("synthetic-scheduler".into())
            .spawn(move || scheduler_loop(req_rx, done_tx, loop_stats))
            .expect("failed to spawn synthetic scheduler");
        Self {
            requests: req_tx,
            done: done_rx,
            stats,
        }
    }

    /// Runs `f` as the bootstrap task and blocks until the whole simulation
    /// terminates. Returns the runtime so tests can inspect the final state.
    pub fn run<F>(f: F) -> Self
    where
        F: FnOnce(Arc<dyn Runtime>) + Send + 'static,
    {
        let rt = Self::new();
        let handle: Arc<dyn Runtime> = Arc::new(rt.clone());
        rt.spawn("main", Box::new(move || f(handle)));
        rt.join();
        rt
    }

    /// The virtual time at which the simulation terminated.
    ///
    /// Meaningful after `join` has returned.
    pub fn final_time(&self) -> Nanos {
        self.stats.final_now.load(Ordering::SeqCst)
    }

    /// Sleepers left in the queue at termination. Zero for a clean shutdown.
    pub fn residual_sleepers(&self) -> usize {
        self.stats.residual_sleepers.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn scheduler_loop(requests: Receiver<Request>, _done: Sender<()>, stats: Arc<SchedulerStats>) {
    let mut sleepers: BinaryHeap<Sleeper> = BinaryHeap::new();
    let mut now: Nanos = 0;
    let mut live: usize = 0;
    // Spawning from outside any task is a bootstrap-only affordance; until
    // the first spawn the quiescence check must not fire on (0 == 0).
    let mut bootstrapped = false;
    let mut next_seq: u64 = 0;

    loop {
        let req = match requests.recv() {
            Ok(req) => req,
            // Every handle dropped without termination: shut down as-is.
            Err(_) => break,
        };
        match req {
            Request::Sleep { duration, wake } => {
                assert!(live >= 1, "sleep request outside any live task");
                assert!(duration >= 0, "sleep with negative duration: {duration}");
                let wake_at = now + duration;
                sleepers.push(Sleeper {
                    wake_at,
                    seq: next_seq,
                    signal: wake,
                });
                next_seq += 1;
                tracing::trace!(parked = sleepers.len(), live, wake_at, "task parked");
            }
            Request::Now { reply } => {
                let _ = reply.send(now);
            }
            Request::Spawn => {
                live += 1;
                bootstrapped = true;
                tracing::trace!(live, "task spawned");
            }
            Request::Die => {
                assert!(live >= 1, "task death with zero live tasks");
                live -= 1;
                tracing::trace!(live, "task finished");
            }
        }

        // Quiescence: every live task is parked on a wake event.
        if !bootstrapped || sleepers.len() < live {
            continue;
        }
        let Some(next) = sleepers.pop() else {
            // No live tasks and nothing to wake: clean termination.
            break;
        };
        assert!(next.wake_at >= now, "sleeper would wake in the past");
        now = next.wake_at;
        tracing::trace!(now, "virtual time advanced");
        let _ = next.signal.send(());
    }

    stats.final_now.store(now, Ordering::SeqCst);
    stats.residual_sleepers.store(sleepers.len(), Ordering::SeqCst);
    stats.terminated.store(true, Ordering::SeqCst);
    tracing::debug!(final_now = now, "synthetic runtime terminated");
}

impl Runtime for SyntheticRuntime {
    fn now(&self) -> Nanos {
        if self.stats.terminated.load(Ordering::SeqCst) {
            return self.stats.final_now.load(Ordering::SeqCst);
        }
        let (tx, rx) = channel::bounded(1);
        if self.requests.send(Request::Now { reply: tx }).is_err() {
            return self.stats.final_now.load(Ordering::SeqCst);
        }
        rx.recv()
            .unwrap_or_else(|_| self.stats.final_now.load(Ordering::SeqCst))
    }

    fn sleep(&self, nanos: Nanos) {
        assert!(nanos >= 0, "sleep with negative duration: {nanos}");
        let (tx, rx) = channel::bounded(1);
        self.requests
            .send(Request::Sleep {
                duration: nanos,
                wake: tx,
            })
            .expect("synthetic scheduler terminated while tasks were running");
        rx.recv()
            .expect("synthetic scheduler terminated while a task slept");
    }

    fn spawn(&self, name: &str, f: Box<dyn FnOnce() + Send + 'static>) {
        self.requests
            .send(Request::Spawn)
            .expect("spawn on a terminated synthetic runtime");
        let requests = self.requests.clone();
        std::thread::Builder::new()
            .name(format!("sim-{name}"))
            .spawn(move || {
                // Panics in f are deliberately not caught: correct protocol
                // code never panics, and a hung quiescence check is the
                // loudest available signal of a broken task.
                f();
                let _ = requests.send(Request::Die);
            })
            .expect("failed to spawn task thread");
    }

    fn join(&self) {
        let _ = self.done.recv();
    }
}
