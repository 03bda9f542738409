//! Bounded channels whose blocking operations park through the runtime.
//!
//! Under the synthetic runtime, a task blocked in plain channel `recv` would
//! stall quiescence detection forever: the scheduler cannot see it. These
//! channels poll their `try_*` counterpart under a short runtime sleep, so a
//! blocked task is always registered as a sleeper and virtual time keeps
//! moving. The polling interval is far below every protocol time constant,
//! and under virtual time the repeated parks are free.
//!
//! Senders may `close` the channel explicitly (the teardown signal the
//! connection relies on); receivers observe `Closed` only after draining.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Nanos, Runtime};

/// How long a blocked task parks between polls. Well below every protocol
/// time constant, and free under virtual time.
const PARK_INTERVAL: Nanos = 1_000_000; // 1ms

/// The channel is closed; the unsent value is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> std::fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel closed")
    }
}

impl<T: std::fmt::Debug> std::error::Error for SendError<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

/// The channel is closed and drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvError;

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel closed")
    }
}

impl std::error::Error for RecvError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    senders: usize,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
}

/// Creates a bounded channel parked through `rt`.
pub fn channel<T>(rt: &Arc<dyn Runtime>, capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity >= 1, "channel capacity must be at least 1");
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
            senders: 1,
        }),
    });
    (
        Sender {
            shared: shared.clone(),
            rt: rt.clone(),
        },
        Receiver {
            shared,
            rt: rt.clone(),
        },
    )
}

pub struct Sender<T> {
    shared: Arc<Shared<T>>,
    rt: Arc<dyn Runtime>,
}

impl<T> Sender<T> {
    /// Non-blocking send. Never parks; the write pipeline's `inject` depends
    /// on this.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(TrySendError::Closed(value));
        }
        if inner.queue.len() >= inner.capacity {
            return Err(TrySendError::Full(value));
        }
        inner.queue.push_back(value);
        Ok(())
    }

    /// Blocking send; parks through the runtime while the channel is full.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut value = value;
        loop {
            match self.try_send(value) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(v)) => return Err(SendError(v)),
                Err(TrySendError::Full(v)) => {
                    value = v;
                    self.rt.sleep(PARK_INTERVAL);
                }
            }
        }
    }

    /// Closes the channel. Pending values remain receivable; subsequent sends
    /// fail.
    pub fn close(&self) {
        self.shared.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.inner.lock().senders += 1;
        Self {
            shared: self.shared.clone(),
            rt: self.rt.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.senders -= 1;
        if inner.senders == 0 {
            inner.closed = true;
        }
    }
}

pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
    rt: Arc<dyn Runtime>,
}

impl<T> Receiver<T> {
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.shared.inner.lock();
        if let Some(value) = inner.queue.pop_front() {
            return Ok(value);
        }
        if inner.closed {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Blocking receive; parks through the runtime while the channel is
    /// empty. Returns `Err` once the channel is closed and drained.
    pub fn recv(&self) -> Result<T, RecvError> {
        loop {
            match self.try_recv() {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Closed) => return Err(RecvError),
                Err(TryRecvError::Empty) => self.rt.sleep(PARK_INTERVAL),
            }
        }
    }

    /// Closes the channel from the receiving side: senders start failing
    /// immediately, queued values remain receivable.
    pub fn close(&self) {
        self.shared.inner.lock().closed = true;
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{go, SyntheticRuntime};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn values_cross_tasks_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        SyntheticRuntime::run(move |rt| {
            let (tx, rx) = channel::<u32>(&rt, 4);
            go(&rt, "producer", move || {
                for i in 0..16 {
                    tx.send(i).unwrap();
                }
                tx.close();
            });
            let seen = seen2.clone();
            go(&rt, "consumer", move || {
                while let Ok(v) = rx.recv() {
                    seen.lock().push(v);
                }
            });
        });
        assert_eq!(*seen.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn try_send_reports_full_without_parking() {
        let rt = SyntheticRuntime::run(|rt| {
            let (tx, _rx) = channel::<u8>(&rt, 1);
            go(&rt, "filler", move || {
                assert!(tx.try_send(1).is_ok());
                assert_eq!(tx.try_send(2), Err(TrySendError::Full(2)));
            });
        });
        // try_send never slept, so time never advanced.
        assert_eq!(rt.final_time(), 0);
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let tail = Arc::new(AtomicUsize::new(0));
        let tail2 = tail.clone();
        SyntheticRuntime::run(move |rt| {
            let (tx, rx) = channel::<usize>(&rt, 8);
            tx.send(7).unwrap();
            tx.send(8).unwrap();
            tx.close();
            assert!(tx.send(9).is_err());
            let tail = tail2.clone();
            go(&rt, "drainer", move || {
                assert_eq!(rx.recv(), Ok(7));
                assert_eq!(rx.recv(), Ok(8));
                assert_eq!(rx.recv(), Err(RecvError));
                tail.fetch_add(1, Ordering::SeqCst);
            });
        });
        assert_eq!(tail.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_last_sender_closes() {
        SyntheticRuntime::run(|rt| {
            let (tx, rx) = channel::<u8>(&rt, 1);
            let tx2 = tx.clone();
            drop(tx);
            go(&rt, "receiver", move || {
                assert_eq!(rx.recv(), Err(RecvError));
            });
            drop(tx2);
        });
    }

    #[test]
    fn blocked_sender_parks_and_resumes() {
        let rt = SyntheticRuntime::run(|rt| {
            let (tx, rx) = channel::<u8>(&rt, 1);
            go(&rt, "sender", move || {
                tx.send(1).unwrap();
                tx.send(2).unwrap(); // blocks until the receiver drains
            });
            go(&rt, "slow-receiver", {
                let rt = rt.clone();
                move || {
                    rt.sleep(1_000_000);
                    assert_eq!(rx.recv(), Ok(1));
                    assert_eq!(rx.recv(), Ok(2));
                }
            });
        });
        // The sender had to park at least once, so virtual time moved.
        assert!(rt.final_time() >= 1_000_000);
    }
}
