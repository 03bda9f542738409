//! Time and task capability shared by production and simulation.
//!
//! Protocol code never reads the clock or spawns a task directly: it holds an
//! `Arc<dyn Runtime>` and goes through it for `now`, `sleep` and `spawn`. In
//! production this is [`RealRuntime`] (OS threads, monotonic clock); in tests
//! it is [`SyntheticRuntime`], which advances a virtual clock only when every
//! live task is parked. Both present the same surface, so the protocol is
//! oblivious to which regime it runs under.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

mod synthetic;
pub mod sync;
pub mod testing;

pub use synthetic::SyntheticRuntime;

/// Nanoseconds, the unit of all runtime timestamps and durations.
///
/// Signed so that "no estimate yet" sentinels and interval arithmetic stay in
/// one domain.
pub type Nanos = i64;

pub const NANOS_PER_SEC: Nanos = 1_000_000_000;

/// Capability for reading time and running tasks.
///
/// All methods may be called from any task. `sleep` is the only suspension
/// point the runtime itself provides; channel and mutex waits elsewhere in the
/// crate are built on top of it.
pub trait Runtime: Send + Sync + 'static {
    /// Current time in nanoseconds since the runtime's epoch.
    fn now(&self) -> Nanos;

    /// Blocks the calling task until `now() + nanos`.
    ///
    /// A negative duration is a programmer error and panics.
    fn sleep(&self, nanos: Nanos);

    /// Registers and starts a new task running `f`.
    fn spawn(&self, name: &str, f: Box<dyn FnOnce() + Send + 'static>);

    /// Blocks until every spawned task has terminated.
    fn join(&self);
}

/// Spawns a closure without the `Box` noise at call sites.
pub fn go<F>(rt: &Arc<dyn Runtime>, name: &str, f: F)
where
    F: FnOnce() + Send + 'static,
{
    rt.spawn(name, Box::new(f));
}

/// Production runtime: OS threads and the monotonic clock.
pub struct RealRuntime {
    epoch: Instant,
    live: Arc<TaskCensus>,
}

struct TaskCensus {
    count: Mutex<usize>,
    all_done: Condvar,
}

impl RealRuntime {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            live: Arc::new(TaskCensus {
                count: Mutex::new(0),
                all_done: Condvar::new(),
            }),
        }
    }
}

impl Default for RealRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for RealRuntime {
    fn now(&self) -> Nanos {
        self.epoch.elapsed().as_nanos() as Nanos
    }

    fn sleep(&self, nanos: Nanos) {
        assert!(nanos >= 0, "sleep with negative duration: {nanos}");
        std::thread::sleep(Duration::from_nanos(nanos as u64));
    }

    fn spawn(&self, name: &str, f: Box<dyn FnOnce() + Send + 'static>) {
        *self.live.count.lock() += 1;
        let census = self.live.clone();
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                f();
                let mut count = census.count.lock();
                *count -= 1;
                if *count == 0 {
                    census.all_done.notify_all();
                }
            })
            .expect("failed to spawn runtime task thread");
    }

    fn join(&self) {
        let mut count = self.live.count.lock();
        while *count > 0 {
            self.live.all_done.wait(&mut count);
        }
    }
}
