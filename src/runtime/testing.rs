//! Single-threaded test clock.
//!
//! `StepRuntime` satisfies [`Runtime`] for unit tests that exercise timing
//! arithmetic without any task machinery: `sleep` advances the clock
//! immediately and `spawn` runs the closure inline on the caller's thread.
//! For multi-task scenarios use [`SyntheticRuntime`](super::SyntheticRuntime).

use std::sync::atomic::{AtomicI64, Ordering};

use super::{Nanos, Runtime};

pub struct StepRuntime {
    now: AtomicI64,
}

impl StepRuntime {
    pub fn new() -> Self {
        Self {
            now: AtomicI64::new(0),
        }
    }

    pub fn starting_at(nanos: Nanos) -> Self {
        Self {
            now: AtomicI64::new(nanos),
        }
    }

    /// Moves the clock forward without a sleeping task.
    pub fn advance(&self, nanos: Nanos) {
        assert!(nanos >= 0, "advance with negative duration: {nanos}");
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Default for StepRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for StepRuntime {
    fn now(&self) -> Nanos {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, nanos: Nanos) {
        assert!(nanos >= 0, "sleep with negative duration: {nanos}");
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }

    fn spawn(&self, _name: &str, f: Box<dyn FnOnce() + Send + 'static>) {
        f();
    }

    fn join(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_advances_instantly() {
        let rt = StepRuntime::new();
        rt.sleep(250);
        rt.advance(50);
        assert_eq!(rt.now(), 300);
    }
}
