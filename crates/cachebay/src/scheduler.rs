//! The microtask-scheduling seam (`spec.md` §5, §9 "Microtask batching").
//!
//! `spec.md` abstracts batching as "a deferred flush token: a single
//! scheduled drain per engine ... implementations may map this to
//! event-loop microtasks, a run-loop, or an explicit driver tick." This
//! workspace's usual pattern for "run this soon" primitives is a
//! target-gated split: a native backend pulled in on
//! `cfg(not(target_arch = "wasm32"))` and a wasm backend behind the same
//! public surface on `cfg(target_arch = "wasm32")`. `Scheduler` mirrors
//! that shape for cachebay's `Store::flush` deferral.

use std::sync::Arc;

/// Schedules a closure to run "soon" — the next microtask, the next Tokio
/// task poll, or (for [`immediate`]) right now. `Store` holds exactly one
/// `Arc<dyn Scheduler>` and uses it to defer the first pending-change
/// notification in a batch (`spec.md` §4.2 "Change delivery").
pub trait Scheduler: Send + Sync {
    fn schedule(&self, f: Box<dyn FnOnce() + Send>);
}

/// Runs the scheduled closure inline, synchronously. Used by
/// `Store::flush()` to force a synchronous drain (`spec.md` §9), and as
/// the default for server-side rendering / tests where there is no
/// surrounding event loop to defer onto.
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, f: Box<dyn FnOnce() + Send>) {
        f();
    }
}

pub fn immediate() -> Arc<dyn Scheduler> {
    Arc::new(ImmediateScheduler)
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::tokio_scheduler;

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use super::Scheduler;
    use std::sync::Arc;

    /// Schedules onto the ambient Tokio runtime (`spec.md` §9's "single
    /// scheduled microtask drain", mapped to `tokio::task::spawn`).
    pub struct TokioScheduler;

    impl Scheduler for TokioScheduler {
        fn schedule(&self, f: Box<dyn FnOnce() + Send>) {
            tokio::task::spawn(async move { f() });
        }
    }

    pub fn tokio_scheduler() -> Arc<dyn Scheduler> {
        Arc::new(TokioScheduler)
    }
}

#[cfg(target_arch = "wasm32")]
pub use wasm::wasm_scheduler;

#[cfg(target_arch = "wasm32")]
mod wasm {
    use super::Scheduler;
    use std::sync::Arc;

    /// Schedules via `wasm_bindgen_futures::spawn_local`, the same
    /// dependency choice `moire-wasm` makes for "run this on the next
    /// microtask" inside a browser event loop.
    pub struct WasmScheduler;

    impl Scheduler for WasmScheduler {
        fn schedule(&self, f: Box<dyn FnOnce() + Send>) {
            wasm_bindgen_futures::spawn_local(async move { f() });
        }
    }

    pub fn wasm_scheduler() -> Arc<dyn Scheduler> {
        Arc::new(WasmScheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn immediate_runs_synchronously() {
        let ran = Arc::new(AtomicBool::new(false));
        let scheduler = immediate();
        let flag = ran.clone();
        scheduler.schedule(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }
}
