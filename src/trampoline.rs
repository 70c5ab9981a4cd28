//! Main-thread trampoline (§4.H): lets an out-of-band thread queue a
//! callable to run on the runtime's main thread.
//!
//! Built on `std::sync::mpsc` rather than a third-party channel crate,
//! matching the teacher's preference for `std`-provided concurrency
//! primitives wherever `std` already covers the need (an unbounded MPSC
//! queue is exactly "returns immediately, drained later").

use crate::error::{ProfilerError, Result};
use crate::host::MainThreadCall;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;

/// Queues [`MainThreadCall`]s for later invocation on the main thread.
///
/// `schedule` is callable from any thread and never blocks. `run_pending`
/// is meant to be called only from the main thread, at whatever checkpoint
/// the embedding runtime already visits between bytecode instructions.
pub struct Trampoline {
    tx: Sender<MainThreadCall>,
    rx: Mutex<Receiver<MainThreadCall>>,
}

impl Default for Trampoline {
    fn default() -> Self {
        Self::new()
    }
}

impl Trampoline {
    pub fn new() -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        Trampoline {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue `call` for later invocation on the main thread. Returns
    /// immediately; fails only if nothing will ever drain the queue again
    /// (the host has torn down its `run_pending` loop).
    pub fn schedule(&self, call: MainThreadCall) -> Result<()> {
        self.tx.send(call).map_err(|_| ProfilerError::HostUnavailable)
    }

    /// Drain and invoke every callable queued since the last call. Meant to
    /// be called from the main thread only; invoking callables that were
    /// queued by other threads is the entire point of the trampoline.
    pub fn run_pending(&self) {
        let rx = self.rx.lock().expect("trampoline receiver mutex poisoned");
        while let Ok(call) = rx.try_recv() {
            call();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn schedule_then_run_pending_invokes_in_order() {
        let trampoline = Trampoline::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            trampoline
                .schedule(Box::new(move || order.lock().unwrap().push(i)))
                .unwrap();
        }
        trampoline.run_pending();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn run_pending_with_nothing_queued_is_a_no_op() {
        let trampoline = Trampoline::new();
        trampoline.run_pending();
    }

    #[test]
    fn schedule_from_another_thread_is_drained_on_run_pending() {
        let trampoline = Arc::new(Trampoline::new());
        let count = Arc::new(AtomicUsize::new(0));

        let t = {
            let trampoline = Arc::clone(&trampoline);
            let count = Arc::clone(&count);
            std::thread::spawn(move || {
                trampoline
                    .schedule(Box::new(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    }))
                    .unwrap();
            })
        };
        t.join().unwrap();

        trampoline.run_pending();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
