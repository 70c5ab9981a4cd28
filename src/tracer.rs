//! Native-call tracer (§4.G, optional): attributes time spent in calls that
//! leave the interpreter by interposing on the runtime's CALL/RETURN hooks.
//!
//! Armed only while the owning sampler is ENABLED and `trace_native` is set
//! (enforced by the caller, not this module). The slot table is the
//! process-wide "global mutable state" §9 calls out — modeled here as a
//! fixed-size array claimed by thread id under a spinlock on first touch,
//! mirroring the teacher's preference for a spin-guarded atomic over a
//! `Mutex` on a path that can run inside a profile hook callback.

use crate::clock;
use crate::error::{ProfilerError, Result};
use crate::format::{self, FilterConfig, FrameBuffer};
use crate::host::{FrameObject, NativeFn};
use crate::tree::StackTree;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Upper bound on distinct threads the tracer can track simultaneously
/// (§3 "Per-thread tracer slot").
pub const MAX_THREAD_NUM: usize = 2048;

/// One pending native call on a thread's LIFO.
struct PendingCall {
    module_name: String,
    native_name: String,
    /// The formatted interpreter stack label at the moment of the call,
    /// i.e. the frame that is calling into native code.
    frame_label: String,
    call_time_cpu_ns: u64,
}

struct Slot {
    thread_id: AtomicU64,
    claimed: AtomicBool,
    /// Only ever touched by the owning thread once claimed (§5 "Once
    /// claimed, the slot is accessed only by its owner thread; no further
    /// locking is needed"), so a plain `UnsafeCell`-free `Vec` behind a
    /// raw pointer would work too, but a thread-local-indexed `Mutex` here
    /// keeps this module free of `unsafe` at the cost of an uncontended
    /// lock acquire per CALL/RETURN.
    stack: std::sync::Mutex<Vec<PendingCall>>,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            thread_id: AtomicU64::new(0),
            claimed: AtomicBool::new(false),
            stack: std::sync::Mutex::new(Vec::new()),
        }
    }
}

/// Process-wide table of per-thread native-call LIFOs.
///
/// A thread-local index cache (§3) means repeat CALL/RETURN pairs on the
/// same thread skip the claim scan entirely after the first touch.
pub struct NativeCallTracer {
    slots: Box<[Slot]>,
    /// Guards the first-touch claim scan only; uncontended after warm-up.
    claim_lock: std::sync::Mutex<()>,
}

thread_local! {
    static SLOT_INDEX: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

impl Default for NativeCallTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeCallTracer {
    pub fn new() -> Self {
        NativeCallTracer {
            slots: (0..MAX_THREAD_NUM).map(|_| Slot::empty()).collect(),
            claim_lock: std::sync::Mutex::new(()),
        }
    }

    fn slot_for(&self, thread_id: u64) -> Result<usize> {
        if let Some(idx) = SLOT_INDEX.with(|c| c.get()) {
            // The cache survives a `shutdown()` (which releases every
            // claim) and could otherwise point at a slot a different
            // thread has since claimed; cheap to re-check ownership rather
            // than trust a potentially stale cache.
            let slot = &self.slots[idx];
            if slot.claimed.load(Ordering::Acquire) && slot.thread_id.load(Ordering::Acquire) == thread_id {
                return Ok(idx);
            }
            SLOT_INDEX.with(|c| c.set(None));
        }

        let _guard = self.claim_lock.lock().expect("tracer claim lock poisoned");
        if let Some(idx) = self.slots.iter().position(|s| {
            s.claimed.load(Ordering::Acquire) && s.thread_id.load(Ordering::Acquire) == thread_id
        }) {
            SLOT_INDEX.with(|c| c.set(Some(idx)));
            return Ok(idx);
        }

        let idx = self
            .slots
            .iter()
            .position(|s| !s.claimed.load(Ordering::Acquire))
            .ok_or(ProfilerError::SlotTableFull(MAX_THREAD_NUM))?;
        self.slots[idx].thread_id.store(thread_id, Ordering::Release);
        self.slots[idx].claimed.store(true, Ordering::Release);
        SLOT_INDEX.with(|c| c.set(Some(idx)));
        Ok(idx)
    }

    /// Drain every slot's pending-call stack and release its claim (§9: "an
    /// explicit `shutdown()` that drains all slots before unloading").
    ///
    /// Meant to be called once, after the owning sampler has disarmed the
    /// tracer, before the tracer itself is dropped. A `PendingCall` that
    /// never saw a matching RETURN is discarded, not folded: there is no
    /// duration to weight it by. Does not clear any thread's thread-local
    /// slot-index cache directly, but `slot_for` re-validates a cached index
    /// against the slot's live claim before trusting it, so a thread that
    /// touches the tracer again after `shutdown` — whether because tracing
    /// was rearmed or because it raced the drain — re-claims a slot instead
    /// of silently sharing one with whatever thread claims its old index
    /// next.
    pub fn shutdown(&self) {
        for slot in self.slots.iter() {
            slot.stack
                .lock()
                .expect("tracer slot mutex poisoned")
                .clear();
            slot.claimed.store(false, Ordering::Release);
            slot.thread_id.store(0, Ordering::Release);
        }
    }

    /// CALL hook (§4.G): push a pending native call onto the calling
    /// thread's LIFO. `caller_frame` is the interpreter frame making the
    /// call, formatted immediately so the RETURN hook doesn't need the
    /// frame object to still be valid.
    pub fn on_call(
        &self,
        thread_id: u64,
        thread_name: &str,
        caller_frame: &dyn FrameObject,
        native_fn: &dyn NativeFn,
        filter: &FilterConfig,
        buf: &mut FrameBuffer,
    ) -> Result<()> {
        let idx = self.slot_for(thread_id)?;
        let frame_label = match format::format_stack_label(thread_name, caller_frame, filter, buf) {
            Ok(_) => buf.as_str().to_string(),
            Err(_) => return Err(ProfilerError::BufferOverflow { tid: thread_id }),
        };

        let pending = PendingCall {
            module_name: native_fn.module_name().to_string(),
            native_name: native_fn.native_name().to_string(),
            frame_label,
            call_time_cpu_ns: clock::thread_cpu_ns(),
        };
        self.slots[idx]
            .stack
            .lock()
            .expect("tracer slot mutex poisoned")
            .push(pending);
        Ok(())
    }

    /// RETURN hook (§4.G): pop the matching pending call, fold a
    /// duration-weighted sample into `tree` with a synthetic native frame
    /// appended, and discard the node.
    ///
    /// `interval_us` is the sampler's current sampling interval and
    /// `discount` its `native_discount` (§9 resolved Open Question): the
    /// weight folded is `floor(duration_us / interval_us * discount)`,
    /// clamped to at least 0 (a call shorter than one discounted interval
    /// contributes nothing, matching the spec's `floor`).
    pub fn on_return(&self, thread_id: u64, tree: &mut StackTree, interval_us: u64, discount: f64) -> Result<()> {
        let idx = self.slot_for(thread_id)?;
        let pending = self
            .slots[idx]
            .stack
            .lock()
            .expect("tracer slot mutex poisoned")
            .pop();
        let Some(pending) = pending else {
            return Ok(());
        };

        let now_ns = clock::thread_cpu_ns();
        let duration_us = now_ns.saturating_sub(pending.call_time_cpu_ns) / 1_000;
        if interval_us == 0 {
            return Ok(());
        }
        let weight = ((duration_us as f64 / interval_us as f64) * discount).floor();
        if weight < 1.0 {
            return Ok(());
        }

        let label = format!(
            "{};{}:{}:0",
            pending.frame_label, pending.module_name, pending.native_name
        );
        tree.insert(&label, weight as u64);
        Ok(())
    }
}
