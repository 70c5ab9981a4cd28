//! Asynchronous, signal/timer-driven sampler (§4.F).
//!
//! [`AsyncSampler::tick`] is the only function in this crate that must be
//! async-signal-safe: no heap allocation, no logging, no locking that could
//! deadlock against a thread the signal preempted mid-lock. The format
//! buffer and thread directory are both pre-allocated in `start()` and only
//! ever borrowed from inside `tick` — see [`crate::format`] and
//! [`crate::directory::ThreadDirectory::name_of_no_alloc`].

use super::{SamplerConfig, SamplerCore, TimeMode};
use crate::clock;
use crate::directory::{ThreadDirectory, FALLBACK_NAME_CAPACITY};
use crate::error::{ProfilerError, Result};
use crate::format::format_stack_label;
use crate::host::{FrameObject, NativeFn, ProfiledRuntime, ThreadId};
use arrayvec::ArrayString;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Driven externally by a signal handler or interval timer calling
/// [`AsyncSampler::tick`] on whatever thread the runtime routes it to.
pub struct AsyncSampler {
    core: Arc<SamplerCore>,
    runtime: Arc<dyn ProfiledRuntime>,
    /// Built once in `start()` from the registry's signal-safe views and
    /// never rebuilt inside `tick` (§3, §4.F): rebuilding it per tick would
    /// mean allocating a fresh `HashMap` and cloning every thread name on
    /// the signal path, which is exactly the allocation `tick` must avoid.
    directory: UnsafeCell<Option<ThreadDirectory>>,
    /// Set only after `directory` has been written in `start()` (release
    /// ordering pairs with the acquire load in `tick`), so `tick` never
    /// observes a directory write in progress.
    directory_ready: AtomicBool,
}

// SAFETY: `directory` is written exactly once per `start()` call, by the
// single thread that won the `flags.try_enable()` race, strictly before
// `directory_ready` is stored with `Release` ordering. `tick` only ever
// reads `directory` after observing `directory_ready == true` with
// `Acquire` ordering, which happens-before that write. `stop()` spins until
// no `tick` is in flight before clearing `directory_ready`, so a `start()`
// that follows a `stop()` never overwrites `directory` while a previous
// tick is still reading it. See §5's single-writer tree/buffer discipline,
// applied here to the directory.
unsafe impl Sync for AsyncSampler {}

impl AsyncSampler {
    pub fn new(runtime: Arc<dyn ProfiledRuntime>, config: SamplerConfig) -> Result<Self> {
        Ok(AsyncSampler {
            core: Arc::new(SamplerCore::new(config)?),
            runtime,
            directory: UnsafeCell::new(None),
            directory_ready: AtomicBool::new(false),
        })
    }

    pub fn core(&self) -> &SamplerCore {
        &self.core
    }

    pub fn start(&self) -> Result<()> {
        if !self.core.flags.try_enable() {
            return Err(ProfilerError::AlreadyEnabled);
        }
        // SAFETY: this thread just won the enable race. `tick` bails out
        // immediately whenever `enabled()` is false, and the previous
        // `stop()` (the only way `enabled` could have gone back to false)
        // spins until no `tick` is in flight before returning, so no `tick`
        // can still be reading `directory` at this point.
        unsafe {
            *self.directory.get() = Some(ThreadDirectory::signal_safe(self.runtime.threads()));
        }
        self.directory_ready.store(true, Ordering::Release);
        self.core.record_start(clock::wall_us());
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        if !self.core.flags.try_disable() {
            return Err(ProfilerError::NotEnabled);
        }
        // A `tick` that already passed the `enabled()` check may still be
        // running `tick_body` against `directory`; wait for it to finish
        // before tearing the directory down, so a subsequent `start()`
        // can't overwrite `directory` out from under it (§5 single-writer
        // discipline, extended across the stop/start boundary).
        while self.core.flags.tick_in_progress() {
            std::hint::spin_loop();
        }
        self.directory_ready.store(false, Ordering::Release);
        self.core.record_stop(clock::wall_us());
        Ok(())
    }

    pub fn start_time(&self) -> u64 {
        self.core.start_time()
    }

    pub fn end_time(&self) -> u64 {
        self.core.end_time()
    }

    /// The thread id expected to invoke `tick` (skipped when folding other
    /// threads' stacks, same as the sync sampler skips its own worker).
    pub fn sampling_tid(&self) -> u64 {
        self.core.sampling_tid()
    }

    pub fn set_sampling_tid(&self, tid: u64) {
        self.core.set_sampling_tid(tid);
    }

    pub fn enabled(&self) -> bool {
        self.core.flags.enabled()
    }

    pub fn sampling_interval_us(&self) -> u64 {
        self.core.sampling_interval_us()
    }
    pub fn set_sampling_interval_us(&self, v: u64) {
        self.core.set_sampling_interval_us(v);
    }

    pub fn debug(&self) -> bool {
        self.core.flags.debug()
    }
    pub fn set_debug(&self, v: bool) {
        self.core.flags.set_debug(v);
    }

    pub fn ignore_frozen(&self) -> bool {
        self.core.flags.ignore_frozen()
    }
    pub fn set_ignore_frozen(&self, v: bool) {
        self.core.flags.set_ignore_frozen(v);
    }

    pub fn ignore_self(&self) -> bool {
        self.core.flags.ignore_self()
    }
    pub fn set_ignore_self(&self, v: bool) {
        self.core.flags.set_ignore_self(v);
    }

    pub fn tree_mode(&self) -> bool {
        self.core.flags.tree_mode()
    }
    pub fn set_tree_mode(&self, v: bool) {
        self.core.flags.set_tree_mode(v);
    }

    pub fn focus_mode(&self) -> bool {
        self.core.flags.focus_mode()
    }
    pub fn set_focus_mode(&self, v: bool) {
        self.core.flags.set_focus_mode(v);
    }

    /// `trace_cfunction` (§6): whether the native-call tracer is currently
    /// armed.
    pub fn trace_cfunction(&self) -> bool {
        self.core.flags.trace_native()
    }

    pub fn time_mode(&self) -> super::TimeMode {
        self.core.time_mode()
    }
    pub fn set_time_mode(&self, mode: super::TimeMode) {
        self.core.set_time_mode(mode);
    }

    pub fn set_regex_patterns(&self, patterns: &[String]) -> Result<()> {
        self.core.set_regex_patterns(patterns)
    }

    pub fn native_discount(&self) -> f64 {
        self.core.native_discount()
    }
    pub fn set_native_discount(&self, v: f64) -> Result<()> {
        self.core.set_native_discount(v)
    }

    pub fn sampler_life_time(&self) -> u64 {
        self.core.life_time()
    }
    pub fn acc_sampling_time(&self) -> u64 {
        self.core.acc_sampling_time()
    }
    pub fn sampling_times(&self) -> u64 {
        self.core.sampling_times()
    }

    pub fn clear(&self) -> Result<()> {
        self.core.clear()
    }

    pub fn dumps(&self) -> String {
        self.core.tree().dumps()
    }

    pub fn save(&self, path: &str) -> Result<()> {
        std::fs::write(path, self.dumps()).map_err(|source| ProfilerError::Io {
            path: path.to_string(),
            source,
        })
    }

    /// Arm the native-call tracer (§4.G, §6): installs the host's
    /// CALL/RETURN profile hook and sets `trace_native`. Requires the
    /// sampler to already be enabled.
    pub fn start_trace_cfunction(&self) -> Result<()> {
        self.core.arm_tracer()?;
        if !self.runtime.install_profile_hook() {
            self.core.flags.set_trace_native(false);
            return Err(ProfilerError::HostFailure("install_profile_hook"));
        }
        Ok(())
    }

    /// Disarm the native-call tracer, uninstalling the host's profile hook.
    pub fn stop_trace_cfunction(&self) -> Result<()> {
        self.core.disarm_tracer()?;
        self.runtime.uninstall_profile_hook();
        Ok(())
    }

    /// Forward the host's CALL hook for a native callee to the tracer.
    pub fn on_native_call(
        &self,
        thread_id: u64,
        thread_name: &str,
        caller_frame: &dyn FrameObject,
        native_fn: &dyn NativeFn,
    ) -> Result<()> {
        self.core.native_call(thread_id, thread_name, caller_frame, native_fn)
    }

    /// Forward the host's RETURN hook for a native callee to the tracer.
    pub fn on_native_return(&self, thread_id: u64) -> Result<()> {
        // SAFETY: same interpreter-level-lock argument as the sync
        // sampler's `on_native_return` (§4.F, §5): RETURN hooks are
        // delivered under the same lock `tick` runs under.
        unsafe { self.core.native_return(thread_id) }
    }

    /// One invocation of the async sampler (§4.F). `_signo` is accepted for
    /// API symmetry with a real signal handler registration but unused:
    /// this crate doesn't discriminate between signal numbers.
    ///
    /// Never allocates, never logs, never panics on the happy or
    /// reentrant-guard path. A formatting overflow silently drops that one
    /// sample (§7: "logs nothing... drops at most the in-progress sample").
    pub fn tick(&self, _signo: i32, main_frame: &dyn FrameObject) {
        if !self.core.flags.enabled() {
            return;
        }
        // `directory` is only written in `start()`, paired with this
        // acquire load: until it's visible, there is nothing to fold other
        // threads' stacks against, so drop the tick rather than race it.
        if !self.directory_ready.load(Ordering::Acquire) {
            return;
        }
        if !self.core.flags.try_begin_tick() {
            return;
        }

        self.tick_body(main_frame);

        self.core.flags.end_tick();
    }

    fn tick_body(&self, main_frame: &dyn FrameObject) {
        let t0 = match self.core.time_mode() {
            TimeMode::Cpu => clock::thread_cpu_us(),
            _ => clock::wall_us(),
        };

        let filter = self.core.filter_snapshot();
        // SAFETY: serialized by the `sampling_in_progress` guard in `tick`.
        let buf = unsafe { self.core.buffer_mut() };

        if let Ok(true) = format_stack_label("MainThread", main_frame, &filter, buf) {
            // SAFETY: `tree` and `buffer` are disjoint `UnsafeCell`s; see
            // the safety comment on `tick_body`'s `buf` borrow above.
            unsafe { self.core.tree_mut() }.insert(buf.as_str(), 1);
        }

        // SAFETY: `directory_ready` was observed `true` in `tick` with
        // `Acquire` ordering, which happens-after the `Release` store in
        // `start()` that followed the write below — see the struct-level
        // safety comment.
        let directory = unsafe { &*self.directory.get() }
            .as_ref()
            .expect("directory is Some whenever directory_ready is true");
        let mut name_scratch: ArrayString<FALLBACK_NAME_CAPACITY> = ArrayString::new();
        let sampler_tid = ThreadId(self.core.sampling_tid());
        for (tid, frame) in self.runtime.current_frames() {
            if tid == sampler_tid {
                continue;
            }
            let name = directory.name_of_no_alloc(tid, &mut name_scratch);
            if let Ok(true) = format_stack_label(name, frame.as_ref(), &filter, buf) {
                // SAFETY: see above.
                unsafe { self.core.tree_mut() }.insert(buf.as_str(), 1);
            }
        }

        let elapsed = match self.core.time_mode() {
            TimeMode::Cpu => clock::thread_cpu_us().saturating_sub(t0),
            _ => clock::wall_us().saturating_sub(t0),
        };
        self.core.record_tick(elapsed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{CodeObject, ThreadRegistry};

    struct FixedCode;
    impl CodeObject for FixedCode {
        fn filename(&self) -> &str {
            "main.py"
        }
        fn name(&self) -> &str {
            "loop"
        }
        fn first_line(&self) -> u32 {
            4
        }
    }

    struct FixedFrame;
    impl FrameObject for FixedFrame {
        fn code(&self) -> &dyn CodeObject {
            &FixedCode
        }
        fn current_line(&self) -> u32 {
            4
        }
        fn back(&self) -> Option<&dyn FrameObject> {
            None
        }
    }

    struct EmptyRegistry;
    impl ThreadRegistry for EmptyRegistry {
        fn enumerate(&self) -> Vec<(ThreadId, String)> {
            vec![]
        }
        fn active(&self) -> Vec<(ThreadId, String)> {
            vec![]
        }
        fn limbo(&self) -> Vec<(ThreadId, String)> {
            vec![]
        }
    }

    struct EmptyRuntime {
        registry: EmptyRegistry,
    }
    impl ProfiledRuntime for EmptyRuntime {
        fn current_frames(&self) -> Vec<(ThreadId, Box<dyn FrameObject + '_>)> {
            vec![]
        }
        fn threads(&self) -> &dyn ThreadRegistry {
            &self.registry
        }
        fn stdlib_path(&self) -> Option<String> {
            None
        }
    }

    fn sampler() -> AsyncSampler {
        AsyncSampler::new(
            Arc::new(EmptyRuntime {
                registry: EmptyRegistry,
            }),
            SamplerConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn tick_while_disabled_is_a_no_op() {
        let s = sampler();
        s.tick(0, &FixedFrame);
        assert_eq!(s.core().sampling_times(), 0);
        assert_eq!(s.dumps(), "");
    }

    #[test]
    fn tick_folds_the_main_frame() {
        let s = sampler();
        s.start().unwrap();
        s.tick(0, &FixedFrame);
        assert_eq!(s.core().sampling_times(), 1);
        assert_eq!(s.dumps(), "MainThread;main.py:loop:4 1");
    }

    #[test]
    fn reentrant_tick_is_a_no_op() {
        let s = sampler();
        s.start().unwrap();
        assert!(s.core().flags.try_begin_tick());
        s.tick(0, &FixedFrame);
        assert_eq!(s.core().sampling_times(), 0);
        assert_eq!(s.dumps(), "");
        s.core().flags.end_tick();
    }
}
