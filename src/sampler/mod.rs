//! Shared state between the two sampler drivers (§4.E, §4.F): flags,
//! validated configuration, counters, the owned [`StackTree`], and the
//! reusable format buffer.
//!
//! [`SamplerCore`] follows the teacher's `count::Counter` shape: the
//! frequently-mutated, single-writer-at-a-time state (the tree, the format
//! buffer) lives behind [`std::cell::UnsafeCell`] rather than a `Mutex`,
//! with a manual `unsafe impl Sync` justified by the tree-mutation
//! discipline of §5 ("only one sampler body writes to it at a time") —
//! exactly the trade the teacher makes for `Counter::attr`/`read_buf`.
//! Properties that must stay visible across threads without a lock
//! (`enabled`, the numeric knobs) are plain atomics instead.

pub mod async_tick;
pub mod sync;

use crate::error::{ProfilerError, Result};
use crate::format::{FilterConfig, FrameBuffer};
use crate::host::{FrameObject, NativeFn};
use crate::tracer::NativeCallTracer;
use crate::tree::StackTree;
use regex::Regex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Which clock a sampler charges sample duration against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    Cpu,
    Wall,
    Null,
}

impl TimeMode {
    fn to_u8(self) -> u8 {
        match self {
            TimeMode::Cpu => 0,
            TimeMode::Wall => 1,
            TimeMode::Null => 2,
        }
    }

    fn from_u8(v: u8) -> TimeMode {
        match v {
            0 => TimeMode::Cpu,
            2 => TimeMode::Null,
            _ => TimeMode::Wall,
        }
    }
}

/// Construction-time knobs, validated once by [`SamplerConfig::validate`]
/// (mirrors the teacher's `config::Opts`, generalized from one struct of
/// raw flags into a small set of typed fields plus the bitset the sampler
/// actually runs on).
pub struct SamplerConfig {
    pub sampling_interval_us: u64,
    pub time_mode: TimeMode,
    pub trace_native: bool,
    pub ignore_frozen: bool,
    pub ignore_self: bool,
    pub tree_mode: bool,
    pub focus_mode: bool,
    pub debug: bool,
    /// Discount applied to native-call durations before folding (§4.G,
    /// §9 resolved Open Question). Must be in `(0.0, 1.0]`.
    pub native_discount: f64,
    pub regex_patterns: Vec<String>,
    pub stdlib_path: Option<String>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            sampling_interval_us: 1_000,
            time_mode: TimeMode::Wall,
            trace_native: false,
            ignore_frozen: false,
            ignore_self: false,
            tree_mode: false,
            focus_mode: false,
            debug: false,
            native_discount: 0.8,
            regex_patterns: Vec::new(),
            stdlib_path: None,
        }
    }
}

impl SamplerConfig {
    fn validate(&self) -> Result<()> {
        if !(self.native_discount > 0.0 && self.native_discount <= 1.0) {
            return Err(ProfilerError::InvalidValue {
                field: "native_discount",
                reason: format!("must be in (0.0, 1.0], got {}", self.native_discount),
            });
        }
        for pattern in &self.regex_patterns {
            Regex::new(pattern).map_err(|e| ProfilerError::InvalidValue {
                field: "regex_patterns",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn compile_regex(&self) -> Result<Vec<Regex>> {
        self.regex_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ProfilerError::InvalidValue {
                    field: "regex_patterns",
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

/// Atomically-backed flag word (§9 "Dynamic dispatch → flags + variants").
/// Each flag is its own `AtomicBool` rather than packed bits: the sampler
/// checks at most a handful of these per frame, so there's nothing to gain
/// from bit-packing, and giving each flag its own getter/setter rules out
/// the source's "wrong bit" getter bug (§9 Open Question, resolved).
pub struct SamplerFlags {
    enabled: AtomicBool,
    sampling_in_progress: AtomicBool,
    debug: AtomicBool,
    ignore_frozen: AtomicBool,
    ignore_self: AtomicBool,
    tree_mode: AtomicBool,
    focus_mode: AtomicBool,
    trace_native: AtomicBool,
}

impl SamplerFlags {
    fn new(cfg: &SamplerConfig) -> Self {
        SamplerFlags {
            enabled: AtomicBool::new(false),
            sampling_in_progress: AtomicBool::new(false),
            debug: AtomicBool::new(cfg.debug),
            ignore_frozen: AtomicBool::new(cfg.ignore_frozen),
            ignore_self: AtomicBool::new(cfg.ignore_self),
            tree_mode: AtomicBool::new(cfg.tree_mode),
            focus_mode: AtomicBool::new(cfg.focus_mode),
            trace_native: AtomicBool::new(cfg.trace_native),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Atomically flip `disabled -> enabled`. Returns `false` (no-op) if
    /// already enabled, so `start()` has a single source of truth for the
    /// "already enabled" error instead of a racy load-then-store.
    pub fn try_enable(&self) -> bool {
        self.enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Atomically flip `enabled -> disabled`. Returns `false` if it was
    /// already disabled.
    pub fn try_disable(&self) -> bool {
        self.enabled
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Reentrancy guard for the asynchronous sampler (§4.F, §8
    /// "Reentrancy"). Returns `true` if this call claimed the guard
    /// (`tick` may proceed), `false` if another `tick` is already
    /// in-flight.
    pub fn try_begin_tick(&self) -> bool {
        self.sampling_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_tick(&self) {
        self.sampling_in_progress.store(false, Ordering::SeqCst);
    }

    /// Whether a `tick` is currently between `try_begin_tick` and
    /// `end_tick`. Used by the asynchronous sampler's `stop()` to wait out
    /// an in-flight tick before tearing down the cached thread directory.
    pub fn tick_in_progress(&self) -> bool {
        self.sampling_in_progress.load(Ordering::SeqCst)
    }

    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::SeqCst)
    }
    pub fn set_debug(&self, v: bool) {
        self.debug.store(v, Ordering::SeqCst)
    }
    pub fn ignore_frozen(&self) -> bool {
        self.ignore_frozen.load(Ordering::SeqCst)
    }
    pub fn set_ignore_frozen(&self, v: bool) {
        self.ignore_frozen.store(v, Ordering::SeqCst)
    }
    pub fn ignore_self(&self) -> bool {
        self.ignore_self.load(Ordering::SeqCst)
    }
    pub fn set_ignore_self(&self, v: bool) {
        self.ignore_self.store(v, Ordering::SeqCst)
    }
    pub fn tree_mode(&self) -> bool {
        self.tree_mode.load(Ordering::SeqCst)
    }
    pub fn set_tree_mode(&self, v: bool) {
        self.tree_mode.store(v, Ordering::SeqCst)
    }
    pub fn focus_mode(&self) -> bool {
        self.focus_mode.load(Ordering::SeqCst)
    }
    pub fn set_focus_mode(&self, v: bool) {
        self.focus_mode.store(v, Ordering::SeqCst)
    }
    pub fn trace_native(&self) -> bool {
        self.trace_native.load(Ordering::SeqCst)
    }
    pub fn set_trace_native(&self, v: bool) {
        self.trace_native.store(v, Ordering::SeqCst)
    }
}

#[derive(Default)]
struct SamplerStats {
    sampling_times: AtomicU64,
    acc_sampling_time: AtomicU64,
    life_time: AtomicU64,
    start: AtomicU64,
    end: AtomicU64,
    sampling_tid: AtomicU64,
}

/// Shared engine behind [`sync::SyncSampler`] and
/// [`async_tick::AsyncSampler`].
pub struct SamplerCore {
    pub flags: SamplerFlags,
    interval_us: AtomicU64,
    native_discount_bits: AtomicU64,
    time_mode: AtomicU8,
    /// Set once at construction, read-only thereafter (§5 "Shared
    /// resources"): no synchronization needed.
    stdlib_path: Option<Arc<str>>,
    /// Mutable only while the sampler is disabled; protected by that
    /// discipline rather than a lock, like `tree`/`buffer` below.
    regex: UnsafeCell<Arc<[Regex]>>,
    tree: UnsafeCell<StackTree>,
    buffer: UnsafeCell<FrameBuffer>,
    stats: SamplerStats,
    tracer: NativeCallTracer,
}

// SAFETY: `tree`, `buffer`, and `regex` are mutated only by the single
// active sampler body (the sync worker thread, or a `tick` serialized by
// `sampling_in_progress`), and only ever read concurrently with that same
// discipline (dumps/property reads after `stop()`). See §5.
unsafe impl Sync for SamplerCore {}

impl SamplerCore {
    pub fn new(config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        let regex = config.compile_regex()?;
        let flags = SamplerFlags::new(&config);
        Ok(SamplerCore {
            interval_us: AtomicU64::new(config.sampling_interval_us),
            native_discount_bits: AtomicU64::new(config.native_discount.to_bits()),
            time_mode: AtomicU8::new(config.time_mode.to_u8()),
            stdlib_path: config.stdlib_path.map(|s| Arc::from(s.as_str())),
            regex: UnsafeCell::new(Arc::from(regex)),
            tree: UnsafeCell::new(StackTree::new()),
            buffer: UnsafeCell::new(FrameBuffer::new()),
            flags,
            stats: SamplerStats::default(),
            tracer: NativeCallTracer::new(),
        })
    }

    pub fn sampling_interval_us(&self) -> u64 {
        self.interval_us.load(Ordering::SeqCst)
    }

    pub fn set_sampling_interval_us(&self, v: u64) {
        self.interval_us.store(v, Ordering::SeqCst);
    }

    pub fn native_discount(&self) -> f64 {
        f64::from_bits(self.native_discount_bits.load(Ordering::SeqCst))
    }

    pub fn set_native_discount(&self, v: f64) -> Result<()> {
        if !(v > 0.0 && v <= 1.0) {
            return Err(ProfilerError::InvalidValue {
                field: "native_discount",
                reason: format!("must be in (0.0, 1.0], got {v}"),
            });
        }
        self.native_discount_bits.store(v.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    pub fn time_mode(&self) -> TimeMode {
        TimeMode::from_u8(self.time_mode.load(Ordering::SeqCst))
    }

    pub fn set_time_mode(&self, mode: TimeMode) {
        self.time_mode.store(mode.to_u8(), Ordering::SeqCst);
    }

    /// Replace the compiled regex filter list. Only permitted while the
    /// sampler is disabled, since `regex` is read without synchronization
    /// from the active sampling path (§5 tree/buffer mutation discipline
    /// applies here too).
    pub fn set_regex_patterns(&self, patterns: &[String]) -> Result<()> {
        if self.flags.enabled() {
            return Err(ProfilerError::TracerState("enabled"));
        }
        let compiled: Result<Vec<Regex>> = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ProfilerError::InvalidValue {
                    field: "regex_patterns",
                    reason: e.to_string(),
                })
            })
            .collect();
        // SAFETY: caller has verified the sampler is disabled, so nothing
        // else is reading `regex` concurrently.
        unsafe {
            *self.regex.get() = Arc::from(compiled?);
        }
        Ok(())
    }

    pub fn sampling_times(&self) -> u64 {
        self.stats.sampling_times.load(Ordering::SeqCst)
    }

    pub fn acc_sampling_time(&self) -> u64 {
        self.stats.acc_sampling_time.load(Ordering::SeqCst)
    }

    pub fn life_time(&self) -> u64 {
        self.stats.life_time.load(Ordering::SeqCst)
    }

    pub fn sampling_tid(&self) -> u64 {
        self.stats.sampling_tid.load(Ordering::SeqCst)
    }

    pub fn set_sampling_tid(&self, tid: u64) {
        self.stats.sampling_tid.store(tid, Ordering::SeqCst);
    }

    pub fn start_time(&self) -> u64 {
        self.stats.start.load(Ordering::SeqCst)
    }

    pub fn end_time(&self) -> u64 {
        self.stats.end.load(Ordering::SeqCst)
    }

    fn record_start(&self, now: u64) {
        self.stats.start.store(now, Ordering::SeqCst);
        self.stats.end.store(0, Ordering::SeqCst);
        self.stats.sampling_times.store(0, Ordering::SeqCst);
        self.stats.acc_sampling_time.store(0, Ordering::SeqCst);
    }

    fn record_stop(&self, now: u64) {
        self.stats.end.store(now, Ordering::SeqCst);
        let life = now.saturating_sub(self.stats.start.load(Ordering::SeqCst));
        self.stats.life_time.store(life, Ordering::SeqCst);
    }

    /// Account for one completed sampling iteration (§4.E: `sampling_times`
    /// counts every loop head, `acc_sampling_time` accumulates the wall/CPU
    /// cost of the snapshot-and-fold phase only, excluding the sleep).
    fn record_tick(&self, elapsed_us: u64) {
        self.stats.sampling_times.fetch_add(1, Ordering::SeqCst);
        self.stats
            .acc_sampling_time
            .fetch_add(elapsed_us, Ordering::SeqCst);
    }

    /// A lightweight, allocation-free filter snapshot (§4.F): cloning the
    /// two `Arc`s inside is just a refcount bump, safe to call from `tick`.
    pub fn filter_snapshot(&self) -> FilterConfig {
        FilterConfig {
            focus_mode: self.flags.focus_mode(),
            ignore_self: self.flags.ignore_self(),
            ignore_frozen: self.flags.ignore_frozen(),
            tree_mode: self.flags.tree_mode(),
            // SAFETY: only ever written while disabled (see
            // `set_regex_patterns`), so this read never races a writer.
            regex_patterns: unsafe { (*self.regex.get()).clone() },
            stdlib_path: self.stdlib_path.clone(),
        }
    }

    /// # Safety
    /// The caller must uphold the single-writer discipline of §5: this may
    /// only be called from the sampler's own body (sync worker loop, or a
    /// `tick` serialized by the reentrancy guard).
    pub unsafe fn tree_mut(&self) -> &mut StackTree {
        &mut *self.tree.get()
    }

    pub fn tree(&self) -> &StackTree {
        // SAFETY: shared read access; caller (dumps/save) is documented to
        // require the sampler be stopped first (§4.E).
        unsafe { &*self.tree.get() }
    }

    /// # Safety
    /// Same discipline as [`SamplerCore::tree_mut`].
    pub unsafe fn buffer_mut(&self) -> &mut FrameBuffer {
        &mut *self.buffer.get()
    }

    pub fn clear(&self) -> Result<()> {
        if self.flags.enabled() {
            return Err(ProfilerError::TracerState("enabled"));
        }
        // SAFETY: sampler is disabled, no concurrent reader/writer.
        unsafe {
            *self.tree.get() = StackTree::new();
        }
        self.stats.sampling_times.store(0, Ordering::SeqCst);
        self.stats.acc_sampling_time.store(0, Ordering::SeqCst);
        self.stats.life_time.store(0, Ordering::SeqCst);
        self.stats.start.store(0, Ordering::SeqCst);
        self.stats.end.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Flip `trace_native` on, the flag-only half of
    /// `start_trace_cfunction()` (§6). The sampler wrapper is responsible
    /// for also installing the host's profile hook; this only guards
    /// against arming twice or arming while disabled.
    pub fn arm_tracer(&self) -> Result<()> {
        if !self.flags.enabled() {
            return Err(ProfilerError::NotEnabled);
        }
        if self.flags.trace_native() {
            return Err(ProfilerError::TracerState("already armed"));
        }
        self.flags.set_trace_native(true);
        Ok(())
    }

    /// Flip `trace_native` off, the flag-only half of
    /// `stop_trace_cfunction()` (§6), and drain the tracer's slot table
    /// (§9 "an explicit `shutdown()` that drains all slots before
    /// unloading"): any call that was seen but never returned while tracing
    /// was armed has nothing left to attribute a duration to.
    pub fn disarm_tracer(&self) -> Result<()> {
        if !self.flags.trace_native() {
            return Err(ProfilerError::TracerState("not armed"));
        }
        self.flags.set_trace_native(false);
        self.tracer.shutdown();
        Ok(())
    }

    /// CALL hook (§4.G): record a pending native call on `thread_id`'s
    /// LIFO. A no-op (not an error) while the tracer isn't armed, since the
    /// host may keep its profile hook installed slightly longer than the
    /// armed window.
    pub fn native_call(
        &self,
        thread_id: u64,
        thread_name: &str,
        caller_frame: &dyn FrameObject,
        native_fn: &dyn NativeFn,
    ) -> Result<()> {
        if !self.flags.trace_native() {
            return Ok(());
        }
        let filter = self.filter_snapshot();
        // A call/return pair uses its own stack-local buffer rather than
        // the sampler's shared `buffer`: CALL/RETURN hooks can fire on any
        // thread concurrently with the sampler body, and the shared buffer
        // is documented non-reentrant (§5).
        let mut buf = FrameBuffer::new();
        self.tracer
            .on_call(thread_id, thread_name, caller_frame, native_fn, &filter, &mut buf)
    }

    /// RETURN hook (§4.G): fold the matching pending call's
    /// duration-weighted sample into the tree.
    ///
    /// # Safety
    /// The host only delivers CALL/RETURN hooks while holding its own
    /// interpreter-level lock, the same lock the sampling loop releases
    /// only across `sleep`/between ticks (§4.E, §5) — so this never races
    /// the owning sampler body's own tree writes. The caller is
    /// responsible for upholding that contract.
    pub unsafe fn native_return(&self, thread_id: u64) -> Result<()> {
        if !self.flags.trace_native() {
            return Ok(());
        }
        let interval = self.sampling_interval_us();
        let discount = self.native_discount();
        self.tracer
            .on_return(thread_id, self.tree_mut(), interval, discount)
    }
}
