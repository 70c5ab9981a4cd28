//! Error kinds surfaced by the profiler's synchronous entry points.
//!
//! The asynchronous [`tick`][crate::sampler::async_tick] path never returns
//! any of these: async-signal-safety rules out both allocation and
//! propagation, so it drops the in-progress sample and returns instead.

use thiserror::Error;

/// Errors returned by the profiler's synchronous API.
///
/// Every variant preserves the invariant that counters and tree state are
/// left unchanged on failure (§7 propagation policy).
#[derive(Debug, Error)]
pub enum ProfilerError {
    /// `start()` was called while the sampler was already enabled.
    #[error("sampler is already enabled")]
    AlreadyEnabled,

    /// `stop()`, `join_sampling_thread()`, or a tracer method that requires
    /// an active sampler was called while the sampler was disabled.
    #[error("sampler is not enabled")]
    NotEnabled,

    /// `start_trace_cfunction()`/`stop_trace_cfunction()` called in a state
    /// that doesn't permit the transition (e.g. tracer already armed).
    #[error("native-call tracer is already {0}")]
    TracerState(&'static str),

    /// A property setter received an out-of-range or otherwise invalid
    /// value (e.g. a negative interval, a `native_discount` outside
    /// `(0.0, 1.0]`).
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    /// The 16 KiB formatting buffer would have overflowed; the sample that
    /// triggered this is dropped, not truncated.
    #[error("frame label for thread {tid} overflowed the format buffer")]
    BufferOverflow { tid: u64 },

    /// The per-thread native-call slot table has no room for a new thread
    /// (`MAX_THREAD_NUM` slots are all claimed).
    #[error("native-call tracer slot table is full ({0} slots claimed)")]
    SlotTableFull(usize),

    /// The host runtime's frame enumeration, thread enumeration, or name
    /// lookup returned nothing when a result was expected.
    #[error("host interface `{0}` returned no data")]
    HostFailure(&'static str),

    /// `save()` could not write the folded-stack dump to the given path.
    #[error("failed to write dump to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The main-thread trampoline's receiving end was dropped (host shut
    /// down) before a scheduled callable could run.
    #[error("main-thread trampoline is no longer being drained by the host")]
    HostUnavailable,
}

pub type Result<T> = std::result::Result<T, ProfilerError>;
