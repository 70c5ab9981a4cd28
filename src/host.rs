//! Host interfaces (§6): the contracts an embedding managed runtime must
//! implement for this crate to sample it.
//!
//! Everything in this module is a trait. The profiler never assumes a
//! specific interpreter; an embedder (e.g. a Python-like runtime, a bytecode
//! VM) provides one implementation of [`ProfiledRuntime`] and hands it to
//! the samplers. Every trait here is object-safe so a single boxed runtime
//! handle can be shared between the synchronous worker thread and the
//! async-signal `tick` callback without monomorphizing the sampler over a
//! concrete runtime type.

/// A thread identifier as seen by the embedding runtime.
///
/// Opaque beyond equality/ordering/hashing; the profiler never interprets
/// its bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Code-object introspection: the static half of a frame (§6.2).
pub trait CodeObject {
    /// Source file the code object was defined in.
    fn filename(&self) -> &str;

    /// Unqualified function/method name.
    fn name(&self) -> &str;

    /// Fully-qualified name (e.g. `Class.method`), when the runtime can
    /// produce one more precise than [`CodeObject::name`].
    fn qualified_name(&self) -> Option<&str> {
        None
    }

    /// Line the code object's definition starts on.
    fn first_line(&self) -> u32;
}

/// A single activation record in a frame chain (§6.2).
pub trait FrameObject {
    /// The code object this frame is executing.
    fn code(&self) -> &dyn CodeObject;

    /// The line currently executing within [`FrameObject::code`].
    fn current_line(&self) -> u32;

    /// The caller's frame, or `None` at the root of the chain.
    fn back(&self) -> Option<&dyn FrameObject>;
}

/// Registry of runtime threads (§4.D, §6.3-4).
pub trait ThreadRegistry {
    /// Synchronous enumeration of every thread the runtime knows about,
    /// mapped to its human-readable name. May allocate and take locks;
    /// only safe to call off the hot/signal path.
    fn enumerate(&self) -> Vec<(ThreadId, String)>;

    /// Threads that have fully started and registered themselves.
    /// Must not allocate or invoke user-level code; safe to call from a
    /// signal handler.
    fn active(&self) -> Vec<(ThreadId, String)>;

    /// Threads that are in the process of starting (registered but not
    /// yet fully initialized). Same signal-safety requirement as
    /// [`ThreadRegistry::active`].
    fn limbo(&self) -> Vec<(ThreadId, String)>;
}

/// A native (non-interpreted) callee the runtime's CALL/RETURN hooks report
/// (§4.G). Opaque beyond the two strings the tracer needs to synthesize a
/// frame label for it.
pub trait NativeFn {
    /// The module the native function is exposed under, e.g. a C extension
    /// module name.
    fn module_name(&self) -> &str;
    /// The native function's own name.
    fn native_name(&self) -> &str;
}

/// A deferred call queued via [`crate::trampoline::Trampoline::schedule`]
/// (§4.H).
pub type MainThreadCall = Box<dyn FnOnce() + Send>;

/// An object in a live-object listing handed to the object-statistics pass
/// (§4.I). The profiler never touches the object itself, only these two
/// introspected facts about it.
pub trait InspectedObject {
    /// The object's runtime type name.
    fn type_name(&self) -> &str;
    /// The object's size in bytes, when `include_memory` is requested.
    fn size_bytes(&self) -> u64 {
        0
    }
}

/// The full host contract (§6 "Host interfaces required").
///
/// An embedder implements this once per runtime and shares it (typically
/// behind an `Arc`) between the profiler's sync worker and async tick path.
pub trait ProfiledRuntime: Send + Sync {
    /// Snapshot of every thread's current leaf frame.
    ///
    /// An empty result is a host failure (§7): the embedder should only
    /// return an empty map if the runtime genuinely has no live threads,
    /// which the sampler treats identically to a failure since there is
    /// nothing to fold either way.
    fn current_frames(&self) -> Vec<(ThreadId, Box<dyn FrameObject + '_>)>;

    /// The runtime's thread registry.
    fn threads(&self) -> &dyn ThreadRegistry;

    /// One-time lookup of the runtime's standard-library install path, used
    /// by focus-mode filtering. Cached by the caller after the first call.
    fn stdlib_path(&self) -> Option<String>;

    /// Install a CALL/RETURN profile hook for native callees (§4.G).
    /// Returns `false` if the runtime doesn't support native-call tracing.
    fn install_profile_hook(&self) -> bool {
        false
    }

    /// Remove a previously installed profile hook.
    fn uninstall_profile_hook(&self) {}
}
