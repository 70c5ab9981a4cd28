//! Thread-directory helpers (§4.D): map a [`ThreadRegistry`] into
//! `tid -> name` lookups for the two sampler drivers.
//!
//! The synchronous sampler can afford [`ThreadRegistry::enumerate`], which
//! may allocate and take the registry's locks, and can afford to rebuild
//! its directory on every loop iteration. The asynchronous sampler cannot:
//! it only ever calls [`ThreadRegistry::active`] and
//! [`ThreadRegistry::limbo`], which the host contract requires to be
//! signal-safe, and it must build that snapshot exactly once, in `start()`
//! (§3, §4.F: "the threads-registry handle [is] pre-allocated in
//! `start`") — never inside `tick`, which [`ThreadDirectory::signal_safe`]
//! itself still allocates a `HashMap` to build. [`ThreadDirectory::name_of_no_alloc`]
//! is the only lookup safe to call from `tick` against that cached
//! snapshot: it borrows rather than clones, and falls back to a
//! stack-formatted name for a thread the cached snapshot doesn't know
//! about instead of allocating one.

use crate::format;
use crate::host::{ThreadId, ThreadRegistry};
use arrayvec::ArrayString;
use std::collections::HashMap;

/// Capacity of the stack-only fallback name [`ThreadDirectory::name_of_no_alloc`]
/// formats for a thread id absent from the cached snapshot (`"Thread-"` plus
/// up to 20 digits of a `u64`).
pub const FALLBACK_NAME_CAPACITY: usize = 32;

/// A snapshot of thread id → human name, built once per sampling pass (sync
/// path) or once per `start()` (async path).
pub struct ThreadDirectory {
    names: HashMap<ThreadId, String>,
}

impl ThreadDirectory {
    /// Build a directory via the registry's full (possibly locking,
    /// allocating) enumeration. Only call this off the signal path.
    pub fn enumerate(registry: &dyn ThreadRegistry) -> Self {
        ThreadDirectory {
            names: registry.enumerate().into_iter().collect(),
        }
    }

    /// Build a directory from only the active+limbo registry views, both of
    /// which the host contract requires to be safe to call from a signal
    /// handler. This constructor itself allocates (a `HashMap` plus a clone
    /// of every name) and must only be called from `start()`, never from
    /// `tick` (§4.F).
    pub fn signal_safe(registry: &dyn ThreadRegistry) -> Self {
        let mut names: HashMap<ThreadId, String> = registry.active().into_iter().collect();
        names.extend(registry.limbo());
        ThreadDirectory { names }
    }

    /// The human name registered for `tid`, or a synthetic fallback if the
    /// registry has no record (a thread that started after this directory
    /// snapshot was taken). Allocates; only for the synchronous sampler.
    pub fn name_of(&self, tid: ThreadId) -> String {
        self.names
            .get(&tid)
            .cloned()
            .unwrap_or_else(|| format!("Thread-{}", tid.0))
    }

    /// The async-tick-safe equivalent of [`ThreadDirectory::name_of`]:
    /// borrows the cached name instead of cloning it, and formats an
    /// unknown thread's fallback name into the caller-owned `scratch`
    /// buffer rather than a heap `String`. `scratch` is cleared and
    /// (re)written only on the fallback path, so the same buffer can be
    /// reused across every thread folded in one tick.
    pub fn name_of_no_alloc<'a>(
        &'a self,
        tid: ThreadId,
        scratch: &'a mut ArrayString<FALLBACK_NAME_CAPACITY>,
    ) -> &'a str {
        if let Some(name) = self.names.get(&tid) {
            return name.as_str();
        }
        scratch.clear();
        // A `FALLBACK_NAME_CAPACITY`-byte buffer always fits "Thread-" plus
        // 20 digits; these pushes cannot fail.
        let _ = format::push_str(scratch, "Thread-");
        let _ = format::push_u64(scratch, tid.0);
        scratch.as_str()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FakeRegistry {
        active: Vec<(ThreadId, String)>,
        limbo: Vec<(ThreadId, String)>,
        enumerate: Vec<(ThreadId, String)>,
    }

    impl ThreadRegistry for FakeRegistry {
        fn enumerate(&self) -> Vec<(ThreadId, String)> {
            self.enumerate.clone()
        }
        fn active(&self) -> Vec<(ThreadId, String)> {
            self.active.clone()
        }
        fn limbo(&self) -> Vec<(ThreadId, String)> {
            self.limbo.clone()
        }
    }

    #[test]
    fn enumerate_strategy_uses_full_enumeration() {
        let reg = FakeRegistry {
            active: vec![],
            limbo: vec![],
            enumerate: vec![(ThreadId(1), "MainThread".into())],
        };
        let dir = ThreadDirectory::enumerate(&reg);
        assert_eq!(dir.name_of(ThreadId(1)), "MainThread");
    }

    #[test]
    fn signal_safe_strategy_merges_active_and_limbo() {
        let reg = FakeRegistry {
            active: vec![(ThreadId(1), "MainThread".into())],
            limbo: vec![(ThreadId(2), "Worker-1".into())],
            enumerate: vec![],
        };
        let dir = ThreadDirectory::signal_safe(&reg);
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.name_of(ThreadId(1)), "MainThread");
        assert_eq!(dir.name_of(ThreadId(2)), "Worker-1");
    }

    #[test]
    fn unknown_thread_gets_synthetic_name() {
        let reg = FakeRegistry {
            active: vec![],
            limbo: vec![],
            enumerate: vec![],
        };
        let dir = ThreadDirectory::enumerate(&reg);
        assert_eq!(dir.name_of(ThreadId(42)), "Thread-42");
    }

    #[test]
    fn no_alloc_lookup_borrows_a_known_name() {
        let reg = FakeRegistry {
            active: vec![(ThreadId(1), "MainThread".into())],
            limbo: vec![],
            enumerate: vec![],
        };
        let dir = ThreadDirectory::signal_safe(&reg);
        let mut scratch = ArrayString::new();
        assert_eq!(dir.name_of_no_alloc(ThreadId(1), &mut scratch), "MainThread");
    }

    #[test]
    fn no_alloc_lookup_formats_unknown_thread_into_scratch() {
        let reg = FakeRegistry {
            active: vec![],
            limbo: vec![],
            enumerate: vec![],
        };
        let dir = ThreadDirectory::signal_safe(&reg);
        let mut scratch = ArrayString::new();
        assert_eq!(dir.name_of_no_alloc(ThreadId(42), &mut scratch), "Thread-42");
    }
}
