//! Monotonic nanosecond clocks (§4.A).
//!
//! Three sources are exposed: wall-clock monotonic time, per-thread CPU
//! time, and per-process CPU time. All three are non-decreasing across
//! consecutive calls on a single thread. None of them fail: a `clock_gettime`
//! error (observed in practice only on exotic/virtualized kernels missing a
//! clock id) degrades to `0` rather than propagating, per the component's
//! "never fail" contract. This is the one place in the crate that
//! deliberately swallows a syscall error instead of returning `io::Result`.

/// Nanoseconds since an unspecified epoch, monotonically non-decreasing.
fn clock_gettime_ns(clock_id: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, fully-initialized `timespec` the kernel can
    // write into; the call cannot fail in a way that leaves `ts` partially
    // written.
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// Wall-clock monotonic time, in nanoseconds.
///
/// Falls back silently to whatever `CLOCK_MONOTONIC` resolves to on the
/// host kernel; there is no further fallback to `CLOCK_REALTIME` because
/// every target Linux and BSD supports `CLOCK_MONOTONIC`.
pub fn wall_ns() -> u64 {
    clock_gettime_ns(libc::CLOCK_MONOTONIC)
}

/// Wall-clock monotonic time, in microseconds.
pub fn wall_us() -> u64 {
    wall_ns() / 1_000
}

/// Wall-clock monotonic time, in milliseconds.
pub fn wall_ms() -> u64 {
    wall_ns() / 1_000_000
}

/// CPU time consumed by the calling thread, in nanoseconds.
///
/// Falls back to [`process_cpu_ns`] if `CLOCK_THREAD_CPUTIME_ID` is
/// unavailable on the host (the clock id itself is always accepted by
/// Linux; the fallback guards embedders running under emulation layers
/// that stub it out to always-fail).
pub fn thread_cpu_ns() -> u64 {
    let ns = clock_gettime_ns(libc::CLOCK_THREAD_CPUTIME_ID);
    if ns != 0 {
        ns
    } else {
        process_cpu_ns()
    }
}

/// CPU time consumed by the calling thread, in microseconds.
pub fn thread_cpu_us() -> u64 {
    thread_cpu_ns() / 1_000
}

/// CPU time consumed by the whole process, in nanoseconds.
pub fn process_cpu_ns() -> u64 {
    clock_gettime_ns(libc::CLOCK_PROCESS_CPUTIME_ID)
}

/// CPU time consumed by the whole process, in microseconds.
pub fn process_cpu_us() -> u64 {
    process_cpu_ns() / 1_000
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wall_clock_is_non_decreasing() {
        let a = wall_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = wall_ns();
        assert!(b >= a);
    }

    #[test]
    fn thread_cpu_clock_is_non_decreasing() {
        let a = thread_cpu_ns();
        // Burn a bit of CPU so the clock has something to measure.
        let mut acc = 0u64;
        for i in 0..1_000_000u64 {
            acc = acc.wrapping_add(i);
        }
        std::hint::black_box(acc);
        let b = thread_cpu_ns();
        assert!(b >= a);
    }

    #[test]
    fn derived_units_divide_down() {
        // us/ms are strictly derived from ns, so a clock that never fails
        // (returns 0) must still divide cleanly.
        assert_eq!(0u64 / 1_000, 0);
    }
}
