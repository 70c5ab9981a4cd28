//! Synchronous (worker-thread) sampler (§4.E): sleep, snapshot every
//! thread, fold, repeat — grounded on the teacher's dedicated-thread
//! sampling loop (`count::Counter`/`sample::Sampler` pairing a background
//! thread with a shared, single-writer-disciplined buffer).

use super::{SamplerConfig, SamplerCore, TimeMode};
use crate::clock;
use crate::directory::ThreadDirectory;
use crate::error::{ProfilerError, Result};
use crate::format::format_stack_label;
use crate::host::{FrameObject, NativeFn, ProfiledRuntime, ThreadId};
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Returns the calling thread's OS thread id. Used only to keep the
/// sampler worker thread from folding its own stack into the tree — the
/// host's `ThreadId` numbering is assumed to align with OS tids, which
/// holds for every embedding runtime in the pack that exposes native
/// thread identity at all.
fn os_tid() -> u64 {
    // SAFETY: `gettid` takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// A background thread that periodically snapshots and folds every
/// runtime thread's call stack.
pub struct SyncSampler {
    core: Arc<SamplerCore>,
    runtime: Arc<dyn ProfiledRuntime>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sampler_tid: AtomicU64,
}

impl SyncSampler {
    pub fn new(runtime: Arc<dyn ProfiledRuntime>, config: SamplerConfig) -> Result<Self> {
        Ok(SyncSampler {
            core: Arc::new(SamplerCore::new(config)?),
            runtime,
            worker: Mutex::new(None),
            sampler_tid: AtomicU64::new(0),
        })
    }

    pub fn core(&self) -> &SamplerCore {
        &self.core
    }

    /// `sampling_thread` (§6): the OS tid of the worker, valid only while
    /// enabled.
    pub fn sampling_thread(&self) -> u64 {
        self.sampler_tid.load(Ordering::SeqCst)
    }

    /// `enabled` (§6): whether the sampler is currently running.
    pub fn enabled(&self) -> bool {
        self.core.flags.enabled()
    }

    /// `sampling_interval_us` getter (§6).
    pub fn sampling_interval_us(&self) -> u64 {
        self.core.sampling_interval_us()
    }

    /// `sampling_interval_us` setter (§6).
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
    /// armed. Toggled only via [`SyncSampler::start_trace_cfunction`]/
    /// [`SyncSampler::stop_trace_cfunction`], not a plain setter, since
    /// arming also installs the host's profile hook.
    pub fn trace_cfunction(&self) -> bool {
        self.core.flags.trace_native()
    }

    pub fn time_mode(&self) -> super::TimeMode {
        self.core.time_mode()
    }
    pub fn set_time_mode(&self, mode: super::TimeMode) {
        self.core.set_time_mode(mode);
    }

    /// `regex_patterns` setter (§6). Only permitted while disabled.
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

    pub fn start(&self) -> Result<()> {
        if !self.core.flags.try_enable() {
            return Err(ProfilerError::AlreadyEnabled);
        }

        let core = Arc::clone(&self.core);
        let runtime = Arc::clone(&self.runtime);
        let tid_slot = &self.sampler_tid as *const AtomicU64 as usize;

        let handle = std::thread::spawn(move || {
            let tid_slot = tid_slot as *const AtomicU64;
            // SAFETY: `self` (and hence `sampler_tid`) outlives this
            // thread: `stop()` always joins it before returning.
            let tid_slot = unsafe { &*tid_slot };
            let my_tid = os_tid();
            tid_slot.store(my_tid, Ordering::SeqCst);
            core.record_start(clock::wall_us());
            sampling_loop(&core, runtime.as_ref(), ThreadId(my_tid));
        });

        *self.worker.lock().expect("sampler worker mutex poisoned") = Some(handle);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        if !self.core.flags.try_disable() {
            return Err(ProfilerError::NotEnabled);
        }
        if let Some(handle) = self.worker.lock().expect("sampler worker mutex poisoned").take() {
            let _ = handle.join();
        }
        self.core.record_stop(clock::wall_us());
        Ok(())
    }

    /// Block until the worker thread has exited, if one is running.
    pub fn join_sampling_thread(&self) -> Result<()> {
        if self.core.flags.enabled() {
            return Err(ProfilerError::NotEnabled);
        }
        if let Some(handle) = self.worker.lock().expect("sampler worker mutex poisoned").take() {
            let _ = handle.join();
        }
        Ok(())
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
        // SAFETY: the host only delivers CALL/RETURN hooks while holding
        // its own interpreter-level lock, the same lock the sampling loop
        // releases only across `sleep` (§4.E, §5) — so a RETURN fold here
        // never overlaps the loop's own tree writes.
        unsafe { self.core.native_return(thread_id) }
    }
}

fn sampling_loop(core: &SamplerCore, runtime: &dyn ProfiledRuntime, sampler_tid: ThreadId) {
    while core.flags.enabled() {
        std::thread::sleep(Duration::from_micros(core.sampling_interval_us().max(1)));
        if !core.flags.enabled() {
            break;
        }

        let t0 = match core.time_mode() {
            TimeMode::Cpu => clock::thread_cpu_us(),
            _ => clock::wall_us(),
        };

        let frames = runtime.current_frames();
        if frames.is_empty() {
            warn!("stacksnap: host returned no frames this tick");
        }
        let directory = ThreadDirectory::enumerate(runtime.threads());
        let filter = core.filter_snapshot();

        for (tid, frame) in &frames {
            if *tid == sampler_tid {
                continue;
            }
            let name = directory.name_of(*tid);
            // SAFETY: this loop is the sync sampler's single writer body.
            let buf = unsafe { core.buffer_mut() };
            match format_stack_label(&name, frame.as_ref(), &filter, buf) {
                Ok(true) => {
                    let label = buf.as_str().to_string();
                    // SAFETY: see above.
                    unsafe { core.tree_mut() }.insert(&label, 1);
                }
                Ok(false) => {}
                Err(_) => {
                    warn!("stacksnap: dropped sample for thread {}: format buffer overflow", tid.0);
                }
            }
        }

        let elapsed = match core.time_mode() {
            TimeMode::Cpu => clock::thread_cpu_us().saturating_sub(t0),
            _ => clock::wall_us().saturating_sub(t0),
        };
        core.record_tick(elapsed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{CodeObject, FrameObject, ThreadRegistry};

    struct FixedCode;
    impl CodeObject for FixedCode {
        fn filename(&self) -> &str {
            "main.py"
        }
        fn name(&self) -> &str {
            "spin"
        }
        fn first_line(&self) -> u32 {
            10
        }
    }

    struct FixedFrame;
    impl FrameObject for FixedFrame {
        fn code(&self) -> &dyn CodeObject {
            &FixedCode
        }
        fn current_line(&self) -> u32 {
            10
        }
        fn back(&self) -> Option<&dyn FrameObject> {
            None
        }
    }

    struct FixedRegistry;
    impl ThreadRegistry for FixedRegistry {
        fn enumerate(&self) -> Vec<(ThreadId, String)> {
            vec![(ThreadId(99), "Worker".into())]
        }
        fn active(&self) -> Vec<(ThreadId, String)> {
            self.enumerate()
        }
        fn limbo(&self) -> Vec<(ThreadId, String)> {
            vec![]
        }
    }

    struct FixedRuntime {
        registry: FixedRegistry,
    }

    impl ProfiledRuntime for FixedRuntime {
        fn current_frames(&self) -> Vec<(ThreadId, Box<dyn FrameObject + '_>)> {
            vec![(ThreadId(99), Box::new(FixedFrame))]
        }
        fn threads(&self) -> &dyn ThreadRegistry {
            &self.registry
        }
        fn stdlib_path(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn start_stop_cycle_accumulates_samples() {
        let _ = env_logger::try_init();
        let runtime = Arc::new(FixedRuntime {
            registry: FixedRegistry,
        });
        let config = SamplerConfig {
            sampling_interval_us: 1_000,
            ..SamplerConfig::default()
        };
        let sampler = SyncSampler::new(runtime, config).unwrap();

        sampler.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        sampler.stop().unwrap();

        assert!(sampler.core().sampling_times() > 0);
        assert!(sampler.dumps().contains("Worker;main.py:spin:10"));
    }

    #[test]
    fn start_twice_fails() {
        let runtime = Arc::new(FixedRuntime {
            registry: FixedRegistry,
        });
        let sampler = SyncSampler::new(runtime, SamplerConfig::default()).unwrap();
        sampler.start().unwrap();
        assert!(matches!(sampler.start(), Err(ProfilerError::AlreadyEnabled)));
        sampler.stop().unwrap();
    }

    #[test]
    fn stop_without_start_fails() {
        let runtime = Arc::new(FixedRuntime {
            registry: FixedRegistry,
        });
        let sampler = SyncSampler::new(runtime, SamplerConfig::default()).unwrap();
        assert!(matches!(sampler.stop(), Err(ProfilerError::NotEnabled)));
    }
}
