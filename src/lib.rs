//! Sampling call-stack profiler for embeddable managed runtimes.
//!
//! Given a running multi-threaded target process, this crate periodically
//! snapshots every interpreter thread's call stack, folds the snapshots
//! into a prefix tree weighted by sample count, and emits the tree in a
//! flamegraph-compatible folded-stack format.
//!
//! The crate never assumes a specific interpreter: an embedder implements
//! [`host::ProfiledRuntime`] once and hands it to one of the two sampler
//! drivers.
//!
//! - [`sampler::sync::SyncSampler`] runs a dedicated background thread that
//!   sleeps between ticks — simplest to embed, pays one extra thread.
//! - [`sampler::async_tick::AsyncSampler`] is driven externally by a signal
//!   handler or interval timer calling `tick` — no extra thread, but every
//!   line through `tick` must be async-signal-safe.
//!
//! An optional native-call tracer ([`tracer::NativeCallTracer`]) attributes
//! time spent in calls that leave the interpreter, and
//! [`trampoline::Trampoline`] lets background threads queue work back onto
//! the runtime's main thread.
//!
//! ## Example
//!
//! ```rust
//! use stacksnap::host::{CodeObject, FrameObject, ProfiledRuntime, ThreadId, ThreadRegistry};
//! use stacksnap::sampler::{SamplerConfig, sync::SyncSampler};
//! use std::sync::Arc;
//!
//! struct Code;
//! impl CodeObject for Code {
//!     fn filename(&self) -> &str { "main.py" }
//!     fn name(&self) -> &str { "spin" }
//!     fn first_line(&self) -> u32 { 10 }
//! }
//!
//! struct Frame;
//! impl FrameObject for Frame {
//!     fn code(&self) -> &dyn CodeObject { &Code }
//!     fn current_line(&self) -> u32 { 10 }
//!     fn back(&self) -> Option<&dyn FrameObject> { None }
//! }
//!
//! struct Registry;
//! impl ThreadRegistry for Registry {
//!     fn enumerate(&self) -> Vec<(ThreadId, String)> { vec![(ThreadId(1), "MainThread".into())] }
//!     fn active(&self) -> Vec<(ThreadId, String)> { self.enumerate() }
//!     fn limbo(&self) -> Vec<(ThreadId, String)> { vec![] }
//! }
//!
//! struct Runtime { registry: Registry }
//! impl ProfiledRuntime for Runtime {
//!     fn current_frames(&self) -> Vec<(ThreadId, Box<dyn FrameObject + '_>)> {
//!         vec![(ThreadId(1), Box::new(Frame))]
//!     }
//!     fn threads(&self) -> &dyn ThreadRegistry { &self.registry }
//!     fn stdlib_path(&self) -> Option<String> { None }
//! }
//!
//! let runtime = Arc::new(Runtime { registry: Registry });
//! let sampler = SyncSampler::new(runtime, SamplerConfig {
//!     sampling_interval_us: 500,
//!     ..SamplerConfig::default()
//! }).unwrap();
//!
//! sampler.start().unwrap();
//! std::thread::sleep(std::time::Duration::from_millis(5));
//! sampler.stop().unwrap();
//!
//! println!("{}", sampler.dumps());
//! ```

pub mod clock;
pub mod directory;
pub mod error;
pub mod format;
pub mod host;
pub mod sampler;
pub mod stats;
pub mod tracer;
pub mod trampoline;
pub mod tree;

pub use error::{ProfilerError, Result};
pub use sampler::{async_tick::AsyncSampler, sync::SyncSampler, SamplerConfig, TimeMode};
pub use tree::StackTree;
