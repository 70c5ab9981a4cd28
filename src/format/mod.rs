//! Frame chain formatting and the focus/self/regex/frozen filter pipeline
//! (§4.C).
//!
//! The formatter never allocates on the heap: it writes into a caller-owned
//! [`FrameBuffer`], a fixed-capacity [`arrayvec::ArrayString`], and collects
//! the leaf→root chain into a fixed-capacity [`arrayvec::ArrayVec`] rather
//! than a growable `Vec`. That makes this module safe to call from the
//! asynchronous sampler's signal-handler path (§4.F), which must not
//! allocate.

use crate::host::{CodeObject, FrameObject};
use arrayvec::{ArrayString, ArrayVec};
use regex::Regex;
use std::sync::Arc;

/// Capacity of the scratch buffer a formatted stack label is written into.
/// Chosen to comfortably hold a few hundred frames of typical
/// `filename:qualified_name:lineno` labels; a chain that doesn't fit is a
/// hard failure (§4.C.6), not truncated.
pub const BUFFER_CAPACITY: usize = 16384;

/// Upper bound on frames collected from a single leaf→root walk before
/// formatting. Sized generously above realistic interpreter recursion
/// limits (a few hundred to a couple thousand frames); a chain deeper than
/// this is treated the same as a format-buffer overflow — the sample is
/// dropped, not truncated.
pub const MAX_FRAME_CHAIN: usize = 4096;

/// Non-reallocating scratch buffer a stack label is formatted into.
pub type FrameBuffer = ArrayString<BUFFER_CAPACITY>;

/// The formatted buffer would have overflowed [`BUFFER_CAPACITY`]. The
/// caller is expected to attach thread context and drop the sample
/// (`ProfilerError::BufferOverflow` on the synchronous path, a silent
/// early return on the asynchronous one).
#[derive(Debug)]
pub struct Overflow;

/// Filter and formatting configuration threaded through both samplers.
///
/// Constructed once (filters rarely change mid-run) and shared by reference;
/// the `regex` patterns are compiled at config time so `format_stack_label`
/// never compiles a pattern on the sampling path.
///
/// `regex_patterns` and `stdlib_path` are reference-counted rather than
/// owned so a fresh snapshot can be cloned out of the sampler on every tick
/// without allocating (§4.F's no-allocation-inside-`tick` contract):
/// cloning an `Arc` is just a refcount bump.
pub struct FilterConfig {
    pub focus_mode: bool,
    pub ignore_self: bool,
    pub ignore_frozen: bool,
    pub tree_mode: bool,
    pub regex_patterns: Arc<[Regex]>,
    pub stdlib_path: Option<Arc<str>>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            focus_mode: false,
            ignore_self: false,
            ignore_frozen: false,
            tree_mode: false,
            regex_patterns: Arc::from(Vec::new()),
            stdlib_path: None,
        }
    }
}

/// Markers identifying the profiler's own frames, for the `ignore-self`
/// filter. A frame is "self" if its filename contains an installed-package
/// directory for this crate or one of the known entrypoint binaries.
const SELF_MARKERS: [&str; 2] = ["/site-packages/stacksnap", "/bin/stacksnap"];

fn focus_mode_skip(filename: &str, cfg: &FilterConfig) -> bool {
    if !cfg.focus_mode {
        return false;
    }
    if filename.contains("site-packages/") {
        return true;
    }
    match &cfg.stdlib_path {
        Some(stdlib) => filename.starts_with(stdlib.as_ref()),
        None => false,
    }
}

fn ignore_self_skip(filename: &str, cfg: &FilterConfig) -> bool {
    cfg.ignore_self && SELF_MARKERS.iter().any(|marker| filename.contains(marker))
}

fn regex_skip(filename: &str, name: &str, cfg: &FilterConfig) -> bool {
    if cfg.regex_patterns.is_empty() {
        return false;
    }
    !cfg
        .regex_patterns
        .iter()
        .any(|re| re.is_match(filename) || re.is_match(name))
}

fn ignore_frozen_skip(filename: &str, cfg: &FilterConfig) -> bool {
    cfg.ignore_frozen && filename.starts_with("<frozen")
}

fn kept(filename: &str, name: &str, cfg: &FilterConfig) -> bool {
    !(focus_mode_skip(filename, cfg)
        || ignore_self_skip(filename, cfg)
        || regex_skip(filename, name, cfg)
        || ignore_frozen_skip(filename, cfg))
}

/// Push `s` into any fixed-capacity `ArrayString`, not just [`FrameBuffer`]:
/// also used by [`crate::directory`] to format a no-alloc fallback thread
/// name on the async tick path.
pub(crate) fn push_str<const N: usize>(buf: &mut ArrayString<N>, s: &str) -> Result<(), Overflow> {
    buf.try_push_str(s).map_err(|_| Overflow)
}

fn push_u32(buf: &mut FrameBuffer, n: u32) -> Result<(), Overflow> {
    push_u64(buf, n as u64)
}

/// itoa without allocating: format into a small stack array first. Shared
/// by [`push_u32`] and [`crate::directory`]'s no-alloc fallback thread-name
/// formatter, which needs the full `u64` range of a [`crate::host::ThreadId`].
pub(crate) fn push_u64<const N: usize>(buf: &mut ArrayString<N>, mut n: u64) -> Result<(), Overflow> {
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    if n == 0 {
        i -= 1;
        digits[i] = b'0';
    } else {
        while n > 0 {
            i -= 1;
            digits[i] = b'0' + (n % 10) as u8;
            n /= 10;
        }
    }
    // SAFETY: every byte written above is an ASCII digit.
    let s = std::str::from_utf8(&digits[i..]).expect("digits are ASCII");
    push_str(buf, s)
}

/// Format one frame's label (`filename:name:lineno`) into `buf`, honoring
/// [`FilterConfig::tree_mode`]'s choice between first-definition and
/// current line. Returns `Ok(true)` if the frame passed the filter
/// pipeline and was written, `Ok(false)` if it was filtered out.
fn format_one(frame: &dyn FrameObject, cfg: &FilterConfig, buf: &mut FrameBuffer) -> Result<bool, Overflow> {
    let code = frame.code();
    let filename = code.filename();
    let name = code.qualified_name().unwrap_or_else(|| code.name());

    if !kept(filename, name, cfg) {
        return Ok(false);
    }

    let lineno = if cfg.tree_mode {
        frame.current_line()
    } else {
        code.first_line()
    };

    push_str(buf, filename)?;
    push_str(buf, ":")?;
    push_str(buf, name)?;
    push_str(buf, ":")?;
    push_u32(buf, lineno)?;
    Ok(true)
}

/// Walk `leaf`'s frame chain to the root, apply the filter pipeline
/// (§4.C: focus → self → regex → frozen, in that fixed order) to each
/// frame, and write the surviving frames root-first as
/// `thread_name;f0;f1;...;fn` into `buf`.
///
/// Returns `Ok(true)` if at least one frame survived filtering (a
/// non-empty stack part, per §4.E's fold condition), `Ok(false)` if every
/// frame was filtered out, leaving only the thread name.
pub fn format_stack_label(
    thread_name: &str,
    leaf: &dyn FrameObject,
    cfg: &FilterConfig,
    buf: &mut FrameBuffer,
) -> Result<bool, Overflow> {
    buf.clear();
    push_str(buf, thread_name)?;

    let mut chain: ArrayVec<&dyn FrameObject, MAX_FRAME_CHAIN> = ArrayVec::new();
    let mut cur = Some(leaf);
    while let Some(f) = cur {
        chain.try_push(f).map_err(|_| Overflow)?;
        cur = f.back();
    }

    let mut any = false;
    // `chain` was collected leaf-first; walk it back-to-front for root-first
    // output without reversing it in place.
    for frame in chain.iter().rev() {
        let mark = buf.len();
        push_str(buf, ";")?;
        if format_one(*frame, cfg, buf)? {
            any = true;
        } else {
            buf.truncate(mark);
        }
    }
    Ok(any)
}

#[cfg(test)]
mod test {
    use super::*;

    struct TestCode {
        filename: &'static str,
        name: &'static str,
        first_line: u32,
    }

    impl CodeObject for TestCode {
        fn filename(&self) -> &str {
            self.filename
        }
        fn name(&self) -> &str {
            self.name
        }
        fn first_line(&self) -> u32 {
            self.first_line
        }
    }

    struct TestFrame {
        code: TestCode,
        current_line: u32,
        back: Option<Box<TestFrame>>,
    }

    impl FrameObject for TestFrame {
        fn code(&self) -> &dyn CodeObject {
            &self.code
        }
        fn current_line(&self) -> u32 {
            self.current_line
        }
        fn back(&self) -> Option<&dyn FrameObject> {
            self.back.as_deref().map(|f| f as &dyn FrameObject)
        }
    }

    fn chain() -> TestFrame {
        TestFrame {
            code: TestCode {
                filename: "main.py",
                name: "bar",
                first_line: 3,
            },
            current_line: 4,
            back: Some(Box::new(TestFrame {
                code: TestCode {
                    filename: "main.py",
                    name: "foo",
                    first_line: 1,
                },
                current_line: 1,
                back: None,
            })),
        }
    }

    #[test]
    fn formats_root_first_with_thread_prefix() {
        let leaf = chain();
        let cfg = FilterConfig::default();
        let mut buf = FrameBuffer::new();
        let any = format_stack_label("MainThread", &leaf, &cfg, &mut buf).unwrap();
        assert!(any);
        assert_eq!(buf.as_str(), "MainThread;main.py:foo:1;main.py:bar:3");
    }

    #[test]
    fn tree_mode_uses_current_line() {
        let leaf = chain();
        let cfg = FilterConfig {
            tree_mode: true,
            ..FilterConfig::default()
        };
        let mut buf = FrameBuffer::new();
        format_stack_label("T", &leaf, &cfg, &mut buf).unwrap();
        assert_eq!(buf.as_str(), "T;main.py:foo:1;main.py:bar:4");
    }

    #[test]
    fn ignore_frozen_drops_frozen_frames() {
        let leaf = TestFrame {
            code: TestCode {
                filename: "<frozen importlib._bootstrap>",
                name: "_find",
                first_line: 10,
            },
            current_line: 10,
            back: None,
        };
        let cfg = FilterConfig {
            ignore_frozen: true,
            ..FilterConfig::default()
        };
        let mut buf = FrameBuffer::new();
        let any = format_stack_label("T", &leaf, &cfg, &mut buf).unwrap();
        assert!(!any);
        assert_eq!(buf.as_str(), "T");
    }

    #[test]
    fn focus_mode_drops_stdlib_and_site_packages() {
        let leaf = TestFrame {
            code: TestCode {
                filename: "/usr/lib/python3.11/os.py",
                name: "stat",
                first_line: 5,
            },
            current_line: 5,
            back: Some(Box::new(TestFrame {
                code: TestCode {
                    filename: "/app/site-packages/requests/api.py",
                    name: "get",
                    first_line: 7,
                },
                current_line: 7,
                back: Some(Box::new(TestFrame {
                    code: TestCode {
                        filename: "main.py",
                        name: "run",
                        first_line: 1,
                    },
                    current_line: 1,
                    back: None,
                })),
            })),
        };
        let cfg = FilterConfig {
            focus_mode: true,
            stdlib_path: Some(Arc::from("/usr/lib/python3.11")),
            ..FilterConfig::default()
        };
        let mut buf = FrameBuffer::new();
        let any = format_stack_label("T", &leaf, &cfg, &mut buf).unwrap();
        assert!(any);
        assert_eq!(buf.as_str(), "T;main.py:run:1");
    }

    #[test]
    fn regex_filter_keeps_only_matching_frames() {
        let leaf = TestFrame {
            code: TestCode {
                filename: "main.py",
                name: "hot_path",
                first_line: 1,
            },
            current_line: 1,
            back: Some(Box::new(TestFrame {
                code: TestCode {
                    filename: "util.py",
                    name: "cold_path",
                    first_line: 1,
                },
                current_line: 1,
                back: None,
            })),
        };
        let cfg = FilterConfig {
            regex_patterns: Arc::from(vec![Regex::new("hot_path").unwrap()]),
            ..FilterConfig::default()
        };
        let mut buf = FrameBuffer::new();
        format_stack_label("T", &leaf, &cfg, &mut buf).unwrap();
        assert_eq!(buf.as_str(), "T;main.py:hot_path:1");
    }

    #[test]
    fn filter_idempotence() {
        let leaf = chain();
        let cfg = FilterConfig::default();
        let mut a = FrameBuffer::new();
        let mut b = FrameBuffer::new();
        format_stack_label("T", &leaf, &cfg, &mut a).unwrap();
        format_stack_label("T", &leaf, &cfg, &mut b).unwrap();
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn overflow_is_reported_not_truncated() {
        struct HugeCode(String);
        impl CodeObject for HugeCode {
            fn filename(&self) -> &str {
                &self.0
            }
            fn name(&self) -> &str {
                "f"
            }
            fn first_line(&self) -> u32 {
                1
            }
        }
        struct HugeFrame(HugeCode);
        impl FrameObject for HugeFrame {
            fn code(&self) -> &dyn CodeObject {
                &self.0
            }
            fn current_line(&self) -> u32 {
                1
            }
            fn back(&self) -> Option<&dyn FrameObject> {
                None
            }
        }
        let frame = HugeFrame(HugeCode("x".repeat(BUFFER_CAPACITY * 2)));
        let cfg = FilterConfig::default();
        let mut buf = FrameBuffer::new();
        let err = format_stack_label("T", &frame, &cfg, &mut buf);
        assert!(err.is_err());
    }

    #[test]
    fn chain_deeper_than_capacity_is_reported_not_truncated() {
        struct DeepFrame {
            code: TestCode,
            back: Option<Box<DeepFrame>>,
        }
        impl FrameObject for DeepFrame {
            fn code(&self) -> &dyn CodeObject {
                &self.code
            }
            fn current_line(&self) -> u32 {
                1
            }
            fn back(&self) -> Option<&dyn FrameObject> {
                self.back.as_deref().map(|f| f as &dyn FrameObject)
            }
        }

        let mut leaf = DeepFrame {
            code: TestCode {
                filename: "main.py",
                name: "f",
                first_line: 1,
            },
            back: None,
        };
        for _ in 0..MAX_FRAME_CHAIN {
            leaf = DeepFrame {
                code: TestCode {
                    filename: "main.py",
                    name: "f",
                    first_line: 1,
                },
                back: Some(Box::new(leaf)),
            };
        }

        let cfg = FilterConfig::default();
        let mut buf = FrameBuffer::new();
        let err = format_stack_label("T", &leaf, &cfg, &mut buf);
        assert!(err.is_err());
    }
}
