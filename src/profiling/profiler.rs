//! Span recorder behind the `profiling` feature.
//!
//! Spans are RAII guards. Each OS thread gets a stable logical thread ID so
//! rayon workers show up as separate tracks.

use std::borrow::Cow;
use std::path::Path;

#[cfg(feature = "profiling")]
mod enabled {
    use std::fs::File;
    use std::io::{BufWriter, Write};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::OnceLock;
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;

    enum TraceEvent {
        Complete {
            name: Cow<'static, str>,
            ts_us: u64,
            dur_us: u64,
            tid: u64,
            args: Vec<(&'static str, super::Arg)>,
        },
        ThreadName {
            tid: u64,
            name: String,
        },
    }

    struct ProfilerState {
        start: Instant,
        out_path: PathBuf,
        is_on: AtomicBool,
        events: Mutex<Vec<TraceEvent>>,
    }

    static STATE: OnceLock<ProfilerState> = OnceLock::new();
    static NEXT_TID: AtomicU64 = AtomicU64::new(1);

    thread_local! {
        static TID: u64 = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    }

    fn active() -> Option<&'static ProfilerState> {
        STATE.get().filter(|st| st.is_on.load(Ordering::Acquire))
    }

    fn tid() -> u64 {
        TID.with(|t| *t)
    }

    /// Starts recording; the trace is written to `path` on [`shutdown`].
    pub fn init<P: AsRef<Path>>(path: P) {
        let _ = STATE.set(ProfilerState {
            start: Instant::now(),
            out_path: path.as_ref().to_path_buf(),
            is_on: AtomicBool::new(true),
            events: Mutex::new(Vec::new()),
        });
    }

    /// Stops recording and writes the trace file.
    pub fn shutdown() {
        if let Some(st) = STATE.get() {
            st.is_on.store(false, Ordering::Release);
            if let Err(e) = write_trace_file(st) {
                tracing::error!(error = %e, path = %st.out_path.display(), "failed to write trace");
            }
        }
    }

    /// Names the calling thread's track.
    pub fn thread_name(name: impl Into<String>) {
        if let Some(st) = active() {
            st.events.lock().push(TraceEvent::ThreadName { tid: tid(), name: name.into() });
        }
    }

    /// Opens a span closed when the guard drops.
    pub fn span(name: impl Into<Cow<'static, str>>) -> SpanGuard {
        match active() {
            Some(st) => SpanGuard {
                name: name.into(),
                ts0: st.start.elapsed().as_micros() as u64,
                args: Vec::new(),
                active: true,
            },
            None => SpanGuard { name: Cow::Borrowed(""), ts0: 0, args: Vec::new(), active: false },
        }
    }

    /// Records a complete event on drop.
    pub struct SpanGuard {
        name: Cow<'static, str>,
        ts0: u64,
        args: Vec<(&'static str, super::Arg)>,
        active: bool,
    }

    impl SpanGuard {
        /// Attaches an argument (builder-style).
        #[inline]
        pub fn arg(mut self, key: &'static str, value: super::Arg) -> Self {
            if self.active {
                self.args.push((key, value));
            }
            self
        }
    }

    impl Drop for SpanGuard {
        fn drop(&mut self) {
            if !self.active {
                return;
            }
            let Some(st) = active() else { return };
            let ts1 = st.start.elapsed().as_micros() as u64;
            st.events.lock().push(TraceEvent::Complete {
                name: std::mem::take(&mut self.name),
                ts_us: self.ts0,
                dur_us: ts1.saturating_sub(self.ts0),
                tid: tid(),
                args: std::mem::take(&mut self.args),
            });
        }
    }

    fn write_trace_file(st: &ProfilerState) -> std::io::Result<()> {
        let events = std::mem::take(&mut *st.events.lock());

        if let Some(parent) = st.out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut w = BufWriter::new(File::create(&st.out_path)?);

        write!(w, "{{\"traceEvents\":[")?;
        for (i, ev) in events.into_iter().enumerate() {
            if i > 0 {
                write!(w, ",")?;
            }
            match ev {
                TraceEvent::Complete { name, ts_us, dur_us, tid, args } => {
                    write!(w, "{{\"name\":")?;
                    write_json_string(&mut w, &name)?;
                    write!(
                        w,
                        ",\"cat\":\"residency\",\"ph\":\"X\",\"ts\":{ts_us},\"dur\":{dur_us},\"pid\":1,\"tid\":{tid}"
                    )?;
                    if !args.is_empty() {
                        write!(w, ",\"args\":{{")?;
                        for (j, (k, v)) in args.iter().enumerate() {
                            if j > 0 {
                                write!(w, ",")?;
                            }
                            write_json_string(&mut w, k)?;
                            write!(w, ":")?;
                            match v {
                                super::Arg::Str(s) => write_json_string(&mut w, s)?,
                                super::Arg::U64(n) => write!(w, "{n}")?,
                                super::Arg::Bool(b) => write!(w, "{b}")?,
                            }
                        }
                        write!(w, "}}")?;
                    }
                    write!(w, "}}")?;
                }
                TraceEvent::ThreadName { tid, name } => {
                    write!(
                        w,
                        "{{\"name\":\"thread_name\",\"ph\":\"M\",\"pid\":1,\"tid\":{tid},\"args\":{{\"name\":"
                    )?;
                    write_json_string(&mut w, &name)?;
                    write!(w, "}}}}")?;
                }
            }
        }
        write!(w, "]}}")?;
        w.flush()
    }

    fn write_json_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
        write!(w, "\"")?;
        for ch in s.chars() {
            match ch {
                '"' => write!(w, "\\\"")?,
                '\\' => write!(w, "\\\\")?,
                '\n' => write!(w, "\\n")?,
                c if c.is_control() => write!(w, "\\u{:04x}", c as u32)?,
                c => write!(w, "{c}")?,
            }
        }
        write!(w, "\"")
    }
}

#[cfg(not(feature = "profiling"))]
mod disabled {
    use super::*;

    /// Starts recording (no-op).
    #[inline]
    pub fn init<P: AsRef<Path>>(_path: P) {}

    /// Stops recording (no-op).
    #[inline]
    pub fn shutdown() {}

    /// Names the calling thread's track (no-op).
    #[inline]
    pub fn thread_name(_name: impl Into<String>) {}

    /// Opens a span (no-op).
    #[inline]
    pub fn span(_name: impl Into<Cow<'static, str>>) -> SpanGuard {
        SpanGuard
    }

    /// No-op span guard.
    pub struct SpanGuard;

    impl SpanGuard {
        /// Attaches an argument (no-op).
        #[inline]
        pub fn arg(self, _key: &'static str, _value: super::Arg) -> Self {
            self
        }
    }
}

/// Span argument value.
#[derive(Clone, Debug)]
pub enum Arg {
    /// UTF-8 string.
    Str(String),
    /// Unsigned integer (byte counts, IDs).
    U64(u64),
    /// Boolean flag.
    Bool(bool),
}

#[cfg(feature = "profiling")]
pub use enabled::{init, shutdown, span, thread_name, SpanGuard};

#[cfg(not(feature = "profiling"))]
pub use disabled::{init, shutdown, span, thread_name, SpanGuard};
