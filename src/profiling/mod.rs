//! Chrome Trace profiling of residency operations.
//!
//! With the `profiling` feature enabled, region entry/exit, composite
//! mirroring and push/pull transfers are recorded as complete events (with
//! byte counts and view IDs as span args) and written as Chrome Trace JSON on
//! [`profiler::shutdown`]. Open the file in `chrome://tracing` or
//! <https://ui.perfetto.dev>.
//!
//! ```bash
//! cargo test --features profiling
//! ```
//!
//! Without the feature every call is an inlined no-op.
//!
//! ## Usage
//!
//! ```no_run
//! use residency::profiler;
//!
//! profiler::init("profile/residency.json");
//! {
//!     let _g = profiler::span("region").arg("views", profiler::Arg::U64(3));
//! }
//! profiler::shutdown();
//! ```

pub mod profiler;
