//! A line-by-line memory profiler.
//!
//! [`LineProfiler`] attributes memory deltas to the source lines of
//! instrumented code, the [`watcher`] functions sample whole processes over
//! time.
//!
//! Instrumented code reports its frames and lines through the [`trace`]
//! runtime, the [`enter!`] and [`step!`] macros fill in the line numbers.
//!
//! ```no_run
//! use hala_mprof::{enter, step, CodeUnit, LineProfiler, show_results};
//!
//! fn work(unit: &CodeUnit) -> usize {
//!     let _frame = enter!(unit);
//!     step!();
//!     let buf = vec![1u8; 50 << 20];
//!     step!();
//!     buf.len()
//! }
//!
//! let unit = CodeUnit::new("work", file!(), 3);
//! let profiler = LineProfiler::with_backend(None, false);
//!
//! profiler.add_function(&unit);
//! profiler.run(|| work(&unit));
//!
//! show_results(&*profiler.code_map(), &mut std::io::stdout(), 1).unwrap();
//! ```
//!
//! Installing [`SnapshotAlloc`] as the global allocator enables the
//! [`Backend::Snapshot`] backend, which attributes live heap bytes to the
//! source file of the profiled code instead of reading process RSS.
//!
//! ```no_run
//! use hala_mprof::SnapshotAlloc;
//!
//! #[global_allocator]
//! static ALLOC: SnapshotAlloc = SnapshotAlloc(32);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

mod helper;

mod errors;
pub use errors::*;

mod sampler;
pub use sampler::*;

pub mod snapshot;
pub use snapshot::{Snapshot, SnapshotAlloc};

pub mod source;

mod code_map;
pub use code_map::*;

pub mod trace;

mod line_profiler;
pub use line_profiler::*;

mod report;
pub use report::*;

mod timestamp;
pub use timestamp::*;

pub mod watcher;
pub use watcher::{watch_child, watch_command, watch_fn, watch_pid, Usage, WatchOptions, Watched};

mod config;
pub use config::*;

/// Enter a frame of a [`CodeUnit`] at the current line, see [`trace::enter`].
///
/// Bind the result: the frame returns when it drops.
#[macro_export]
macro_rules! enter {
    ($unit:expr) => {
        $crate::trace::enter($unit.id(), line!())
    };
}

/// Report that the current line is about to run, see [`trace::step`].
#[macro_export]
macro_rules! step {
    () => {
        $crate::trace::step(line!())
    };
}
