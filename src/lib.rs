#![doc = r#"
Memory-aware job admission and per-file peak-memory profiling for
make-style build drivers.

A build driver launches many recipe processes (compiles, links, ...)
concurrently and has no visibility into how much memory any of them will
actually use until they're already running. This crate closes that gap:

 * [`profile`] remembers, per source file, the peak resident set size a
   past build of that file used, persisted across invocations.
 * [`shared_region`] publishes a cross-process table of *predicted* memory
   reservations so that independent `make` processes (including recursive
   sub-makes) agree on how much memory is spoken for.
 * [`cmdline`] derives the canonical profiling key for a job from its
   command line.
 * [`descendants`] walks `/proc` to track the actual resident set of every
   live descendant of the driver.
 * [`monitor`] runs the sampling and status-rendering loop.
 * [`reservation`] is the admission hook: `predict_for` before a job
   starts, `reserve`/release as it starts and finishes.

See [`Config`] for how a driver wires this up.
"#]

// @@ begin lint list maintained by maint/add_warning @@
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::mod_module_files)]
#![allow(clippy::uninlined_format_args)]
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->
//
// Shared memory and process-shared mutexes have no safe wrapper for
// `PTHREAD_PROCESS_SHARED`; `shared_region` and `monitor` are the two
// modules that need `unsafe`. Every other module declares its own
// `#![forbid(unsafe_code)]` so the exemption stays visibly scoped to the
// two modules that actually need it, instead of living here as a blanket
// crate-level rule.
#![warn(clippy::arithmetic_side_effects)]

mod internal_prelude;

mod cmdline;
mod config;
mod debug;
mod descendants;
mod error;
mod monitor;
mod profile;
mod reservation;
mod shared_region;
mod signal;

pub use cmdline::CmdlineExtractor;
pub use config::{Config, ConfigBuildError, ConfigBuilder};
pub use debug::{Level, Record, Ring};
pub use descendants::{
    DescendantRow, DescendantTracker, ProcSnapshot, ProcSource, RealProcSource, ScanResult,
    MAX_TRACKED_DESCENDANTS,
};
pub use error::{Error, ErrorKind, HasKind};
pub use monitor::{MemoryMonitor, MemorySource, MonitorHandle, SysinfoMemorySource, SystemMemory};
pub use profile::{FileProfile, ProfileStore};
pub use reservation::ReservationController;
pub use shared_region::{Reservation, SharedRegion, MAX_RESERVATIONS, SHARED_MEMORY_NAME};
pub use signal::DebugToggle;

/// `Result` whose `Err` is [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
