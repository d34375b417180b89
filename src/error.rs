//! Errors arising from memory-aware job admission and profiling
//!
//! Per the propagation policy (spec §7): no error from this crate is meant
//! to reach the surrounding build. Every public entry point that can
//! meaningfully fail either degrades gracefully and logs, or returns a
//! `Result` only for the handful of operations spec §8 tests directly
//! (`ProfileStore::load`/`save`, `SharedRegion::attach_or_create`,
//! `SharedRegion::find_or_create_slot`).
#![forbid(unsafe_code)]

use crate::internal_prelude::*;

/// Coarse classification of an [`Error`], mirroring the taxonomy in spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Cache file unreadable, `/proc/meminfo` unreadable, shared memory unavailable.
    ///
    /// Never fatal: the subsystem continues with degraded functionality
    /// (no prediction, no display).
    AmbientEnvironmental,
    /// All `MAX_RESERVATIONS` slots are occupied.
    SlotExhausted,
    /// The profile array failed to grow (allocation failure).
    GrowthFailure,
    /// The monitor's status write hit a broken pipe or bad file descriptor.
    BrokenPipe,
    /// An invariant was violated (e.g. observed reservation total disagreed
    /// with the shared total). Self-correction is attempted where safe.
    Internal,
}

/// Something that can be classified into a coarse [`ErrorKind`]
pub trait HasKind {
    /// Return the kind of this error
    fn kind(&self) -> ErrorKind;
}

/// An error arising from memory tracking
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read or parse the on-disk profile cache
    #[error("failed to read memory profile cache {path:?}: {source}")]
    CacheRead {
        /// path we tried to read
        path: PathBuf,
        /// underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write the on-disk profile cache
    #[error("failed to write memory profile cache {path:?}: {source}")]
    CacheWrite {
        /// path we tried to write
        path: PathBuf,
        /// underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The shared memory region could not be created or attached
    #[error("shared memory region {name:?} unavailable: {source}")]
    SharedMemoryUnavailable {
        /// POSIX shared-memory object name
        name: String,
        /// underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// No free reservation slot remained
    #[error("no available reservation slots (capacity {capacity} exceeded)")]
    SlotExhausted {
        /// configured slot capacity (`MAX_RESERVATIONS`)
        capacity: usize,
    },

    /// `/proc` could not be opened or a required field could not be parsed
    #[error("/proc unavailable: {source}")]
    ProcUnavailable {
        /// underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// An internal invariant was violated
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::CacheRead { .. } | E::CacheWrite { .. } | E::SharedMemoryUnavailable { .. } => {
                EK::AmbientEnvironmental
            }
            E::ProcUnavailable { .. } => EK::AmbientEnvironmental,
            E::SlotExhausted { .. } => EK::SlotExhausted,
            E::Internal(_) => EK::Internal,
        }
    }
}

impl Error {
    /// Construct an [`Error::Internal`] from a `format!`-style message
    ///
    /// Grounded on the teacher's `tor_error::internal!` macro: a terse way
    /// to report "this should never happen" without a dedicated variant.
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
