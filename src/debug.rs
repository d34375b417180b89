//! Debug verbosity levels and the in-memory diagnostic ring
//!
//! Mirrors the `ISDB_MEM` hierarchy from spec §9 DESIGN NOTES: five levels,
//! each subsuming the ones below it, mapped onto `tracing` so a consuming
//! driver's `EnvFilter` gets the same hierarchy without this crate knowing
//! anything about how the driver wires up its subscriber.
#![forbid(unsafe_code)]

use crate::internal_prelude::*;

/// Debug verbosity, `ISDB_MEM_1` (`Error`) through `ISDB_MEM_5` (`Max`)
///
/// Ordered: `Error < Predict < Info < Verbose < Max`. A message logged "at"
/// level `L` is shown whenever the configured level is `>= L`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Errors only (`DB_MEM_1`)
    Error,
    /// Errors plus prediction/admission decisions (`DB_MEM_2`)
    Predict,
    /// Plus general informational events (`DB_MEM_3`)
    Info,
    /// Plus verbose tracing, including debug temp-file dumps (`DB_MEM_4`)
    Verbose,
    /// Everything (`DB_MEM_5`)
    Max,
}

impl Level {
    /// The `tracing::Level` this verbosity corresponds to
    pub fn to_tracing(self) -> tracing::Level {
        match self {
            Level::Error => tracing::Level::ERROR,
            Level::Predict => tracing::Level::WARN,
            Level::Info => tracing::Level::INFO,
            Level::Verbose => tracing::Level::DEBUG,
            Level::Max => tracing::Level::TRACE,
        }
    }

    /// Whether a message "at" `other` should be shown when `self` is configured
    pub fn admits(self, other: Level) -> bool {
        other <= self
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Error => "error",
            Level::Predict => "predict",
            Level::Info => "info",
            Level::Verbose => "verbose",
            Level::Max => "max",
        };
        f.write_str(s)
    }
}

/// One formatted diagnostic record kept in a [`Ring`]
#[derive(Debug, Clone)]
pub struct Record {
    /// the level it was logged at
    pub level: Level,
    /// the formatted message
    pub message: String,
}

/// A bounded in-memory ring of recent diagnostic records
///
/// Stands in for the original's `/tmp/make_<prefix>_<HHMMSSmmm>.<caller>.txt`
/// dumps: instead of writing to the filesystem on every call, records
/// accumulate here and a driver drains them on demand (e.g. in response to
/// `SIGUSR1`, see [`crate::signal`]).
#[derive(Debug)]
pub struct Ring {
    capacity: usize,
    records: Mutex<Vec<Record>>,
}

impl Ring {
    /// Create a ring holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Ring {
            capacity,
            records: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Push a record, evicting the oldest if at capacity
    pub fn push(&self, level: Level, message: impl Into<String>) {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() == self.capacity {
            guard.remove(0);
        }
        guard.push(Record {
            level,
            message: message.into(),
        });
    }

    /// Snapshot the current contents, oldest first
    pub fn snapshot(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop all records
    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Clone for Record {
    fn clone(&self) -> Self {
        Record {
            level: self.level,
            message: self.message.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ordering_is_hierarchical() {
        assert!(Level::Max > Level::Verbose);
        assert!(Level::Verbose > Level::Info);
        assert!(Level::Info > Level::Predict);
        assert!(Level::Predict > Level::Error);
    }

    #[test]
    fn admits_is_reflexive_and_monotonic() {
        assert!(Level::Info.admits(Level::Info));
        assert!(Level::Max.admits(Level::Error));
        assert!(!Level::Error.admits(Level::Info));
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let ring = Ring::new(2);
        ring.push(Level::Info, "one");
        ring.push(Level::Info, "two");
        ring.push(Level::Info, "three");
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].message, "two");
        assert_eq!(snap[1].message, "three");
    }

    #[test]
    fn ring_clear_empties() {
        let ring = Ring::new(4);
        ring.push(Level::Error, "x");
        ring.clear();
        assert!(ring.snapshot().is_empty());
    }
}
