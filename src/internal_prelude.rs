//! Internal prelude
//!
//! This file contains most of the imports we wish to use, throughout this crate.
//!
//! Every module does `use crate::internal_prelude::*;`
//!
//! Exceptions:
//!
//!  * Names that are private to a module and its submodules
//!    are imported to the sub-modules via `use super::*`.
//!  * Test-only imports (`tempfile`, `serial_test`) live in each module's
//!    `#[cfg(test)] mod test`.

#![allow(unused_imports)]

pub(crate) use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

pub(crate) use thiserror::Error;
pub(crate) use tracing::{debug, error, info, trace, warn};

pub(crate) use crate::{
    config::{Config, ConfigBuilder},
    debug::Level as DebugLevel,
    error::{Error, ErrorKind, HasKind},
};

/// Process id. A thin alias so call sites read as domain types, not `i32`.
pub type Pid = i32;

/// Megabytes, as used throughout the public API (`peak_memory_mb`, `reserved_mb`, ...).
pub type Megabytes = u64;

/// `Result` whose `Err` is [`crate::Error`]
pub type Result<T> = std::result::Result<T, Error>;
