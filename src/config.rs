//! Configuration (private module)
//!
//! Resolves the external interface in spec §6: the `MAKE_MEMORY_AWARE`
//! environment variable and the `--memory-aware` / `--no-memory-aware` /
//! `--nomem` / `--memdebug=N` flags. This crate does not parse `argv`
//! itself (that's the driver's job); [`ConfigBuilder`] just exposes setters
//! for whatever the driver already decoded.
#![forbid(unsafe_code)]

use crate::debug::Level;
use crate::internal_prelude::*;

/// Configuration for the memory-aware admission and profiling subsystem
///
/// Build one with [`Config::builder`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether memory awareness (profiling + reservation + display) is on at all
    pub(crate) enabled: bool,
    /// Suppress status rendering; profiling and reservation stay active
    pub(crate) display_disabled: bool,
    /// Verbosity of the debug stream (`DB_MEM_1`..`DB_MEM_5` in the original)
    pub(crate) debug_level: Level,
    /// Path to the on-disk profile cache, default `.make_memory_cache`
    pub(crate) cache_path: PathBuf,
}

/// Builder for [`Config`]
///
/// Fields start at `None`/default and are resolved against the environment
/// in [`ConfigBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    /// Explicit `--memory-aware` / `--no-memory-aware`, overrides environment
    memory_aware_flag: Option<bool>,
    /// `--nomem`
    nomem: bool,
    /// `--memdebug=N`
    memdebug: Option<u8>,
    /// Override for the cache file location (tests use this)
    cache_path: Option<PathBuf>,
}

/// Error building a [`Config`]
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigBuildError {
    /// `--memdebug` was outside `0..=5`
    #[error("--memdebug={value} out of range, must be 0..=5")]
    DebugLevelOutOfRange {
        /// the rejected value
        value: u8,
    },
}

impl Config {
    /// Start building a [`Config`]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Whether memory awareness is enabled at all
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the status display is suppressed (profiling stays active)
    pub fn display_disabled(&self) -> bool {
        self.display_disabled
    }

    /// Configured debug verbosity
    pub fn debug_level(&self) -> Level {
        self.debug_level
    }

    /// Path to the on-disk profile cache
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }
}

impl ConfigBuilder {
    /// Explicit `--memory-aware` (`true`) / `--no-memory-aware` (`false`)
    ///
    /// Overrides `MAKE_MEMORY_AWARE` when set.
    pub fn memory_aware(&mut self, value: bool) -> &mut Self {
        self.memory_aware_flag = Some(value);
        self
    }

    /// `--nomem`: suppress status rendering, profiling remains active
    pub fn nomem(&mut self, value: bool) -> &mut Self {
        self.nomem = value;
        self
    }

    /// `--memdebug=N`
    pub fn memdebug(&mut self, value: u8) -> &mut Self {
        self.memdebug = Some(value);
        self
    }

    /// Override the on-disk cache path (defaults to `.make_memory_cache` in the cwd)
    pub fn cache_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Resolve environment + flags into a [`Config`]
    ///
    /// Precedence: explicit flag > `MAKE_MEMORY_AWARE` env var > default-on.
    /// Mirrors `init_memory_monitoring_env` in the original: unset, or any
    /// value other than `"0"`/`"no"`/`"false"`, is treated as enabled.
    pub fn build(&self) -> std::result::Result<Config, ConfigBuildError> {
        let enabled = self.memory_aware_flag.unwrap_or_else(|| {
            std::env::var("MAKE_MEMORY_AWARE")
                .map(|v| v != "0" && v != "no" && v != "false")
                .unwrap_or(true)
        });

        let debug_level = match self.memdebug {
            None | Some(0) | Some(1) => Level::Error,
            Some(2) => Level::Predict,
            Some(3) => Level::Info,
            Some(4) => Level::Verbose,
            Some(5) => Level::Max,
            Some(value) => return Err(ConfigBuildError::DebugLevelOutOfRange { value }),
        };

        Ok(Config {
            enabled,
            display_disabled: self.nomem,
            debug_level,
            cache_path: self
                .cache_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(".make_memory_cache")),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_is_enabled() {
        let mut b = Config::builder();
        b.memory_aware(true);
        assert!(b.build().unwrap().enabled());
    }

    #[test]
    fn explicit_flag_overrides() {
        let mut b = Config::builder();
        b.memory_aware(false);
        assert!(!b.build().unwrap().enabled());
    }

    #[test]
    #[serial]
    fn env_var_disables() {
        std::env::set_var("MAKE_MEMORY_AWARE", "0");
        let cfg = Config::builder().build().unwrap();
        std::env::remove_var("MAKE_MEMORY_AWARE");
        assert!(!cfg.enabled());
    }

    #[test]
    #[serial]
    fn env_var_false_disables() {
        std::env::set_var("MAKE_MEMORY_AWARE", "false");
        let cfg = Config::builder().build().unwrap();
        std::env::remove_var("MAKE_MEMORY_AWARE");
        assert!(!cfg.enabled());
    }

    #[test]
    #[serial]
    fn unset_env_defaults_on() {
        std::env::remove_var("MAKE_MEMORY_AWARE");
        let cfg = Config::builder().build().unwrap();
        assert!(cfg.enabled());
    }

    #[test]
    fn memdebug_levels() {
        assert_eq!(
            Config::builder().memdebug(5).build().unwrap().debug_level(),
            Level::Max
        );
        assert_eq!(
            Config::builder().memdebug(0).build().unwrap().debug_level(),
            Level::Error
        );
    }

    #[test]
    fn memdebug_out_of_range_rejected() {
        let err = Config::builder().memdebug(6).build().unwrap_err();
        assert!(matches!(
            err,
            ConfigBuildError::DebugLevelOutOfRange { value: 6 }
        ));
    }

    #[test]
    fn nomem_suppresses_display_only() {
        let cfg = Config::builder().nomem(true).build().unwrap();
        assert!(cfg.display_disabled());
        assert!(cfg.enabled());
    }
}
