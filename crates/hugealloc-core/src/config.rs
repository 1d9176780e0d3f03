//! Allocator configuration.
//!
//! Configuration is built once and shared by reference with every huge
//! operation. It can be read from the `HUGEALLOC_CONF` environment variable
//! using `key:value` pairs separated by commas, e.g.
//!
//! ```text
//! HUGEALLOC_CONF="lg_chunk:21,narenas:8,junk:free,zero:false"
//! ```
//!
//! Boolean and junk values are parsed loosely (`true|yes|on|1`, ...).

use serde::Serialize;
use thiserror::Error;

use crate::size_class::{MAX_LG_CHUNK, MIN_LG_CHUNK};

/// Environment variable consulted by [`HugeConfig::from_env`].
pub const CONF_ENV: &str = "HUGEALLOC_CONF";

/// Default chunk size is 2 MiB.
pub const DEFAULT_LG_CHUNK: u8 = 21;

/// Default number of arenas.
pub const DEFAULT_NARENAS: usize = 4;

/// Default lifecycle log ring size.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// Byte written over freshly allocated memory when junk-on-alloc is enabled.
pub const ALLOC_JUNK: u8 = 0xa5;

/// Byte written over released memory when junk-on-free is enabled.
pub const FREE_JUNK: u8 = 0x5a;

/// Debug-fill mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JunkMode {
    #[default]
    Off,
    /// Fill new memory with [`ALLOC_JUNK`].
    Alloc,
    /// Fill released memory with [`FREE_JUNK`].
    Free,
    /// Both.
    Full,
}

impl JunkMode {
    /// Parse from string (case-insensitive). Unknown values map to `Off`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "alloc" => Self::Alloc,
            "free" => Self::Free,
            "true" | "full" | "yes" | "on" | "1" => Self::Full,
            _ => Self::Off,
        }
    }

    #[must_use]
    pub const fn on_alloc(self) -> bool {
        matches!(self, Self::Alloc | Self::Full)
    }

    #[must_use]
    pub const fn on_free(self) -> bool {
        matches!(self, Self::Free | Self::Full)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed option `{0}` (expected key:value)")]
    Malformed(String),
    #[error("unknown option `{0}`")]
    UnknownKey(String),
    #[error("invalid value `{value}` for option `{key}`")]
    InvalidValue { key: String, value: String },
    #[error(
        "lg_chunk {0} outside supported range {min}..={max}",
        min = MIN_LG_CHUNK,
        max = MAX_LG_CHUNK
    )]
    LgChunkOutOfRange(u8),
    #[error("narenas must be at least 1")]
    NoArenas,
}

/// Immutable huge-path configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HugeConfig {
    /// Log2 of the chunk size.
    pub lg_chunk: u8,
    /// Number of arenas.
    pub narenas: usize,
    /// Zero every new allocation regardless of the caller's request.
    pub zero: bool,
    /// Debug-fill mode.
    pub junk: JunkMode,
    /// The backend has a DSS (sbrk-style) memory source.
    pub have_dss: bool,
    /// Skip junk-on-free when the backend is about to unmap the memory anyway.
    /// Only DSS memory or a decommit-only backend is still filled.
    pub elide_junk_before_unmap: bool,
    /// Upper bound on extent records (live plus reserved) per arena.
    pub max_extents_per_arena: Option<usize>,
    /// Upper bound on registry entries.
    pub registry_capacity: Option<usize>,
    /// Lifecycle log ring size; 0 disables logging.
    pub log_capacity: usize,
}

impl Default for HugeConfig {
    fn default() -> Self {
        Self {
            lg_chunk: DEFAULT_LG_CHUNK,
            narenas: DEFAULT_NARENAS,
            zero: false,
            junk: JunkMode::Off,
            have_dss: false,
            elide_junk_before_unmap: false,
            max_extents_per_arena: None,
            registry_capacity: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

fn parse_bool_loose(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_limit(s: &str) -> Option<Option<usize>> {
    match s.trim().to_ascii_lowercase().as_str() {
        "none" | "unlimited" => Some(None),
        v => v.parse().ok().map(Some),
    }
}

impl HugeConfig {
    /// Chunk size in bytes.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        1usize << self.lg_chunk
    }

    /// Applies a `key:value,key:value` option string on top of `self`.
    pub fn apply(mut self, opts: &str) -> Result<Self, ConfigError> {
        for pair in opts.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once(':') else {
                return Err(ConfigError::Malformed(pair.to_string()));
            };
            let key = key.trim();
            let invalid = || ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "lg_chunk" => self.lg_chunk = value.trim().parse().map_err(|_| invalid())?,
                "narenas" => self.narenas = value.trim().parse().map_err(|_| invalid())?,
                "zero" => self.zero = parse_bool_loose(value).ok_or_else(invalid)?,
                "junk" => self.junk = JunkMode::from_str_loose(value),
                "dss" | "have_dss" => self.have_dss = parse_bool_loose(value).ok_or_else(invalid)?,
                "elide_junk_before_unmap" => {
                    self.elide_junk_before_unmap = parse_bool_loose(value).ok_or_else(invalid)?
                }
                "max_extents_per_arena" => {
                    self.max_extents_per_arena = parse_limit(value).ok_or_else(invalid)?
                }
                "registry_capacity" => {
                    self.registry_capacity = parse_limit(value).ok_or_else(invalid)?
                }
                "log_capacity" => self.log_capacity = value.trim().parse().map_err(|_| invalid())?,
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            }
        }
        Ok(self)
    }

    /// Parses an option string over the defaults and validates the result.
    pub fn parse(opts: &str) -> Result<Self, ConfigError> {
        let config = Self::default().apply(opts)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads [`CONF_ENV`]. A missing variable yields the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONF_ENV) {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_LG_CHUNK..=MAX_LG_CHUNK).contains(&self.lg_chunk) {
            return Err(ConfigError::LgChunkOutOfRange(self.lg_chunk));
        }
        if self.narenas == 0 {
            return Err(ConfigError::NoArenas);
        }
        Ok(())
    }

    /// Serializes the configuration as a JSON object.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
