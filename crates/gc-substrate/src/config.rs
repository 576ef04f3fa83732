//! Startup configuration.
//!
//! Options come as a comma-separated `name=value` string, e.g.
//! `max-heap-size=512m,soft-heap-limit=256m,nursery-size=4m`. Sizes accept
//! an optional `k`, `m` or `g` suffix (powers of 1024).

use std::env;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::governor::{DEFAULT_ALLOWANCE_RATIO, MAX_ALLOWANCE_RATIO, MIN_ALLOWANCE_RATIO};
use crate::handles::HandleTableConfig;

/// Environment variable read by [`GcConfig::from_env`].
pub const PARAMS_ENV_VAR: &str = "GC_SUBSTRATE_PARAMS";

/// Default nursery size (4 MiB).
pub const DEFAULT_NURSERY_SIZE: usize = 4 << 20;

/// Settings for a [`GcContext`](crate::GcContext).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcConfig {
    /// Hard heap ceiling in bytes, nursery included; 0 for none.
    pub max_heap_size: usize,
    /// Soft heap ceiling in bytes; 0 for none.
    pub soft_heap_limit: usize,
    /// Nursery size in bytes.
    pub nursery_size: usize,
    /// Minimum allowance as a multiple of the nursery size.
    pub allowance_ratio: f64,
    /// Slab region size in bytes; `None` for the allocator default.
    pub slab_region_size: Option<usize>,
    /// Upper bound on handle-table blocks.
    pub handle_max_blocks: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_heap_size: 0,
            soft_heap_limit: 0,
            nursery_size: DEFAULT_NURSERY_SIZE,
            allowance_ratio: DEFAULT_ALLOWANCE_RATIO,
            slab_region_size: None,
            handle_max_blocks: HandleTableConfig::default().max_blocks,
        }
    }
}

impl GcConfig {
    /// Parses an option string on top of the defaults.
    ///
    /// `max-heap-size` is rounded up to a whole number of pages.
    ///
    /// # Errors
    ///
    /// Returns the first malformed, out-of-range or unknown option.
    /// Relationships between ceilings are checked later, by
    /// [`HeapGovernor::from_config`](crate::HeapGovernor::from_config).
    pub fn parse_params(params: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for opt in params.split(',').map(str::trim).filter(|opt| !opt.is_empty()) {
            let Some((name, value)) = opt.split_once('=') else {
                return Err(ConfigError::UnknownOption(opt.to_owned()));
            };
            let value = value.trim();
            match name.trim() {
                "max-heap-size" => {
                    let bytes = parse_size(name, value)?;
                    config.max_heap_size =
                        sys_alloc::round_to_pages(bytes).ok_or_else(|| invalid(name, value))?;
                }
                "soft-heap-limit" => config.soft_heap_limit = parse_size(name, value)?,
                "nursery-size" => {
                    let bytes = parse_size(name, value)?;
                    if !bytes.is_power_of_two() {
                        return Err(ConfigError::NurseryNotPowerOfTwo(bytes));
                    }
                    config.nursery_size = bytes;
                }
                "default-allowance-ratio" => {
                    let ratio: f64 = value.parse().map_err(|_| invalid(name, value))?;
                    if !(MIN_ALLOWANCE_RATIO..=MAX_ALLOWANCE_RATIO).contains(&ratio) {
                        return Err(ConfigError::RatioOutOfRange {
                            name: "default-allowance-ratio",
                            value: ratio,
                            min: MIN_ALLOWANCE_RATIO,
                            max: MAX_ALLOWANCE_RATIO,
                        });
                    }
                    config.allowance_ratio = ratio;
                }
                "slab-region-size" => config.slab_region_size = Some(parse_size(name, value)?),
                "handle-max-blocks" => {
                    config.handle_max_blocks = value.parse().map_err(|_| invalid(name, value))?;
                }
                _ => return Err(ConfigError::UnknownOption(opt.to_owned())),
            }
        }
        Ok(config)
    }

    /// Reads [`PARAMS_ENV_VAR`]; defaults when it is unset.
    ///
    /// # Errors
    ///
    /// As [`GcConfig::parse_params`], or [`ConfigError::InvalidNumber`] if
    /// the variable is not valid Unicode.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var(PARAMS_ENV_VAR) {
            Ok(params) => Self::parse_params(&params),
            Err(env::VarError::NotPresent) => Ok(Self::default()),
            Err(env::VarError::NotUnicode(raw)) => Err(ConfigError::InvalidNumber {
                name: PARAMS_ENV_VAR.to_owned(),
                value: raw.to_string_lossy().into_owned(),
            }),
        }
    }

    /// Handle-table limits derived from this configuration.
    #[must_use]
    pub const fn handle_table(&self) -> HandleTableConfig {
        HandleTableConfig {
            max_blocks: self.handle_max_blocks,
        }
    }
}

impl FromStr for GcConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_params(s)
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidNumber {
        name: name.to_owned(),
        value: value.to_owned(),
    }
}

/// Parses `123`, `64k`, `512M`, `2g`.
fn parse_size(name: &str, value: &str) -> Result<usize, ConfigError> {
    let (digits, shift) = match value.as_bytes().last() {
        Some(b'k' | b'K') => (&value[..value.len() - 1], 10),
        Some(b'm' | b'M') => (&value[..value.len() - 1], 20),
        Some(b'g' | b'G') => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    let number: usize = digits.parse().map_err(|_| invalid(name, value))?;
    number
        .checked_mul(1 << shift)
        .ok_or_else(|| invalid(name, value))
}
