//! Runtime configuration from the environment.
//!
//! `.env` is loaded by the binary via `dotenv`; this module only reads
//! variables, through an injectable lookup so tests never touch the process
//! environment.

use crate::lock::LockSettings;
use crate::request::PrefixRange;
use crate::store::DEFAULT_PAGE_SIZE;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_CIDR_TABLE: &str = "ALLOCATED_CIDR_TABLE";
pub const ENV_REGION_REGISTRY: &str = "REGION_REGISTRY_FILE";
pub const ENV_PREFIX_LOW: &str = "SUBNET_PREFIX_LOW";
pub const ENV_PREFIX_HIGH: &str = "SUBNET_PREFIX_HIGH";
pub const ENV_LOCK_TTL: &str = "CIDR_LOCK_TTL_SECS";
pub const ENV_LOCK_BACKOFF: &str = "CIDR_LOCK_BACKOFF_SECS";
pub const ENV_LOCK_MULTIPLIER: &str = "CIDR_LOCK_BACKOFF_MULTIPLIER";
pub const ENV_LOCK_MAX_WAIT: &str = "CIDR_LOCK_MAX_WAIT_SECS";
pub const ENV_PAGE_SIZE: &str = "SCAN_PAGE_SIZE";

pub const DEFAULT_CIDR_TABLE: &str = "cidr_table.json";
pub const DEFAULT_REGION_REGISTRY: &str = "regions.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("Invalid subnet prefix range /{low} - /{high}")]
    PrefixRange { low: u8, high: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub cidr_table: PathBuf,
    pub region_registry: PathBuf,
    pub prefix_range: PrefixRange,
    pub lock: LockSettings,
    pub page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cidr_table: PathBuf::from(DEFAULT_CIDR_TABLE),
            region_registry: PathBuf::from(DEFAULT_REGION_REGISTRY),
            prefix_range: PrefixRange::default(),
            lock: LockSettings::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from `lookup`; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let low = parse_var(&lookup, ENV_PREFIX_LOW, defaults.prefix_range.low)?;
        let high = parse_var(&lookup, ENV_PREFIX_HIGH, defaults.prefix_range.high)?;
        let prefix_range =
            PrefixRange::new(low, high).ok_or(ConfigError::PrefixRange { low, high })?;

        let lock = LockSettings {
            ttl: secs_var(&lookup, ENV_LOCK_TTL, defaults.lock.ttl)?,
            initial_backoff: secs_var(&lookup, ENV_LOCK_BACKOFF, defaults.lock.initial_backoff)?,
            backoff_multiplier: parse_var(
                &lookup,
                ENV_LOCK_MULTIPLIER,
                defaults.lock.backoff_multiplier,
            )?,
            max_wait: secs_var(&lookup, ENV_LOCK_MAX_WAIT, defaults.lock.max_wait)?,
        };
        if lock.initial_backoff.is_zero() {
            return Err(invalid(ENV_LOCK_BACKOFF, "0", "must be at least 1 second"));
        }
        if !(lock.backoff_multiplier >= 1.0 && lock.backoff_multiplier.is_finite()) {
            return Err(invalid(
                ENV_LOCK_MULTIPLIER,
                &lock.backoff_multiplier.to_string(),
                "must be a finite number >= 1",
            ));
        }

        let page_size: usize = parse_var(&lookup, ENV_PAGE_SIZE, defaults.page_size)?;
        if page_size == 0 {
            return Err(invalid(ENV_PAGE_SIZE, "0", "must be at least 1"));
        }

        let config = Config {
            cidr_table: lookup(ENV_CIDR_TABLE)
                .map(PathBuf::from)
                .unwrap_or(defaults.cidr_table),
            region_registry: lookup(ENV_REGION_REGISTRY)
                .map(PathBuf::from)
                .unwrap_or(defaults.region_registry),
            prefix_range,
            lock,
            page_size,
        };
        log::debug!("Config: {config:?}");
        Ok(config)
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(name, &value, &e.to_string())),
    }
}

fn secs_var<F>(lookup: &F, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, name, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.prefix_range, PrefixRange { low: 16, high: 27 });
        assert_eq!(config.lock.ttl, Duration::from_secs(60));
        assert_eq!(config.lock.initial_backoff, Duration::from_secs(5));
        assert_eq!(config.lock.backoff_multiplier, 1.5);
        assert_eq!(config.lock.max_wait, Duration::from_secs(60));
        assert_eq!(config.page_size, 100);
        assert_eq!(config.cidr_table, PathBuf::from("cidr_table.json"));
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            (ENV_CIDR_TABLE, "/var/lib/cidr/table.json"),
            (ENV_PREFIX_LOW, "20"),
            (ENV_PREFIX_HIGH, " 24 "),
            (ENV_LOCK_TTL, "30"),
            (ENV_LOCK_MULTIPLIER, "2"),
            (ENV_PAGE_SIZE, "25"),
        ])
        .unwrap();
        assert_eq!(config.cidr_table, PathBuf::from("/var/lib/cidr/table.json"));
        assert_eq!(config.prefix_range, PrefixRange { low: 20, high: 24 });
        assert_eq!(config.lock.ttl, Duration::from_secs(30));
        assert_eq!(config.lock.backoff_multiplier, 2.0);
        assert_eq!(config.page_size, 25);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            from_pairs(&[(ENV_PREFIX_LOW, "sixteen")]),
            Err(ConfigError::Invalid { name: ENV_PREFIX_LOW, .. })
        ));
        assert!(matches!(
            from_pairs(&[(ENV_PREFIX_LOW, "28")]),
            Err(ConfigError::PrefixRange { low: 28, high: 27 })
        ));
        assert!(from_pairs(&[(ENV_PREFIX_HIGH, "33")]).is_err());
        assert!(from_pairs(&[(ENV_LOCK_MULTIPLIER, "0.5")]).is_err());
        assert!(from_pairs(&[(ENV_LOCK_MULTIPLIER, "NaN")]).is_err());
        assert!(from_pairs(&[(ENV_PAGE_SIZE, "0")]).is_err());
        assert!(from_pairs(&[(ENV_LOCK_TTL, "-1")]).is_err());
        assert!(matches!(
            from_pairs(&[(ENV_LOCK_BACKOFF, "0")]),
            Err(ConfigError::Invalid { name: ENV_LOCK_BACKOFF, .. })
        ));
    }
}
