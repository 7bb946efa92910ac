//! Validated allocation requests.
//!
//! Raw parameters (path segments, query strings, CLI arguments) are turned
//! into typed requests once, here. Everything past this module works with
//! already checked values.

use crate::models::{AddressBlock, CidrError, MAX_LENGTH};
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_PREFIX_LOW: u8 = 16;
pub const DEFAULT_PREFIX_HIGH: u8 = 27;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid CIDR Size. {value} is not between /{low} and /{high}")]
    InvalidSize { value: String, low: u8, high: u8 },
    #[error("Invalid query parameter. {name} is {value}, expected true or false")]
    InvalidFlag { name: &'static str, value: String },
    #[error("Invalid values input for flags. assigned=true requires locked=true")]
    AssignedWithoutLocked,
    #[error("Missing account alias.")]
    MissingAccountAlias,
    #[error("Missing {0}.")]
    MissingField(&'static str),
    #[error("Invalid CIDR block {value}: {source}")]
    InvalidCidr {
        value: String,
        #[source]
        source: CidrError,
    },
    #[error("Invalid encoding of {value}: {source}")]
    InvalidEncoding {
        value: String,
        #[source]
        source: std::str::Utf8Error,
    },
}

/// Inclusive range of prefix lengths callers may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixRange {
    pub low: u8,
    pub high: u8,
}

impl Default for PrefixRange {
    fn default() -> Self {
        PrefixRange {
            low: DEFAULT_PREFIX_LOW,
            high: DEFAULT_PREFIX_HIGH,
        }
    }
}

static SIZE_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_size_regex() -> &'static Regex {
    SIZE_REGEX.get_or_init(|| Regex::new(r"^/?(\d{1,3})$").expect("Invalid Regex"))
}

impl PrefixRange {
    /// `None` unless `low <= high <= 32`.
    pub fn new(low: u8, high: u8) -> Option<Self> {
        (low <= high && high <= MAX_LENGTH).then_some(PrefixRange { low, high })
    }

    pub fn contains(&self, prefix_len: u8) -> bool {
        self.low <= prefix_len && prefix_len <= self.high
    }

    /// Parse `"/24"` or `"24"`. A missing size means the smallest allowed block.
    pub fn parse_size(&self, size: Option<&str>) -> Result<u8, ValidationError> {
        let Some(raw) = size else {
            return Ok(self.high);
        };
        let invalid = || ValidationError::InvalidSize {
            value: raw.to_string(),
            low: self.low,
            high: self.high,
        };
        let prefix_len: u8 = get_size_regex()
            .captures(raw.trim())
            .and_then(|caps| caps[1].parse().ok())
            .ok_or_else(invalid)?;
        if !self.contains(prefix_len) {
            return Err(invalid());
        }
        Ok(prefix_len)
    }
}

/// `true`/`false`, any case.
pub fn str_to_bool(name: &'static str, value: &str) -> Result<bool, ValidationError> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(ValidationError::InvalidFlag {
            name,
            value: value.to_string(),
        })
    }
}

fn optional_flag(name: &'static str, value: Option<&str>) -> Result<bool, ValidationError> {
    value.map_or(Ok(false), |v| str_to_bool(name, v))
}

fn required(name: &'static str, value: &str) -> Result<String, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::MissingField(name));
    }
    Ok(value.to_string())
}

/// Decode `%XX` escapes of a path parameter, e.g. `10.0.0.0%2F24`.
pub fn percent_decode(value: &str) -> Result<String, ValidationError> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|source| ValidationError::InvalidEncoding {
            value: value.to_string(),
            source,
        })
}

/// Reserve the next free block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub region: String,
    pub cloud: String,
    pub prefix_len: u8,
    pub account_alias: String,
}

impl ReserveRequest {
    pub fn parse(
        range: &PrefixRange,
        region: &str,
        cloud: &str,
        size: Option<&str>,
        account_alias: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let prefix_len = range.parse_size(size)?;
        let account_alias = account_alias
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(ValidationError::MissingAccountAlias)?;
        Ok(ReserveRequest {
            region: required("region", region)?,
            cloud: required("cloud", cloud)?.to_uppercase(),
            prefix_len,
            account_alias: account_alias.to_string(),
        })
    }
}

/// List available blocks, or used blocks when `locked` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub region: String,
    pub cloud: String,
    pub prefix_len: u8,
    pub locked: bool,
    pub assigned: bool,
}

impl ListRequest {
    pub fn parse(
        range: &PrefixRange,
        region: &str,
        cloud: &str,
        size: Option<&str>,
        locked: Option<&str>,
        assigned: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let prefix_len = range.parse_size(size)?;
        let assigned = optional_flag("assigned", assigned)?;
        let locked = optional_flag("locked", locked)?;
        if assigned && !locked {
            return Err(ValidationError::AssignedWithoutLocked);
        }
        Ok(ListRequest {
            region: required("region", region)?,
            cloud: required("cloud", cloud)?.to_uppercase(),
            prefix_len,
            locked,
            assigned,
        })
    }
}

/// Records in use, narrowed to assigned or unassigned ones when `locked` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsedRequest {
    pub region: String,
    pub cloud: String,
    pub locked: bool,
    pub assigned: bool,
}

impl UsedRequest {
    pub fn parse(
        region: &str,
        cloud: &str,
        locked: Option<&str>,
        assigned: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let assigned = optional_flag("assigned", assigned)?;
        let locked = optional_flag("locked", locked)?;
        if assigned && !locked {
            return Err(ValidationError::AssignedWithoutLocked);
        }
        Ok(UsedRequest {
            region: required("region", region)?,
            cloud: required("cloud", cloud)?.to_uppercase(),
            locked,
            assigned,
        })
    }
}

/// Set or clear the `assigned` flag of a reserved block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagRequest {
    pub region: String,
    pub cloud: String,
    pub cidr: AddressBlock,
    pub assigned: bool,
}

impl FlagRequest {
    /// `cidr` may be percent-encoded; `assigned` is required.
    pub fn parse(
        region: &str,
        cloud: &str,
        cidr: &str,
        assigned: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let decoded = percent_decode(cidr)?;
        let cidr = decoded
            .trim()
            .parse()
            .map_err(|source| ValidationError::InvalidCidr {
                value: decoded.clone(),
                source,
            })?;
        let assigned = match assigned {
            Some(value) => str_to_bool("assigned", value)?,
            None => {
                return Err(ValidationError::InvalidFlag {
                    name: "assigned",
                    value: "None".to_string(),
                })
            }
        };
        Ok(FlagRequest {
            region: required("region", region)?,
            cloud: required("cloud", cloud)?.to_uppercase(),
            cidr,
            assigned,
        })
    }
}
