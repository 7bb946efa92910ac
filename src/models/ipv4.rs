//! IPv4 CIDR block arithmetic.
//!
//! Provides [`AddressBlock`] for representing an aligned IPv4 network,
//! along with the mask helpers used to derive its bounds and sub-blocks.

use serde::de;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Maximum length for an IPv4 prefix (32 bits).
pub const MAX_LENGTH: u8 = 32;

/// Errors raised while parsing or deriving CIDR blocks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidrError {
    #[error("invalid CIDR format: {0}")]
    Format(String),
    #[error("invalid IP address: {0}")]
    Address(String),
    #[error("prefix length /{0} is too long")]
    PrefixTooLong(u8),
    #[error("{0} has host bits set")]
    HostBitsSet(String),
    #[error("{block} can only be partitioned into blocks of /{min} or smaller, got /{requested}")]
    PartitionTooLarge { block: String, min: u8, requested: u8 },
}

/// Convert a CIDR prefix length to a subnet mask as u32.
///
/// # Examples
/// ```
/// use cidr_allocator::models::get_cidr_mask;
/// assert_eq!(get_cidr_mask(24).unwrap(), 0xFFFFFF00);
/// ```
pub fn get_cidr_mask(len: u8) -> Result<u32, CidrError> {
    if len > MAX_LENGTH {
        Err(CidrError::PrefixTooLong(len))
    } else {
        let right_len = MAX_LENGTH - len;
        let all_bits = u32::MAX as u64;

        let mask = (all_bits >> right_len) << right_len;

        Ok(mask as u32)
    }
}

/// Get the network address for a given IP and prefix length.
pub fn cut_addr(addr: Ipv4Addr, len: u8) -> Result<Ipv4Addr, CidrError> {
    let mask = get_cidr_mask(len)?;
    Ok(Ipv4Addr::from(u32::from(addr) & mask))
}

/// Number of addresses covered by a prefix length (`len` must be <= 32).
fn block_size(len: u8) -> u64 {
    1u64 << (MAX_LENGTH - len)
}

/// An aligned IPv4 network: base address plus prefix length.
///
/// The base address never carries host bits and the prefix length is
/// always within `0..=32`; both are checked at construction.
#[derive(Eq, Ord, PartialEq, PartialOrd, Debug, Copy, Clone, Hash)]
pub struct AddressBlock {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl AddressBlock {
    /// Build a block from an address and prefix, rejecting host bits.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<AddressBlock, CidrError> {
        let network = cut_addr(addr, prefix_len)?;
        if network != addr {
            return Err(CidrError::HostBitsSet(format!("{addr}/{prefix_len}")));
        }
        Ok(AddressBlock { addr, prefix_len })
    }

    /// The network (base) address.
    pub fn network(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Lowest address in the block.
    pub fn lo(&self) -> Ipv4Addr {
        self.addr
    }

    /// Highest (broadcast) address in the block.
    pub fn hi(&self) -> Ipv4Addr {
        let last = u32::from(self.addr) as u64 + block_size(self.prefix_len) - 1;
        Ipv4Addr::from(last as u32)
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        block_size(self.prefix_len)
    }

    /// Check if an IP address falls inside this block.
    pub fn contains_addr(&self, ip: Ipv4Addr) -> bool {
        ip >= self.lo() && ip <= self.hi()
    }

    /// Check if `other` lies entirely inside this block.
    pub fn contains(&self, other: &AddressBlock) -> bool {
        self.prefix_len <= other.prefix_len && self.contains_addr(other.addr)
    }

    /// Two blocks overlap iff their address ranges intersect.
    pub fn overlaps(&self, other: &AddressBlock) -> bool {
        self.lo() <= other.hi() && other.lo() <= self.hi()
    }

    /// Split into equal blocks of `new_prefix_len`, in ascending address order.
    ///
    /// A block partitioned to its own prefix yields itself.
    pub fn partition(&self, new_prefix_len: u8) -> Result<Partition, CidrError> {
        if new_prefix_len > MAX_LENGTH {
            return Err(CidrError::PrefixTooLong(new_prefix_len));
        }
        if new_prefix_len < self.prefix_len {
            return Err(CidrError::PartitionTooLarge {
                block: self.to_string(),
                min: self.prefix_len,
                requested: new_prefix_len,
            });
        }
        Ok(Partition {
            next: u32::from(self.addr) as u64,
            end: u32::from(self.addr) as u64 + self.size(),
            step: block_size(new_prefix_len),
            prefix_len: new_prefix_len,
        })
    }
}

/// Iterator over the equal-size sub-blocks of an [`AddressBlock`].
#[derive(Debug, Clone)]
pub struct Partition {
    next: u64,
    end: u64,
    step: u64,
    prefix_len: u8,
}

impl Iterator for Partition {
    type Item = AddressBlock;

    fn next(&mut self) -> Option<AddressBlock> {
        if self.next >= self.end {
            return None;
        }
        let block = AddressBlock {
            addr: Ipv4Addr::from(self.next as u32),
            prefix_len: self.prefix_len,
        };
        self.next += self.step;
        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = ((self.end - self.next) / self.step) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Partition {}

impl FromStr for AddressBlock {
    type Err = CidrError;

    /// Parse a CIDR string (e.g., "10.0.0.0/24").
    fn from_str(addr_cidr: &str) -> Result<AddressBlock, CidrError> {
        let addr_cidr = addr_cidr.trim();
        let parts: Vec<&str> = addr_cidr.split('/').collect();
        if parts.len() != 2 {
            return Err(CidrError::Format(addr_cidr.to_string()));
        }
        let addr: Ipv4Addr = parts[0]
            .parse()
            .map_err(|_| CidrError::Address(parts[0].to_string()))?;
        let prefix_len: u8 = parts[1]
            .parse()
            .map_err(|_| CidrError::Format(addr_cidr.to_string()))?;
        AddressBlock::new(addr, prefix_len)
    }
}

impl Serialize for AddressBlock {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressBlock {
    fn deserialize<D>(deserializer: D) -> Result<AddressBlock, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        AddressBlock::from_str(&s).map_err(de::Error::custom)
    }
}

impl std::fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}
