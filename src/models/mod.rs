//! Domain models for CIDR allocation.
//!
//! This module contains the core data structures used throughout the crate:
//! - [`AddressBlock`] - aligned IPv4 network with CIDR arithmetic
//! - [`ReservationRecord`] - a reserved block in the allocation table
//! - [`LockRecord`] - the table lock sentinel

mod ipv4;
mod record;

// Re-export public types
pub use ipv4::{cut_addr, get_cidr_mask, AddressBlock, CidrError, Partition, MAX_LENGTH};
pub use record::{LockRecord, ReservationRecord, StoreItem, LOCK_KEY};
