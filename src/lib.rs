//! CIDR block allocator.
//!
//! Hands out non-overlapping IPv4 blocks from per-region pools, tracks their
//! reservation and assignment state in a key-value table, and serializes
//! concurrent reservations with a table-wide lock.
//!
//! - [`models`] - address blocks and table records
//! - [`processing`] - free block search
//! - [`store`] - allocation table adapters
//! - [`lock`] - table-wide mutex with expiry
//! - [`registry`] - per-region top-level pools
//! - [`request`] - validated requests
//! - [`service`] - reserve, list and flag operations
//! - [`output`] - terminal and JSON rendering
//! - [`config`] - environment configuration

pub mod config;
pub mod error;
pub mod lock;
pub mod models;
pub mod output;
pub mod processing;
pub mod registry;
pub mod request;
pub mod service;
pub mod store;

pub use error::{AllocationError, Result};
pub use service::AllocationService;
