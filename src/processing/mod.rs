//! Allocation logic over address blocks.
//!
//! - [`subnet_finder`] - finding free blocks of a requested size

mod subnet_finder;

pub use subnet_finder::{available_blocks, find_all, find_first};
