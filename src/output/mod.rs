//! Output formatting for allocation results.
//!
//! - [`terminal`] - aligned, quoted rows with colored status
//! - [`cidrs_json`] - the `{"cidrs": [...]}` body returned by listings

mod terminal;

pub use terminal::{
    format_field, print_cidrs, print_records, record_header, record_row, status_label,
};

use crate::models::AddressBlock;

/// Serialize blocks as `{"cidrs": ["10.0.0.0/24", ...]}`.
pub fn cidrs_json(cidrs: &[AddressBlock]) -> Result<String, serde_json::Error> {
    serde_json::to_string(&serde_json::json!({ "cidrs": cidrs }))
}
