//! Terminal output utilities.
//!
//! Rows are comma separated, quoted and right-aligned so they line up in a
//! terminal and still load as CSV.

use crate::models::{AddressBlock, ReservationRecord};
use colored::{ColoredString, Colorize};
use itertools::Itertools;

/// Format a value as a quoted, right-aligned field.
///
/// # Arguments
/// * `value` - The value to format
/// * `width` - The minimum width of the field
///
/// # Returns
/// A quoted, right-aligned string
pub fn format_field<T: ToString>(value: T, width: usize) -> String {
    let value_str = value.to_string();
    let quoted = format!("\"{value_str}\"");
    let quoted_len = quoted.len();

    if quoted_len >= width {
        quoted
    } else {
        format!("{quoted:>width$}")
    }
}

/// Lifecycle state of a record.
pub fn status_label(record: &ReservationRecord) -> &'static str {
    match (record.locked, record.assigned) {
        (true, true) => "assigned",
        (true, false) => "reserved",
        (false, _) => "released",
    }
}

fn colored_status(record: &ReservationRecord, width: usize) -> ColoredString {
    let field = format_field(status_label(record), width);
    match (record.locked, record.assigned) {
        (true, true) => field.green(),
        (true, false) => field.yellow(),
        (false, _) => field.dimmed(),
    }
}

pub fn record_header() -> String {
    [
        format_field("cidr_block", 20),
        format_field("status", 10),
        format_field("region", 16),
        format_field("cloud", 8),
        format_field("account_alias", 18),
        format_field("lock_date", 27),
    ]
    .iter()
    .join(",")
}

pub fn record_row(record: &ReservationRecord) -> String {
    row_with_status(record, format_field(status_label(record), 10))
}

fn row_with_status(record: &ReservationRecord, status: String) -> String {
    [
        format_field(record.cidr_block, 20),
        status,
        format_field(&record.region, 16),
        format_field(&record.cloud, 8),
        format_field(&record.account_alias, 18),
        format_field(record.lock_date.format("%Y-%m-%dT%H:%M:%SZ"), 27),
    ]
    .iter()
    .join(",")
}

/// Print records, one row each, after a header.
pub fn print_records(records: &[ReservationRecord]) {
    log::info!("# Got record count = {}", records.len());
    println!("{}", record_header());
    for record in records {
        println!(
            "{}",
            row_with_status(record, colored_status(record, 10).to_string())
        );
    }
}

/// Print blocks with their address range and size.
pub fn print_cidrs(cidrs: &[AddressBlock]) {
    log::info!("# Got CIDR count = {}", cidrs.len());
    println!(
        "{},{},{},{}",
        format_field("cnt", 6),
        format_field("cidr_block", 20),
        format_field("last_address", 17),
        format_field("addresses", 12)
    );
    for (i, cidr) in cidrs.iter().enumerate() {
        println!(
            "{},{},{},{}",
            format_field(i + 1, 6),
            format_field(cidr, 20),
            format_field(cidr.hi(), 17),
            format_field(cidr.size(), 12)
        );
    }
    if cidrs.is_empty() {
        println!("#{}# no CIDR blocks", "NOTE".on_red());
    }
}
