//! Protocol version table.
//!
//! MCP versions are dated revisions. The strings below appear verbatim
//! in `initialize` params and responses; ordering in the table is newest
//! first.

use chrono::NaiveDate;

pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

/// Whether this client accepts the given protocol version.
pub fn is_supported(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Whether the string is a well-formed `YYYY-MM-DD` revision date.
pub fn is_valid_format(version: &str) -> bool {
    NaiveDate::parse_from_str(version, "%Y-%m-%d").is_ok()
}
