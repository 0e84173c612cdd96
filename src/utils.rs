/// Utility functions for rounding and timestamp formatting
use time::{format_description, OffsetDateTime};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    match format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]") {
        Ok(format) => dt.format(&format).unwrap_or_else(|_| dt.to_string()),
        Err(_) => dt.to_string(),
    }
}

/// Mean of values counted in tenths, rounded to one decimal place
///
/// The division happens on the integer total so an exact half such as
/// 20 / 8 = 2.5 tenths is never nudged below .5 by float summation, and
/// rounds away from zero.
pub fn mean_to_tenth(sum_tenths: u64, count: usize) -> f64 {
    (sum_tenths as f64 / count as f64).round() / 10.0
}

/// Milliseconds since the Unix epoch
pub fn unix_millis(dt: &OffsetDateTime) -> i64 {
    (dt.unix_timestamp_nanos() / 1_000_000) as i64
}
