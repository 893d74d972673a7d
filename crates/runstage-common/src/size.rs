//! Size parsing and formatting
//!
//! Sizes in configuration and tool output use single-letter binary suffixes
//! (`512`, `100K`, `1.5G`, `2T`).

use crate::error::{Result, RunstageError};
use byte_unit::{Byte, Unit, UnitType};

/// Parse a size such as `"1.5G"` into bytes.
///
/// Suffixes `K`, `M`, `G` and `T` are powers of 1024 and may carry a
/// fractional part. Without a suffix the value must be a whole number of bytes.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = || RunstageError::Parse(format!("Invalid size: {input:?}"));

    let last = trimmed.chars().last().ok_or_else(invalid)?;
    let exponent = match last.to_ascii_uppercase() {
        'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        _ => return trimmed.parse::<u64>().map_err(|_| invalid()),
    };

    let number: f64 = trimmed[..trimmed.len() - 1]
        .trim()
        .parse()
        .map_err(|_| invalid())?;
    if !number.is_finite() || number < 0.0 {
        return Err(invalid());
    }

    Ok((number * 1024f64.powi(exponent)) as u64)
}

/// Format a byte count with binary units, e.g. `1.50 KiB`
pub fn format_size(bytes: u64) -> String {
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    if adjusted.get_unit() == Unit::B {
        format!("{bytes} B")
    } else {
        format!("{:.2} {}", adjusted.get_value(), adjusted.get_unit())
    }
}
