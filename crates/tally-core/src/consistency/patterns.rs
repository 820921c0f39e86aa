//! Count parsing for extracted ballot figures.
//!
//! Extraction models report counts either as JSON integers or as digit
//! strings, sometimes with thousands separators ("1,204", "12 480").

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Plain digits, or groups of three separated by `,`, `_` or a space.
    pub static ref COUNT_PATTERN: Regex = Regex::new(
        r"^(?:\d+|\d{1,3}(?:([,_ ])\d{3})(?:[,_ ]\d{3})*)$"
    ).unwrap();
}

/// Parse a digit string into a count. Returns `None` for anything that is
/// not a non-negative integer.
pub fn parse_count_str(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    let caps = COUNT_PATTERN.captures(trimmed)?;
    if let Some(sep) = caps.get(1) {
        // "1,204 500" mixes separators
        let sep = sep.as_str().chars().next();
        if trimmed.chars().any(|c| !c.is_ascii_digit() && Some(c) != sep) {
            return None;
        }
    }
    trimmed
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_digits() {
        assert_eq!(parse_count_str("520"), Some(520));
        assert_eq!(parse_count_str(" 0 "), Some(0));
    }

    #[test]
    fn test_thousands_separators() {
        assert_eq!(parse_count_str("1,204"), Some(1204));
        assert_eq!(parse_count_str("12 480"), Some(12480));
        assert_eq!(parse_count_str("3_000_000"), Some(3_000_000));
    }

    #[test]
    fn test_rejects_non_counts() {
        assert_eq!(parse_count_str("-5"), None);
        assert_eq!(parse_count_str("4.5"), None);
        assert_eq!(parse_count_str("12,34"), None);
        assert_eq!(parse_count_str("1,204 500"), None);
        assert_eq!(parse_count_str("five"), None);
        assert_eq!(parse_count_str(""), None);
    }
}
