//! Subscriber phone number checks.

use regex::Regex;
use std::sync::OnceLock;

fn matches_msisdn(candidate: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(\+?256|0)?[0-9]{9}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(candidate))
}

fn strip_formatting(phone: &str) -> String {
    phone
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect()
}

pub fn is_valid_phone(phone: &str) -> bool {
    matches_msisdn(&strip_formatting(phone))
}

/// Canonical `256XXXXXXXXX` form, or `None` when the number does not validate.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let cleaned = strip_formatting(phone);
    if !matches_msisdn(&cleaned) {
        return None;
    }

    let digits = cleaned.trim_start_matches('+');
    let local = match digits.len() {
        12 => &digits[3..],
        10 => &digits[1..],
        _ => digits,
    };

    Some(format!("256{}", local))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_formats() {
        for phone in [
            "+256712345678",
            "256712345678",
            "0712345678",
            "712345678",
            "+256 712-345 678",
            "(0712) 345678",
        ] {
            assert!(is_valid_phone(phone), "{} should be valid", phone);
            assert_eq!(normalize_phone(phone).as_deref(), Some("256712345678"));
        }
    }

    #[test]
    fn bare_local_number_starting_with_country_digits() {
        assert_eq!(normalize_phone("256712345").as_deref(), Some("256256712345"));
    }

    #[test]
    fn rejects_wrong_lengths_and_letters() {
        for phone in ["", "07123", "+2567123456789", "07123abc78", "+1 555 0100"] {
            assert!(!is_valid_phone(phone), "{} should be invalid", phone);
            assert!(normalize_phone(phone).is_none());
        }
    }
}
