// SSN normalization for reviewer-flagged rows

use crate::error::{Result, UnmergeError};

pub const SSN_DIGITS: usize = 9;

/// Strip everything but ASCII digits and require exactly nine of them.
///
/// "123-45-6789" → "123456789"
pub fn normalize_ssn(raw: &str) -> Result<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() != SSN_DIGITS {
        return Err(UnmergeError::InvalidSsn {
            len: digits.len(),
            digits,
        });
    }

    Ok(digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_formats() {
        assert_eq!(normalize_ssn("123-45-6789").unwrap(), "123456789");
        assert_eq!(normalize_ssn(" 123 45 6789 ").unwrap(), "123456789");
        assert_eq!(normalize_ssn("012345678").unwrap(), "012345678");
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = normalize_ssn("12-345").unwrap_err();
        assert!(err.is_validation());
        assert!(matches!(err, UnmergeError::InvalidSsn { len: 5, .. }));

        assert!(normalize_ssn("1234567890").is_err());
        assert!(normalize_ssn("").is_err());
    }
}
