//! Customer contact normalization for gateway payloads.
//!
//! The gateway refuses charges for customers with malformed CPF/CNPJ or
//! phone numbers, so contact data read from `clients` is cleaned here and
//! dropped (with a warning) when it cannot be salvaged.

use phonenumber::country::Id as CountryId;
use regex::Regex;
use std::sync::OnceLock;

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    })
}

/// Digits of a CPF (11) or CNPJ (14); `None` for anything else.
pub fn clean_tax_id(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        11 | 14 if !digits.chars().all(|c| c == digits.as_bytes()[0] as char) => Some(digits),
        _ => None,
    }
}

/// Normalizes a Brazilian phone to its national digits (`11987654321`).
///
/// Uses libphonenumber rules for region BR; returns `None` when the number
/// is not a valid Brazilian phone.
pub fn normalize_br_phone(raw: &str) -> Option<String> {
    if raw.trim().is_empty() || raw.len() < 8 {
        return None;
    }

    match phonenumber::parse(Some(CountryId::BR), raw) {
        Ok(number) if phonenumber::is_valid(&number) && number.code().value() == 55 => {
            Some(number.national().value().to_string())
        }
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Phone number did not parse as BR: {:?}", e);
            None
        }
    }
}

pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    email.len() >= 5 && email_regex().is_match(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_tax_id() {
        assert_eq!(
            clean_tax_id("123.456.789-09").as_deref(),
            Some("12345678909")
        );
        assert_eq!(
            clean_tax_id("12.345.678/0001-95").as_deref(),
            Some("12345678000195")
        );
        assert_eq!(clean_tax_id("111.111.111-11"), None);
        assert_eq!(clean_tax_id("1234"), None);
    }

    #[test]
    fn test_normalize_br_phone() {
        assert_eq!(
            normalize_br_phone("(11) 98765-4321").as_deref(),
            Some("11987654321")
        );
        assert_eq!(
            normalize_br_phone("+5521987654321").as_deref(),
            Some("21987654321")
        );
        assert_eq!(normalize_br_phone("123"), None);
        assert_eq!(normalize_br_phone(""), None);
    }

    #[test]
    fn test_is_valid_email() {
        assert!(is_valid_email("maria@example.com"));
        assert!(!is_valid_email("maria@example"));
        assert!(!is_valid_email("not an email"));
    }
}
