use regex::Regex;
use sha2::{Digest, Sha256};
use shared_types::{
    CanonicalField, NormalizedContact, RawRecord, ValidationError, ValidationReason,
};
use std::sync::LazyLock;

use super::field_mapper::ColumnMap;

/// Separates the identity components inside the dedup hash input. Every
/// normalizer strips control characters, so it never occurs in field content.
const HASH_SEPARATOR: char = '\u{1F}';

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@\x00-\x1F\x7F]+@[^\s@\x00-\x1F\x7F]+\.[^\s@\x00-\x1F\x7F]+$")
        .expect("email pattern is valid")
});

/// Turns one raw row into a canonical contact, or rejects the row
pub fn normalize(
    raw: &RawRecord,
    columns: &ColumnMap,
) -> Result<NormalizedContact, ValidationError> {
    let value = |field: CanonicalField| cell(raw, columns, field);

    let email = match value(CanonicalField::Email).and_then(normalize_email_input) {
        Some(email) if !is_valid_email(&email) => {
            return Err(ValidationError {
                row_index: raw.row_index,
                field: Some(CanonicalField::Email),
                reason: ValidationReason::InvalidEmailFormat,
            });
        }
        other => other,
    };

    let phone_raw = value(CanonicalField::Phone).and_then(clean_text);
    let normalized_phone = phone_raw.as_deref().and_then(normalize_phone);

    let first_name = value(CanonicalField::FirstName).and_then(clean_text);
    let last_name = value(CanonicalField::LastName).and_then(clean_text);
    let name = value(CanonicalField::Name)
        .and_then(clean_text)
        .or_else(|| compose_name(first_name.as_deref(), last_name.as_deref()));
    let normalized_name = name.as_deref().map(str::to_lowercase);

    if email.is_none() && normalized_phone.is_none() && normalized_name.is_none() {
        return Err(ValidationError {
            row_index: raw.row_index,
            field: None,
            reason: ValidationReason::InsufficientIdentity,
        });
    }

    let dedup_hash = dedup_hash(
        email.as_deref(),
        normalized_phone.as_deref(),
        normalized_name.as_deref(),
    );

    Ok(NormalizedContact {
        row_index: raw.row_index,
        normalized_email: email.clone(),
        email,
        phone: phone_raw.filter(|_| normalized_phone.is_some()),
        normalized_phone,
        name,
        normalized_name,
        first_name,
        last_name,
        company: value(CanonicalField::Company).and_then(clean_text),
        title: value(CanonicalField::Title).and_then(clean_text),
        dedup_hash,
    })
}

fn cell<'a>(raw: &'a RawRecord, columns: &ColumnMap, field: CanonicalField) -> Option<&'a str> {
    columns
        .column(field)
        .and_then(|index| raw.values.get(index))
        .map(String::as_str)
}

fn normalize_email_input(value: &str) -> Option<String> {
    let email = value.trim().to_lowercase();
    if email.is_empty() {
        None
    } else {
        Some(email)
    }
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email)
}

/// Lower-cased, trimmed email, or `None` when blank or malformed
pub fn normalize_email(value: &str) -> Option<String> {
    normalize_email_input(value).filter(|email| is_valid_email(email))
}

/// Digits only, keeping a leading `+`. Blank results mean "no phone".
pub fn normalize_phone(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if trimmed.starts_with('+') {
        Some(format!("+{}", digits))
    } else {
        Some(digits)
    }
}

/// Comparison form of a name: whitespace collapsed and lower-cased
pub fn normalize_name(value: &str) -> Option<String> {
    clean_text(value).map(|name| name.to_lowercase())
}

/// Trims, drops control characters and collapses internal whitespace
pub fn clean_text(value: &str) -> Option<String> {
    let cleaned = value
        .split_whitespace()
        .map(|word| word.chars().filter(|c| !c.is_control()).collect::<String>())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn compose_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    match (first, last) {
        (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
        (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
        (None, None) => None,
    }
}

/// Fingerprint over the normalized identity fields; absent fields hash as empty
pub fn dedup_hash(
    normalized_email: Option<&str>,
    normalized_phone: Option<&str>,
    normalized_name: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_email.unwrap_or_default().as_bytes());
    hasher.update(HASH_SEPARATOR.to_string().as_bytes());
    hasher.update(normalized_phone.unwrap_or_default().as_bytes());
    hasher.update(HASH_SEPARATOR.to_string().as_bytes());
    hasher.update(normalized_name.unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::FieldMapping;

    fn columns(fields: &[Option<CanonicalField>]) -> ColumnMap {
        let mappings: Vec<FieldMapping> = fields
            .iter()
            .enumerate()
            .map(|(column_index, field)| FieldMapping {
                csv_column: format!("col{}", column_index),
                column_index,
                canonical_field: *field,
                confidence: if field.is_some() { 100 } else { 0 },
            })
            .collect();
        ColumnMap::from_mappings(&mappings).unwrap()
    }

    fn row(values: &[&str]) -> RawRecord {
        RawRecord {
            row_index: 1,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn email_name_phone() -> ColumnMap {
        columns(&[
            Some(CanonicalField::Email),
            Some(CanonicalField::Name),
            Some(CanonicalField::Phone),
        ])
    }

    #[test]
    fn test_normalize_basic_row() {
        let contact = normalize(&row(&["j@x.com", "John Doe", "555-1234"]), &email_name_phone())
            .unwrap();

        assert_eq!(contact.normalized_email.as_deref(), Some("j@x.com"));
        assert_eq!(contact.normalized_phone.as_deref(), Some("5551234"));
        assert_eq!(contact.name.as_deref(), Some("John Doe"));
        assert_eq!(contact.normalized_name.as_deref(), Some("john doe"));
        assert_eq!(contact.phone.as_deref(), Some("555-1234"));
    }

    #[test]
    fn test_email_lowercased_and_trimmed() {
        let contact =
            normalize(&row(&["  Jane.Doe@Example.COM ", "", ""]), &email_name_phone()).unwrap();
        assert_eq!(contact.normalized_email.as_deref(), Some("jane.doe@example.com"));
    }

    #[test]
    fn test_invalid_email_rejected() {
        for bad in ["not-an-email", "a@b", "@x.com", "a b@x.com", "a@@x.com"] {
            let err = normalize(&row(&[bad, "Ann", "123"]), &email_name_phone()).unwrap_err();
            assert_eq!(err.reason, ValidationReason::InvalidEmailFormat);
            assert_eq!(err.field, Some(CanonicalField::Email));
        }
    }

    #[test]
    fn test_phone_normalization() {
        assert_eq!(normalize_phone("+1 (555) 123-4567").as_deref(), Some("+15551234567"));
        assert_eq!(normalize_phone("555.123.4567").as_deref(), Some("5551234567"));
        assert_eq!(normalize_phone("ext 1+2").as_deref(), Some("12"));
        assert_eq!(normalize_phone("n/a"), None);
        assert_eq!(normalize_phone("+"), None);
    }

    #[test]
    fn test_absent_phone_is_not_an_error() {
        let contact = normalize(&row(&["a@b.co", "Ann", "--"]), &email_name_phone()).unwrap();
        assert_eq!(contact.normalized_phone, None);
        assert_eq!(contact.phone, None);
    }

    #[test]
    fn test_name_whitespace_collapsed() {
        let contact =
            normalize(&row(&["", "  Mary   Ann\tSmith ", ""]), &email_name_phone()).unwrap();
        assert_eq!(contact.name.as_deref(), Some("Mary Ann Smith"));
        assert_eq!(contact.normalized_name.as_deref(), Some("mary ann smith"));
    }

    #[test]
    fn test_name_composed_from_parts() {
        let map = columns(&[
            Some(CanonicalField::FirstName),
            Some(CanonicalField::LastName),
            Some(CanonicalField::Company),
        ]);
        let contact = normalize(&row(&["Ada", "Lovelace", " Analytical  Engines "]), &map).unwrap();

        assert_eq!(contact.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(contact.first_name.as_deref(), Some("Ada"));
        assert_eq!(contact.company.as_deref(), Some("Analytical Engines"));
    }

    #[test]
    fn test_insufficient_identity() {
        let map = columns(&[
            Some(CanonicalField::Email),
            Some(CanonicalField::Name),
            Some(CanonicalField::Phone),
            Some(CanonicalField::Company),
        ]);
        let mut raw = row(&["", " ", "", "Acme"]);
        raw.row_index = 4;

        let err = normalize(&raw, &map).unwrap_err();
        assert_eq!(
            err,
            ValidationError {
                row_index: 4,
                field: None,
                reason: ValidationReason::InsufficientIdentity,
            }
        );
    }

    #[test]
    fn test_dedup_hash_is_pure() {
        let a = dedup_hash(Some("a@b.co"), Some("123"), Some("ann"));
        let b = dedup_hash(Some("a@b.co"), Some("123"), Some("ann"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, dedup_hash(Some("a@b.cx"), Some("123"), Some("ann")));
        assert_ne!(a, dedup_hash(Some("a@b.co"), Some("124"), Some("ann")));
        assert_ne!(a, dedup_hash(Some("a@b.co"), Some("123"), Some("anne")));
    }

    #[test]
    fn test_dedup_hash_no_concatenation_collision() {
        assert_ne!(
            dedup_hash(Some("ab"), Some("1"), None),
            dedup_hash(Some("a"), Some("b1"), None)
        );
        assert_ne!(
            dedup_hash(None, Some("12"), Some("3")),
            dedup_hash(None, Some("1"), Some("23"))
        );
    }

    #[test]
    fn test_control_characters_stripped() {
        let contact = normalize(&row(&["", "Ann\u{1F}Lee", ""]), &email_name_phone()).unwrap();
        assert_eq!(contact.normalized_name.as_deref(), Some("annlee"));
    }
}
