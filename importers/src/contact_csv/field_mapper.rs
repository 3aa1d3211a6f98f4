use shared_types::{CanonicalField, FieldMapping, MappingError};
use std::collections::{BTreeMap, HashMap};

pub const FULL_CONFIDENCE: u8 = 100;

const BUILTIN_SYNONYMS: &[(CanonicalField, &[&str])] = &[
    (
        CanonicalField::Email,
        &["email", "e-mail", "mail", "email address", "e-mail address", "email_address"],
    ),
    (
        CanonicalField::Phone,
        &[
            "phone",
            "telephone",
            "tel",
            "mobile",
            "phone number",
            "phone_number",
            "mobile phone",
            "cell",
        ],
    ),
    (
        CanonicalField::Name,
        &["name", "full name", "full_name", "fullname", "contact name", "display name"],
    ),
    (
        CanonicalField::FirstName,
        &["first name", "first_name", "firstname", "given name"],
    ),
    (
        CanonicalField::LastName,
        &["last name", "last_name", "lastname", "surname", "family name"],
    ),
    (
        CanonicalField::Company,
        &["company", "company name", "organization", "organisation", "employer"],
    ),
    (
        CanonicalField::Title,
        &["title", "job title", "job_title", "position", "role"],
    ),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynonymConfigError {
    #[error("Unknown canonical field in synonym config: {0}")]
    UnknownField(String),

    #[error("Synonym '{synonym}' is claimed by both {first} and {second}")]
    Conflict {
        synonym: String,
        first: CanonicalField,
        second: CanonicalField,
    },
}

/// Immutable header synonym table, built once at startup
#[derive(Debug, Clone)]
pub struct FieldSynonyms {
    by_synonym: HashMap<String, CanonicalField>,
    by_field: BTreeMap<CanonicalField, Vec<String>>,
}

impl FieldSynonyms {
    pub fn builtin() -> Self {
        let mut synonyms = Self {
            by_synonym: HashMap::new(),
            by_field: BTreeMap::new(),
        };
        for (field, words) in BUILTIN_SYNONYMS {
            for word in *words {
                // Built-in sets are disjoint
                let _ = synonyms.insert(*field, word);
            }
        }
        synonyms
    }

    /// Built-in table extended with configured synonyms, keyed by field name
    pub fn with_additions(
        additions: &HashMap<String, Vec<String>>,
    ) -> Result<Self, SynonymConfigError> {
        let mut synonyms = Self::builtin();

        let mut keys: Vec<&String> = additions.keys().collect();
        keys.sort();

        for key in keys {
            let field = CanonicalField::parse(key)
                .ok_or_else(|| SynonymConfigError::UnknownField(key.clone()))?;
            for word in &additions[key] {
                synonyms.insert(field, word)?;
            }
        }

        Ok(synonyms)
    }

    fn insert(&mut self, field: CanonicalField, word: &str) -> Result<(), SynonymConfigError> {
        let key = header_key(word);
        if key.is_empty() {
            return Ok(());
        }
        match self.by_synonym.get(&key) {
            Some(existing) if *existing == field => Ok(()),
            Some(existing) => Err(SynonymConfigError::Conflict {
                synonym: key,
                first: *existing,
                second: field,
            }),
            None => {
                self.by_synonym.insert(key.clone(), field);
                self.by_field.entry(field).or_default().push(key);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, header: &str) -> Option<CanonicalField> {
        self.by_synonym.get(&header_key(header)).copied()
    }

    pub fn synonyms_for(&self, field: CanonicalField) -> &[String] {
        self.by_field.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Default for FieldSynonyms {
    fn default() -> Self {
        Self::builtin()
    }
}

fn header_key(header: &str) -> String {
    header.trim().to_lowercase()
}

/// Maps CSV headers onto canonical fields by exact synonym membership
#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
    synonyms: FieldSynonyms,
}

impl FieldMapper {
    pub fn new(synonyms: FieldSynonyms) -> Self {
        Self { synonyms }
    }

    /// One mapping per header, in header order. Unrecognised headers are kept
    /// with no canonical field so they can be reviewed.
    pub fn map_fields(&self, headers: &[String]) -> Vec<FieldMapping> {
        headers
            .iter()
            .enumerate()
            .map(|(column_index, header)| {
                let canonical_field = self.synonyms.lookup(header);
                FieldMapping {
                    csv_column: header.clone(),
                    column_index,
                    canonical_field,
                    confidence: if canonical_field.is_some() {
                        FULL_CONFIDENCE
                    } else {
                        0
                    },
                }
            })
            .collect()
    }
}

/// Builds the mapping table for a job from a reviewed override list.
///
/// Headers the override does not mention are left unmapped. Column names are
/// always taken from the file, never from the request.
pub fn apply_overrides(
    headers: &[String],
    overrides: &[FieldMapping],
) -> Result<Vec<FieldMapping>, MappingError> {
    let mut by_column: HashMap<usize, Option<CanonicalField>> = HashMap::new();
    for mapping in overrides {
        if mapping.column_index >= headers.len() {
            return Err(MappingError::UnknownColumn {
                column_index: mapping.column_index,
            });
        }
        by_column.insert(mapping.column_index, mapping.canonical_field);
    }

    let mappings: Vec<FieldMapping> = headers
        .iter()
        .enumerate()
        .map(|(column_index, header)| {
            let canonical_field = by_column.get(&column_index).copied().flatten();
            FieldMapping {
                csv_column: header.clone(),
                column_index,
                canonical_field,
                confidence: if canonical_field.is_some() {
                    FULL_CONFIDENCE
                } else {
                    0
                },
            }
        })
        .collect();

    check_ambiguity(&mappings)?;
    Ok(mappings)
}

/// Fails when two or more columns claim the same canonical field at full confidence
pub fn check_ambiguity(mappings: &[FieldMapping]) -> Result<(), MappingError> {
    let mut claims: BTreeMap<CanonicalField, Vec<String>> = BTreeMap::new();
    for mapping in mappings {
        if let Some(field) = mapping.canonical_field {
            if mapping.confidence >= FULL_CONFIDENCE {
                claims.entry(field).or_default().push(mapping.csv_column.clone());
            }
        }
    }

    match claims.into_iter().find(|(_, columns)| columns.len() > 1) {
        Some((field, columns)) => Err(MappingError::Ambiguous { field, columns }),
        None => Ok(()),
    }
}

/// Column index per canonical field for an unambiguous mapping table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    columns: BTreeMap<CanonicalField, usize>,
}

impl ColumnMap {
    pub fn from_mappings(mappings: &[FieldMapping]) -> Result<Self, MappingError> {
        check_ambiguity(mappings)?;

        let columns = mappings
            .iter()
            .filter_map(|m| m.canonical_field.map(|field| (field, m.column_index)))
            .collect();

        Ok(Self { columns })
    }

    pub fn column(&self, field: CanonicalField) -> Option<usize> {
        self.columns.get(&field).copied()
    }

    pub fn is_mapped(&self, field: CanonicalField) -> bool {
        self.columns.contains_key(&field)
    }

    pub fn mapped_fields(&self) -> impl Iterator<Item = CanonicalField> + '_ {
        self.columns.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_maps_common_headers() {
        let mappings =
            FieldMapper::default().map_fields(&headers(&["Email", "Full Name", "Phone"]));

        assert_eq!(mappings.len(), 3);
        assert!(mappings.iter().all(|m| m.confidence == 100));
        assert_eq!(mappings[0].canonical_field, Some(CanonicalField::Email));
        assert_eq!(mappings[1].canonical_field, Some(CanonicalField::Name));
        assert_eq!(mappings[2].canonical_field, Some(CanonicalField::Phone));
    }

    #[test]
    fn test_case_and_whitespace_insensitive() {
        let mappings =
            FieldMapper::default().map_fields(&headers(&["  E-MAIL ", "TEL", "Surname"]));

        assert_eq!(mappings[0].canonical_field, Some(CanonicalField::Email));
        assert_eq!(mappings[1].canonical_field, Some(CanonicalField::Phone));
        assert_eq!(mappings[2].canonical_field, Some(CanonicalField::LastName));
    }

    #[test]
    fn test_unmatched_headers_preserved() {
        let mappings = FieldMapper::default().map_fields(&headers(&["Email", "Favourite Colour"]));

        assert_eq!(mappings[1].csv_column, "Favourite Colour");
        assert_eq!(mappings[1].canonical_field, None);
        assert_eq!(mappings[1].confidence, 0);
    }

    #[test]
    fn test_no_fuzzy_matching() {
        let mappings = FieldMapper::default().map_fields(&headers(&["Emails", "Phone #"]));
        assert!(mappings.iter().all(|m| m.canonical_field.is_none()));
    }

    #[test]
    fn test_ambiguous_headers_reported() {
        let mappings = FieldMapper::default().map_fields(&headers(&["Email", "E-mail", "Name"]));

        let err = check_ambiguity(&mappings).unwrap_err();
        assert_eq!(
            err,
            MappingError::Ambiguous {
                field: CanonicalField::Email,
                columns: vec!["Email".to_string(), "E-mail".to_string()],
            }
        );
        assert!(ColumnMap::from_mappings(&mappings).is_err());
    }

    #[test]
    fn test_overrides_resolve_ambiguity() {
        let file_headers = headers(&["Email", "E-mail", "Name"]);
        let overrides = vec![
            FieldMapping {
                csv_column: "ignored".to_string(),
                column_index: 1,
                canonical_field: Some(CanonicalField::Email),
                confidence: 0,
            },
            FieldMapping {
                csv_column: "Name".to_string(),
                column_index: 2,
                canonical_field: Some(CanonicalField::Name),
                confidence: 100,
            },
        ];

        let mappings = apply_overrides(&file_headers, &overrides).unwrap();
        assert_eq!(mappings[0].canonical_field, None);
        assert_eq!(mappings[1].csv_column, "E-mail");
        assert_eq!(mappings[1].confidence, 100);

        let columns = ColumnMap::from_mappings(&mappings).unwrap();
        assert_eq!(columns.column(CanonicalField::Email), Some(1));
        assert_eq!(columns.column(CanonicalField::Name), Some(2));
        assert!(!columns.is_mapped(CanonicalField::Phone));
    }

    #[test]
    fn test_override_unknown_column() {
        let overrides = vec![FieldMapping {
            csv_column: "Nope".to_string(),
            column_index: 7,
            canonical_field: Some(CanonicalField::Email),
            confidence: 100,
        }];
        let err = apply_overrides(&headers(&["Email"]), &overrides).unwrap_err();
        assert_eq!(err, MappingError::UnknownColumn { column_index: 7 });
    }

    #[test]
    fn test_configured_synonyms() {
        let additions = HashMap::from([(
            "company".to_string(),
            vec!["Firma".to_string(), "  Account ".to_string()],
        )]);
        let synonyms = FieldSynonyms::with_additions(&additions).unwrap();

        assert_eq!(synonyms.lookup("firma"), Some(CanonicalField::Company));
        assert_eq!(synonyms.lookup("ACCOUNT"), Some(CanonicalField::Company));
        assert!(synonyms
            .synonyms_for(CanonicalField::Company)
            .contains(&"account".to_string()));
    }

    #[test]
    fn test_conflicting_synonym_rejected() {
        let additions = HashMap::from([("phone".to_string(), vec!["E-Mail".to_string()])]);
        let err = FieldSynonyms::with_additions(&additions).unwrap_err();
        assert_eq!(
            err,
            SynonymConfigError::Conflict {
                synonym: "e-mail".to_string(),
                first: CanonicalField::Email,
                second: CanonicalField::Phone,
            }
        );

        let unknown = HashMap::from([("fax".to_string(), vec!["fax".to_string()])]);
        assert!(matches!(
            FieldSynonyms::with_additions(&unknown),
            Err(SynonymConfigError::UnknownField(_))
        ));
    }
}
