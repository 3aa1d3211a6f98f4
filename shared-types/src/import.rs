use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

/// Contact attributes a CSV column can be mapped onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Email,
    Phone,
    Name,
    FirstName,
    LastName,
    Company,
    Title,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 7] = [
        CanonicalField::Email,
        CanonicalField::Phone,
        CanonicalField::Name,
        CanonicalField::FirstName,
        CanonicalField::LastName,
        CanonicalField::Company,
        CanonicalField::Title,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::Email => "email",
            CanonicalField::Phone => "phone",
            CanonicalField::Name => "name",
            CanonicalField::FirstName => "first_name",
            CanonicalField::LastName => "last_name",
            CanonicalField::Company => "company",
            CanonicalField::Title => "title",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|field| field.as_str() == value.trim())
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one CSV header maps onto a canonical field.
///
/// `confidence` is binary for dictionary mappings (100 on a synonym hit, 0
/// otherwise). Reviewed overrides are always 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FieldMapping {
    pub csv_column: String,
    pub column_index: usize,
    pub canonical_field: Option<CanonicalField>,
    pub confidence: u8,
}

/// One data row of an uploaded file, cells aligned to the header row.
///
/// `row_index` is the 1-based position of the row among the data rows of the
/// file (the header row is not counted), so it points back at the source even
/// after blank rows are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub row_index: usize,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NormalizedContact {
    pub row_index: usize,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub normalized_email: Option<String>,
    pub normalized_phone: Option<String>,
    pub normalized_name: Option<String>,
    pub dedup_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Email,
    Phone,
    Name,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Email => "email",
            MatchType::Phone => "phone",
            MatchType::Name => "name",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Skip,
    Merge,
    Replace,
    KeepBoth,
    Import,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::Skip => "skip",
            RecommendedAction::Merge => "merge",
            RecommendedAction::Replace => "replace",
            RecommendedAction::KeepBoth => "keep_both",
            RecommendedAction::Import => "import",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DuplicateMatch {
    pub contact_id: i64,
    pub match_type: MatchType,
    pub confidence: f32,
    pub recommended_action: RecommendedAction,
}

/// Job-wide disposition for rows that matched an existing contact.
///
/// `Replace` and `KeepBoth` are never chosen per row; they only apply when a
/// caller opts the whole job into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateStrategy {
    #[default]
    Recommended,
    Replace,
    KeepBoth,
    Skip,
}

impl DuplicateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateStrategy::Recommended => "recommended",
            DuplicateStrategy::Replace => "replace",
            DuplicateStrategy::KeepBoth => "keep_both",
            DuplicateStrategy::Skip => "skip",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recommended" => Some(DuplicateStrategy::Recommended),
            "replace" => Some(DuplicateStrategy::Replace),
            "keep_both" => Some(DuplicateStrategy::KeepBoth),
            "skip" => Some(DuplicateStrategy::Skip),
            _ => None,
        }
    }

    /// Final action for a row given what duplicate detection recommended
    pub fn resolve(&self, recommended: RecommendedAction) -> RecommendedAction {
        if recommended == RecommendedAction::Import {
            return RecommendedAction::Import;
        }
        match self {
            DuplicateStrategy::Recommended => recommended,
            DuplicateStrategy::Replace => RecommendedAction::Replace,
            DuplicateStrategy::KeepBoth => RecommendedAction::KeepBoth,
            DuplicateStrategy::Skip => RecommendedAction::Skip,
        }
    }
}

/// Request body of the duplicate-check service
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CheckDuplicatesRequest {
    pub contacts: Vec<NormalizedContact>,
    pub import_id: Option<i64>,
    pub organization_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DuplicateCheckResult {
    pub index: usize,
    pub duplicates: Vec<DuplicateMatch>,
    pub has_duplicates: bool,
    pub recommended_action: RecommendedAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DuplicateCheckStats {
    pub total_checked: u64,
    pub with_duplicates: u64,
    pub email_matches: u64,
    pub phone_matches: u64,
    pub name_matches: u64,
    pub indexed_contacts: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CheckDuplicatesResponse {
    pub results: Vec<DuplicateCheckResult>,
    pub stats: DuplicateCheckStats,
}

/// Job-fatal failure to read an uploaded file
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed quoting near line {line}")]
    MalformedQuoting { line: u64 },

    #[error("File contains no data rows")]
    EmptyFile,

    #[error("File is not valid UTF-8 (first invalid byte at offset {offset})")]
    Encoding { offset: usize },
}

impl ParseError {
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::MalformedQuoting { .. } => "malformed_quoting",
            ParseError::EmptyFile => "empty_file",
            ParseError::Encoding { .. } => "encoding",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("Columns {columns:?} all map to {field}; choose one explicitly")]
    Ambiguous {
        field: CanonicalField,
        columns: Vec<String>,
    },

    #[error("Mapping override names column {column_index} which is not in the file")]
    UnknownColumn { column_index: usize },
}

impl MappingError {
    pub fn code(&self) -> &'static str {
        match self {
            MappingError::Ambiguous { .. } => "ambiguous_mapping",
            MappingError::UnknownColumn { .. } => "unknown_column",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    InvalidEmailFormat,
    InsufficientIdentity,
}

impl ValidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationReason::InvalidEmailFormat => "invalid_email_format",
            ValidationReason::InsufficientIdentity => "insufficient_identity",
        }
    }
}

/// Row-scoped rejection raised by normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("Row {row_index}: {}", reason.as_str())]
pub struct ValidationError {
    pub row_index: usize,
    pub field: Option<CanonicalField>,
    pub reason: ValidationReason,
}

/// Building the organization's contact index failed after retries
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Duplicate lookup failed after {attempts} attempt(s): {message}")]
pub struct DuplicateLookupError {
    pub attempts: u32,
    pub message: String,
}

/// Row-scoped write failure during the apply phase
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowWriteError {
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Write timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Target contact {0} no longer exists")]
    ContactNotFound(i64),

    #[error("Database error: {0}")]
    Database(String),
}
