use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::import::{CanonicalField, DuplicateStrategy, FieldMapping};

/// One execution of the import pipeline over a single uploaded file.
///
/// Jobs are never deleted; they are the audit trail of what an upload did.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ImportJob {
    pub id: i64,
    pub organization_id: i64,
    pub filename: String,
    pub file_size: u64,
    pub total_rows: u64,
    pub status: ImportJobStatus,
    pub uploaded_by: Option<String>,
    pub duplicate_count: u64,
    pub imported_count: u64,
    pub merged_count: u64,
    pub skipped_count: u64,
    pub error_count: u64,
    pub duplicate_strategy: DuplicateStrategy,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl ImportJob {
    pub fn processed_rows(&self) -> u64 {
        self.imported_count + self.merged_count + self.skipped_count + self.error_count
    }
}

/// Job lifecycle. Status only ever moves forward:
/// `uploaded -> parsed -> duplicates_checked -> importing -> completed`,
/// with `failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, TS, PartialEq, Eq, Hash)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ImportJobStatus {
    Uploaded,
    Parsed,
    DuplicatesChecked,
    Importing,
    Completed,
    Failed,
}

impl ImportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportJobStatus::Uploaded => "uploaded",
            ImportJobStatus::Parsed => "parsed",
            ImportJobStatus::DuplicatesChecked => "duplicates_checked",
            ImportJobStatus::Importing => "importing",
            ImportJobStatus::Completed => "completed",
            ImportJobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uploaded" => Some(ImportJobStatus::Uploaded),
            "parsed" => Some(ImportJobStatus::Parsed),
            "duplicates_checked" => Some(ImportJobStatus::DuplicatesChecked),
            "importing" => Some(ImportJobStatus::Importing),
            "completed" => Some(ImportJobStatus::Completed),
            "failed" => Some(ImportJobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportJobStatus::Completed | ImportJobStatus::Failed)
    }

    /// States from which `self` may be entered
    pub fn predecessors(&self) -> &'static [ImportJobStatus] {
        match self {
            ImportJobStatus::Uploaded => &[],
            ImportJobStatus::Parsed => &[ImportJobStatus::Uploaded],
            ImportJobStatus::DuplicatesChecked => &[ImportJobStatus::Parsed],
            ImportJobStatus::Importing => &[ImportJobStatus::DuplicatesChecked],
            ImportJobStatus::Completed => &[ImportJobStatus::Importing],
            ImportJobStatus::Failed => &[
                ImportJobStatus::Uploaded,
                ImportJobStatus::Parsed,
                ImportJobStatus::DuplicatesChecked,
                ImportJobStatus::Importing,
            ],
        }
    }

    pub fn can_transition_to(&self, next: ImportJobStatus) -> bool {
        next.predecessors().contains(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, TS, PartialEq, Eq, Hash)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    Imported,
    Merged,
    Skipped,
    Failed,
}

impl RowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOutcome::Imported => "imported",
            RowOutcome::Merged => "merged",
            RowOutcome::Skipped => "skipped",
            RowOutcome::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "imported" => Some(RowOutcome::Imported),
            "merged" => Some(RowOutcome::Merged),
            "skipped" => Some(RowOutcome::Skipped),
            "failed" => Some(RowOutcome::Failed),
            _ => None,
        }
    }

    /// Counter column on `import_jobs` that this outcome increments
    pub fn counter_column(&self) -> &'static str {
        match self {
            RowOutcome::Imported => "imported_count",
            RowOutcome::Merged => "merged_count",
            RowOutcome::Skipped => "skipped_count",
            RowOutcome::Failed => "error_count",
        }
    }
}

/// Auditable per-row result of an import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ImportRowLog {
    pub row_index: usize,
    pub outcome: RowOutcome,
    pub reason: Option<String>,
    pub contact_id: Option<i64>,
}

/// A problem found while preparing an upload, job-wide or row-scoped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ImportIssue {
    pub row_index: Option<usize>,
    pub code: String,
    pub field: Option<CanonicalField>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ImportSummary {
    pub total_rows: u64,
    pub detected_fields: Vec<FieldMapping>,
    pub duplicates_found: u64,
    pub errors: Vec<ImportIssue>,
}

/// Response returned to the upload transport
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct UploadResponse {
    pub success: bool,
    pub import_id: i64,
    pub summary: ImportSummary,
}

#[derive(Debug, Clone, Default, Deserialize, TS)]
#[ts(export)]
pub struct StartImportRequest {
    #[serde(default)]
    pub duplicate_strategy: DuplicateStrategy,
}

/// Reviewed mapping table that replaces the synonym dictionary for one job
#[derive(Debug, Clone, Deserialize, TS)]
#[ts(export)]
pub struct UpdateFieldMappingRequest {
    pub mappings: Vec<FieldMapping>,
}

#[derive(Debug, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FieldMappingResponse {
    pub import_id: i64,
    pub mappings: Vec<FieldMapping>,
}

#[derive(Debug, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ImportJobListResponse {
    pub jobs: Vec<ImportJob>,
}

#[derive(Debug, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ImportRowLogsResponse {
    pub rows: Vec<ImportRowLog>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(ImportJobStatus::Uploaded.can_transition_to(ImportJobStatus::Parsed));
        assert!(ImportJobStatus::Parsed.can_transition_to(ImportJobStatus::DuplicatesChecked));
        assert!(ImportJobStatus::DuplicatesChecked.can_transition_to(ImportJobStatus::Importing));
        assert!(ImportJobStatus::Importing.can_transition_to(ImportJobStatus::Completed));
    }

    #[test]
    fn test_no_skipping_or_going_back() {
        assert!(!ImportJobStatus::Uploaded.can_transition_to(ImportJobStatus::DuplicatesChecked));
        assert!(!ImportJobStatus::Parsed.can_transition_to(ImportJobStatus::Uploaded));
        assert!(!ImportJobStatus::Importing.can_transition_to(ImportJobStatus::Parsed));
        assert!(!ImportJobStatus::Completed.can_transition_to(ImportJobStatus::Failed));
        assert!(!ImportJobStatus::Failed.can_transition_to(ImportJobStatus::Completed));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal() {
        for status in [
            ImportJobStatus::Uploaded,
            ImportJobStatus::Parsed,
            ImportJobStatus::DuplicatesChecked,
            ImportJobStatus::Importing,
        ] {
            assert!(status.can_transition_to(ImportJobStatus::Failed));
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_status_strings() {
        let json = serde_json::to_string(&ImportJobStatus::DuplicatesChecked).unwrap();
        assert_eq!(json, "\"duplicates_checked\"");
        assert_eq!(
            ImportJobStatus::parse("duplicates_checked"),
            Some(ImportJobStatus::DuplicatesChecked)
        );
        assert_eq!(ImportJobStatus::parse("pending"), None);
    }
}
