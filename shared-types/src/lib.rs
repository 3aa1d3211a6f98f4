use serde::{Deserialize, Serialize};

pub mod contact;
pub mod import;
pub mod import_job;

pub use contact::{Contact, ContactsResponse, ExistingContact};
pub use import::{
    CanonicalField, CheckDuplicatesRequest, CheckDuplicatesResponse, DuplicateCheckResult,
    DuplicateCheckStats, DuplicateLookupError, DuplicateMatch, DuplicateStrategy, FieldMapping,
    MappingError, MatchType, NormalizedContact, ParseError, RawRecord, RecommendedAction,
    RowWriteError, ValidationError, ValidationReason,
};
pub use import_job::{
    FieldMappingResponse, ImportIssue, ImportJob, ImportJobListResponse, ImportJobStatus,
    ImportRowLog, ImportRowLogsResponse, ImportSummary, RowOutcome, StartImportRequest,
    UpdateFieldMappingRequest, UploadResponse,
};

/// Error response for API endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
