pub mod sqlite_store;

pub use crate::database::import_jobs::NewImportJob;
pub use crate::database::import_rows::RowWrite;
pub use sqlite_store::SqliteImportStore;

use anyhow::Result;
use async_trait::async_trait;
use shared_types::{
    DuplicateStrategy, ExistingContact, FieldMapping, ImportJob, ImportJobStatus, ImportRowLog,
    RowWriteError,
};
use std::time::Duration;

/// Persistence the import pipeline needs, and nothing more
#[async_trait]
pub trait ImportStore: Send + Sync {
    async fn create_job(&self, job: NewImportJob) -> Result<ImportJob>;
    async fn get_job(&self, organization_id: i64, job_id: i64) -> Result<Option<ImportJob>>;
    async fn list_jobs(&self, organization_id: i64) -> Result<Vec<ImportJob>>;
    async fn load_file(&self, job_id: i64) -> Result<Vec<u8>>;

    async fn save_mappings(&self, job_id: i64, mappings: &[FieldMapping]) -> Result<()>;
    async fn load_mappings(&self, job_id: i64) -> Result<Option<Vec<FieldMapping>>>;

    async fn record_preparation(
        &self,
        job_id: i64,
        total_rows: u64,
        duplicate_count: u64,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Guarded forward transition; `false` when the job was not in a predecessor state
    async fn transition(
        &self,
        job_id: i64,
        next: ImportJobStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;
    async fn begin_import(&self, job_id: i64, strategy: DuplicateStrategy) -> Result<bool>;
    async fn fail_interrupted(&self, reason: &str) -> Result<Vec<i64>>;

    /// Every contact of one organization, fetched in one go
    async fn existing_contacts(&self, organization_id: i64) -> Result<Vec<ExistingContact>>;

    /// Applies one row's contact write with its log entry and counter, or nothing
    async fn write_row(
        &self,
        job_id: i64,
        organization_id: i64,
        write: RowWrite,
        timeout: Duration,
    ) -> Result<ImportRowLog, RowWriteError>;
    async fn record_outcome(&self, job_id: i64, log: ImportRowLog) -> Result<()>;
    async fn row_logs(&self, job_id: i64) -> Result<Vec<ImportRowLog>>;
}
