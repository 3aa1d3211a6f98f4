use super::{ImportStore, NewImportJob, RowWrite};
use crate::database::{contacts, import_jobs, import_rows, AsyncDbConnection};
use async_trait::async_trait;
use shared_types::{
    DuplicateStrategy, ExistingContact, FieldMapping, ImportJob, ImportJobStatus, ImportRowLog,
    RowWriteError,
};
use std::time::{Duration, Instant};

const JOB_LIST_LIMIT: usize = 100;

#[derive(Clone)]
pub struct SqliteImportStore {
    db_conn: AsyncDbConnection,
}

impl SqliteImportStore {
    pub fn new(db_conn: AsyncDbConnection) -> Self {
        Self { db_conn }
    }
}

#[async_trait]
impl ImportStore for SqliteImportStore {
    async fn create_job(&self, job: NewImportJob) -> anyhow::Result<ImportJob> {
        import_jobs::insert_import_job(self.db_conn.clone(), &job).await
    }

    async fn get_job(
        &self,
        organization_id: i64,
        job_id: i64,
    ) -> anyhow::Result<Option<ImportJob>> {
        import_jobs::get_import_job(self.db_conn.clone(), organization_id, job_id).await
    }

    async fn list_jobs(&self, organization_id: i64) -> anyhow::Result<Vec<ImportJob>> {
        import_jobs::list_import_jobs(self.db_conn.clone(), organization_id, JOB_LIST_LIMIT).await
    }

    async fn load_file(&self, job_id: i64) -> anyhow::Result<Vec<u8>> {
        import_jobs::get_file_content(self.db_conn.clone(), job_id).await
    }

    async fn save_mappings(&self, job_id: i64, mappings: &[FieldMapping]) -> anyhow::Result<()> {
        import_jobs::update_field_mappings(self.db_conn.clone(), job_id, mappings).await
    }

    async fn load_mappings(&self, job_id: i64) -> anyhow::Result<Option<Vec<FieldMapping>>> {
        import_jobs::get_field_mappings(self.db_conn.clone(), job_id).await
    }

    async fn record_preparation(
        &self,
        job_id: i64,
        total_rows: u64,
        duplicate_count: u64,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        import_jobs::update_preparation(
            self.db_conn.clone(),
            job_id,
            total_rows,
            duplicate_count,
            error_message,
        )
        .await
    }

    async fn transition(
        &self,
        job_id: i64,
        next: ImportJobStatus,
        error_message: Option<&str>,
    ) -> anyhow::Result<bool> {
        import_jobs::transition_status(self.db_conn.clone(), job_id, next, error_message).await
    }

    async fn begin_import(&self, job_id: i64, strategy: DuplicateStrategy) -> anyhow::Result<bool> {
        import_jobs::begin_import(self.db_conn.clone(), job_id, strategy).await
    }

    async fn fail_interrupted(&self, reason: &str) -> anyhow::Result<Vec<i64>> {
        import_jobs::fail_interrupted_jobs(self.db_conn.clone(), reason).await
    }

    async fn existing_contacts(
        &self,
        organization_id: i64,
    ) -> anyhow::Result<Vec<ExistingContact>> {
        contacts::list_existing_contacts(self.db_conn.clone(), organization_id).await
    }

    async fn write_row(
        &self,
        job_id: i64,
        organization_id: i64,
        write: RowWrite,
        timeout: Duration,
    ) -> Result<ImportRowLog, RowWriteError> {
        let db_conn = self.db_conn.clone();
        let deadline = Instant::now() + timeout;

        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let remaining = deadline.saturating_duration_since(started);
            let mut conn = db_conn
                .get_timeout(remaining)
                .map_err(|_| RowWriteError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })?;
            import_rows::write_row(&mut conn, job_id, organization_id, &write, deadline)
        })
        .await
        .map_err(|e| RowWriteError::Database(format!("row writer stopped: {}", e)))?
    }

    async fn record_outcome(&self, job_id: i64, log: ImportRowLog) -> anyhow::Result<()> {
        let mut conn = self.db_conn.lock().await?;
        import_rows::record_outcome(&mut conn, job_id, &log)?;
        Ok(())
    }

    async fn row_logs(&self, job_id: i64) -> anyhow::Result<Vec<ImportRowLog>> {
        import_rows::list_row_logs(self.db_conn.clone(), job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::contacts::tests::incoming;
    use crate::database::test_support::temp_database;

    #[tokio::test]
    async fn test_write_waits_for_a_connection_only_until_deadline() {
        let (db, _dir) = temp_database();
        let store = SqliteImportStore::new(db.async_connection.clone());
        let job = store
            .create_job(NewImportJob {
                organization_id: 1,
                filename: "c.csv".to_string(),
                uploaded_by: None,
                content: Vec::new(),
            })
            .await
            .unwrap();

        // Check out every pooled connection
        let mut held = Vec::new();
        while let Ok(conn) = db.async_connection.get_timeout(Duration::from_millis(200)) {
            held.push(conn);
        }
        assert!(!held.is_empty());

        let write = RowWrite::Insert {
            contact: incoming(1, Some("a@b.co"), None, None),
            reason: None,
        };
        let started = Instant::now();
        let err = store
            .write_row(job.id, 1, write, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RowWriteError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));

        drop(held);
        let job = store.get_job(1, job.id).await.unwrap().unwrap();
        assert_eq!(job.imported_count, 0);
    }
}
