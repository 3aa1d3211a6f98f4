use crate::database::AsyncDbConnection;
use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use shared_types::{DuplicateStrategy, FieldMapping, ImportJob, ImportJobStatus};

pub struct NewImportJob {
    pub organization_id: i64,
    pub filename: String,
    pub uploaded_by: Option<String>,
    pub content: Vec<u8>,
}

const JOB_COLUMNS: &str = "id, organization_id, filename, file_size, total_rows, status,
    uploaded_by, duplicate_count, imported_count, merged_count, skipped_count, error_count,
    duplicate_strategy, error_message, created_at, updated_at, completed_at";

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<ImportJob> {
    let status_str: String = row.get(5)?;
    let status = ImportJobStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(5, format!("unknown import status '{}'", status_str)))?;

    let strategy_str: String = row.get(12)?;
    let duplicate_strategy = DuplicateStrategy::parse(&strategy_str)
        .ok_or_else(|| conversion_error(12, format!("unknown strategy '{}'", strategy_str)))?;

    let count = |index: usize| -> rusqlite::Result<u64> {
        Ok(row.get::<_, i64>(index)?.max(0) as u64)
    };

    Ok(ImportJob {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        filename: row.get(2)?,
        file_size: count(3)?,
        total_rows: count(4)?,
        status,
        uploaded_by: row.get(6)?,
        duplicate_count: count(7)?,
        imported_count: count(8)?,
        merged_count: count(9)?,
        skipped_count: count(10)?,
        error_count: count(11)?,
        duplicate_strategy,
        error_message: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        completed_at: row.get(16)?,
    })
}

pub async fn insert_import_job(conn: AsyncDbConnection, job: &NewImportJob) -> Result<ImportJob> {
    let conn = conn.lock().await?;
    let now = chrono::Utc::now().timestamp();

    let id: i64 = conn.query_row(
        "INSERT INTO import_jobs
         (organization_id, filename, file_size, file_content, status, uploaded_by,
          created_at, updated_at)
         VALUES (?, ?, ?, ?, 'uploaded', ?, ?, ?)
         RETURNING id",
        params![
            job.organization_id,
            job.filename,
            job.content.len() as i64,
            job.content,
            job.uploaded_by,
            now,
            now
        ],
        |row| row.get(0),
    )?;

    Ok(ImportJob {
        id,
        organization_id: job.organization_id,
        filename: job.filename.clone(),
        file_size: job.content.len() as u64,
        total_rows: 0,
        status: ImportJobStatus::Uploaded,
        uploaded_by: job.uploaded_by.clone(),
        duplicate_count: 0,
        imported_count: 0,
        merged_count: 0,
        skipped_count: 0,
        error_count: 0,
        duplicate_strategy: DuplicateStrategy::default(),
        error_message: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    })
}

pub async fn get_import_job(
    conn: AsyncDbConnection,
    organization_id: i64,
    id: i64,
) -> Result<Option<ImportJob>> {
    let conn = conn.lock().await?;

    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = ? AND organization_id = ?"),
            params![id, organization_id],
            row_to_job,
        )
        .optional()?;

    Ok(job)
}

pub async fn list_import_jobs(
    conn: AsyncDbConnection,
    organization_id: i64,
    limit: usize,
) -> Result<Vec<ImportJob>> {
    let conn = conn.lock().await?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM import_jobs
         WHERE organization_id = ?
         ORDER BY created_at DESC, id DESC
         LIMIT ?"
    ))?;

    let jobs = stmt
        .query_map(params![organization_id, limit as i64], row_to_job)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(jobs)
}

pub async fn get_file_content(conn: AsyncDbConnection, id: i64) -> Result<Vec<u8>> {
    let conn = conn.lock().await?;

    conn.query_row(
        "SELECT file_content FROM import_jobs WHERE id = ?",
        [id],
        |row| row.get(0),
    )
    .map_err(|e| anyhow::anyhow!("Failed to load file for import job {}: {}", id, e))
}

pub async fn update_field_mappings(
    conn: AsyncDbConnection,
    id: i64,
    mappings: &[FieldMapping],
) -> Result<()> {
    let conn = conn.lock().await?;
    let now = chrono::Utc::now().timestamp();
    let mappings_json = serde_json::to_string(mappings)?;

    conn.execute(
        "UPDATE import_jobs SET field_mappings = ?, updated_at = ? WHERE id = ?",
        params![mappings_json, now, id],
    )?;

    Ok(())
}

pub async fn get_field_mappings(
    conn: AsyncDbConnection,
    id: i64,
) -> Result<Option<Vec<FieldMapping>>> {
    let conn = conn.lock().await?;

    let mappings_json: Option<String> = conn
        .query_row(
            "SELECT field_mappings FROM import_jobs WHERE id = ?",
            [id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    match mappings_json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub async fn update_preparation(
    conn: AsyncDbConnection,
    id: i64,
    total_rows: u64,
    duplicate_count: u64,
    error_message: Option<&str>,
) -> Result<()> {
    let conn = conn.lock().await?;
    let now = chrono::Utc::now().timestamp();

    conn.execute(
        "UPDATE import_jobs
         SET total_rows = ?, duplicate_count = ?, error_message = ?, updated_at = ?
         WHERE id = ?",
        params![total_rows as i64, duplicate_count as i64, error_message, now, id],
    )?;

    Ok(())
}

/// Moves a job to `next` only if it currently sits in one of `next`'s
/// predecessor states. Returns whether the transition happened.
pub async fn transition_status(
    conn: AsyncDbConnection,
    id: i64,
    next: ImportJobStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    let conn = conn.lock().await?;
    let now = chrono::Utc::now().timestamp();

    let predecessors = predecessor_list(next);
    if predecessors.is_empty() {
        return Ok(false);
    }

    let completed_at = if next.is_terminal() { Some(now) } else { None };

    let updated = conn.execute(
        &format!(
            "UPDATE import_jobs
             SET status = ?, error_message = COALESCE(?, error_message),
                 completed_at = COALESCE(?, completed_at), updated_at = ?
             WHERE id = ? AND status IN ({predecessors})"
        ),
        params![next.as_str(), error_message, completed_at, now, id],
    )?;

    Ok(updated == 1)
}

/// `duplicates_checked -> importing`, recording the job-wide strategy
pub async fn begin_import(
    conn: AsyncDbConnection,
    id: i64,
    strategy: DuplicateStrategy,
) -> Result<bool> {
    let conn = conn.lock().await?;
    let now = chrono::Utc::now().timestamp();

    let updated = conn.execute(
        "UPDATE import_jobs
         SET status = 'importing', duplicate_strategy = ?, error_message = NULL, updated_at = ?
         WHERE id = ? AND status = 'duplicates_checked'",
        params![strategy.as_str(), now, id],
    )?;

    Ok(updated == 1)
}

/// Fails every job still marked `importing`, returning their ids
pub async fn fail_interrupted_jobs(conn: AsyncDbConnection, reason: &str) -> Result<Vec<i64>> {
    let conn = conn.lock().await?;
    let now = chrono::Utc::now().timestamp();

    let mut stmt = conn.prepare(
        "UPDATE import_jobs
         SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ?
         WHERE status = 'importing'
         RETURNING id",
    )?;

    let ids = stmt
        .query_map(params![reason, now, now], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ids)
}

fn predecessor_list(next: ImportJobStatus) -> String {
    next.predecessors()
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_database;
    use shared_types::CanonicalField;

    fn new_job(organization_id: i64) -> NewImportJob {
        NewImportJob {
            organization_id,
            filename: "contacts.csv".to_string(),
            uploaded_by: Some("ops@acme.test".to_string()),
            content: b"Email\na@b.co\n".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch_job() {
        let (db, _dir) = temp_database();
        let conn = db.async_connection.clone();

        let job = insert_import_job(conn.clone(), &new_job(7)).await.unwrap();
        assert_eq!(job.status, ImportJobStatus::Uploaded);
        assert_eq!(job.file_size, 13);

        let fetched = get_import_job(conn.clone(), 7, job.id).await.unwrap().unwrap();
        assert_eq!(fetched.filename, "contacts.csv");
        assert_eq!(fetched.duplicate_strategy, DuplicateStrategy::Recommended);
        assert!(get_import_job(conn.clone(), 8, job.id).await.unwrap().is_none());

        assert_eq!(get_file_content(conn.clone(), job.id).await.unwrap(), b"Email\na@b.co\n");
        assert_eq!(list_import_jobs(conn, 7, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_only_moves_forward() {
        let (db, _dir) = temp_database();
        let conn = db.async_connection.clone();
        let job = insert_import_job(conn.clone(), &new_job(1)).await.unwrap();

        // no skipping ahead
        assert!(!transition_status(conn.clone(), job.id, ImportJobStatus::DuplicatesChecked, None)
            .await
            .unwrap());
        assert!(transition_status(conn.clone(), job.id, ImportJobStatus::Parsed, None)
            .await
            .unwrap());
        assert!(!transition_status(conn.clone(), job.id, ImportJobStatus::Parsed, None)
            .await
            .unwrap());
        assert!(transition_status(conn.clone(), job.id, ImportJobStatus::DuplicatesChecked, None)
            .await
            .unwrap());
        assert!(begin_import(conn.clone(), job.id, DuplicateStrategy::Replace).await.unwrap());
        assert!(!begin_import(conn.clone(), job.id, DuplicateStrategy::Skip).await.unwrap());
        assert!(transition_status(conn.clone(), job.id, ImportJobStatus::Completed, None)
            .await
            .unwrap());
        assert!(!transition_status(conn.clone(), job.id, ImportJobStatus::Failed, Some("late"))
            .await
            .unwrap());

        let job = get_import_job(conn, 1, job.id).await.unwrap().unwrap();
        assert_eq!(job.status, ImportJobStatus::Completed);
        assert_eq!(job.duplicate_strategy, DuplicateStrategy::Replace);
        assert!(job.completed_at.is_some());
        assert_eq!(job.error_message, None);
    }

    #[tokio::test]
    async fn test_interrupted_jobs_are_failed() {
        let (db, _dir) = temp_database();
        let conn = db.async_connection.clone();
        let running = insert_import_job(conn.clone(), &new_job(1)).await.unwrap();
        let waiting = insert_import_job(conn.clone(), &new_job(1)).await.unwrap();

        for next in [ImportJobStatus::Parsed, ImportJobStatus::DuplicatesChecked] {
            transition_status(conn.clone(), running.id, next, None).await.unwrap();
        }
        begin_import(conn.clone(), running.id, DuplicateStrategy::Recommended)
            .await
            .unwrap();

        let ids = fail_interrupted_jobs(conn.clone(), "interrupted by restart")
            .await
            .unwrap();
        assert_eq!(ids, vec![running.id]);

        let running = get_import_job(conn.clone(), 1, running.id).await.unwrap().unwrap();
        assert_eq!(running.status, ImportJobStatus::Failed);
        assert_eq!(running.error_message.as_deref(), Some("interrupted by restart"));
        let waiting = get_import_job(conn, 1, waiting.id).await.unwrap().unwrap();
        assert_eq!(waiting.status, ImportJobStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_field_mappings_round_trip_through_json_column() {
        let (db, _dir) = temp_database();
        let conn = db.async_connection.clone();
        let job = insert_import_job(conn.clone(), &new_job(1)).await.unwrap();

        assert_eq!(get_field_mappings(conn.clone(), job.id).await.unwrap(), None);

        let mappings = vec![FieldMapping {
            csv_column: "Email".to_string(),
            column_index: 0,
            canonical_field: Some(CanonicalField::Email),
            confidence: 100,
        }];
        update_field_mappings(conn.clone(), job.id, &mappings).await.unwrap();

        assert_eq!(
            get_field_mappings(conn, job.id).await.unwrap(),
            Some(mappings)
        );
    }
}
