use crate::database::contacts::{
    find_contact, insert_contact, merge_fields, replace_fields, update_contact,
};
use crate::database::{AsyncDbConnection, BUSY_TIMEOUT};
use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, Transaction, TransactionBehavior};
use shared_types::{ImportRowLog, NormalizedContact, RowOutcome, RowWriteError};
use std::time::Instant;

/// Contact write decided for one row during the apply phase
#[derive(Debug, Clone)]
pub enum RowWrite {
    Insert {
        contact: NormalizedContact,
        reason: Option<String>,
    },
    Merge {
        contact_id: i64,
        contact: NormalizedContact,
    },
    Replace {
        contact_id: i64,
        contact: NormalizedContact,
    },
}

impl RowWrite {
    pub fn row_index(&self) -> usize {
        match self {
            RowWrite::Insert { contact, .. }
            | RowWrite::Merge { contact, .. }
            | RowWrite::Replace { contact, .. } => contact.row_index,
        }
    }
}

fn map_write_error(err: rusqlite::Error, started: Instant) -> RowWriteError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => RowWriteError::Constraint(err.to_string()),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            RowWriteError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        }
        _ => RowWriteError::Database(err.to_string()),
    }
}

fn insert_row_log(
    conn: &Connection,
    job_id: i64,
    log: &ImportRowLog,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO import_row_logs
            (import_job_id, row_index, outcome, reason, contact_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            job_id,
            log.row_index as i64,
            log.outcome.as_str(),
            log.reason,
            log.contact_id,
            now
        ],
    )?;
    Ok(())
}

fn increment_counter(
    conn: &Connection,
    job_id: i64,
    outcome: RowOutcome,
    now: i64,
) -> rusqlite::Result<()> {
    let column = outcome.counter_column();
    conn.execute(
        &format!("UPDATE import_jobs SET {column} = {column} + 1, updated_at = ? WHERE id = ?"),
        params![now, job_id],
    )?;
    Ok(())
}

/// Writes one row's contact change, its log entry and the job counter in a
/// single immediate transaction.
///
/// Nothing is committed once `deadline` has passed; the row then fails with
/// [`RowWriteError::Timeout`] and the caller records that outcome separately.
pub fn write_row(
    conn: &mut Connection,
    job_id: i64,
    organization_id: i64,
    write: &RowWrite,
    deadline: Instant,
) -> Result<ImportRowLog, RowWriteError> {
    let started = Instant::now();
    let remaining = deadline.saturating_duration_since(started);
    if remaining.is_zero() {
        return Err(RowWriteError::Timeout { elapsed_ms: 0 });
    }

    conn.busy_timeout(remaining)
        .map_err(|e| map_write_error(e, started))?;
    let result = write_row_in_transaction(conn, job_id, organization_id, write, deadline, started);
    // Pooled connections go back with the standard wait
    let _ = conn.busy_timeout(BUSY_TIMEOUT);
    result
}

fn write_row_in_transaction(
    conn: &mut Connection,
    job_id: i64,
    organization_id: i64,
    write: &RowWrite,
    deadline: Instant,
    started: Instant,
) -> Result<ImportRowLog, RowWriteError> {
    let now = chrono::Utc::now().timestamp();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| map_write_error(e, started))?;

    let log = match write {
        RowWrite::Insert { contact, reason } => {
            let id = insert_contact(&tx, organization_id, Some(job_id), contact, now)
                .map_err(|e| map_write_error(e, started))?;
            ImportRowLog {
                row_index: contact.row_index,
                outcome: RowOutcome::Imported,
                reason: reason.clone(),
                contact_id: Some(id),
            }
        }
        RowWrite::Merge { contact_id, contact } | RowWrite::Replace { contact_id, contact } => {
            let mut existing = find_contact(&tx, organization_id, *contact_id)
                .map_err(|e| map_write_error(e, started))?
                .ok_or(RowWriteError::ContactNotFound(*contact_id))?;

            let reason = if matches!(write, RowWrite::Replace { .. }) {
                replace_fields(&mut existing, contact);
                update_contact(&tx, &existing, now).map_err(|e| map_write_error(e, started))?;
                format!("replaced fields of contact {}", contact_id)
            } else if merge_fields(&mut existing, contact) {
                update_contact(&tx, &existing, now).map_err(|e| map_write_error(e, started))?;
                format!("filled empty fields of contact {}", contact_id)
            } else {
                format!("contact {} already had every field", contact_id)
            };

            ImportRowLog {
                row_index: contact.row_index,
                outcome: RowOutcome::Merged,
                reason: Some(reason),
                contact_id: Some(*contact_id),
            }
        }
    };

    insert_row_log(&tx, job_id, &log, now).map_err(|e| map_write_error(e, started))?;
    increment_counter(&tx, job_id, log.outcome, now)
        .map_err(|e| map_write_error(e, started))?;

    commit_before(tx, deadline, started)?;
    Ok(log)
}

/// Commits unless `deadline` has passed; a late transaction is rolled back on drop
fn commit_before(
    tx: Transaction<'_>,
    deadline: Instant,
    started: Instant,
) -> Result<(), RowWriteError> {
    if Instant::now() > deadline {
        return Err(RowWriteError::Timeout {
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }
    tx.commit().map_err(|e| map_write_error(e, started))
}

/// Records an outcome that involves no contact write (skips and failures)
pub fn record_outcome(
    conn: &mut Connection,
    job_id: i64,
    log: &ImportRowLog,
) -> rusqlite::Result<()> {
    let now = chrono::Utc::now().timestamp();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    insert_row_log(&tx, job_id, log, now)?;
    increment_counter(&tx, job_id, log.outcome, now)?;
    tx.commit()
}

pub async fn list_row_logs(conn: AsyncDbConnection, job_id: i64) -> Result<Vec<ImportRowLog>> {
    let conn = conn.lock().await?;

    let mut stmt = conn.prepare(
        "SELECT row_index, outcome, reason, contact_id
         FROM import_row_logs
         WHERE import_job_id = ?
         ORDER BY row_index ASC",
    )?;

    let logs = stmt
        .query_map([job_id], |row| {
            let outcome_str: String = row.get(1)?;
            let outcome = RowOutcome::parse(&outcome_str).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    format!("unknown row outcome '{}'", outcome_str).into(),
                )
            })?;
            Ok(ImportRowLog {
                row_index: row.get::<_, i64>(0)? as usize,
                outcome,
                reason: row.get(2)?,
                contact_id: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::contacts::tests::incoming;
    use crate::database::contacts::get_contact;
    use crate::database::import_jobs::{get_import_job, insert_import_job, NewImportJob};
    use crate::database::test_support::temp_database;
    use std::time::Duration;

    async fn job(conn: &AsyncDbConnection) -> i64 {
        insert_import_job(
            conn.clone(),
            &NewImportJob {
                organization_id: 1,
                filename: "c.csv".to_string(),
                uploaded_by: None,
                content: Vec::new(),
            },
        )
        .await
        .unwrap()
        .id
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_insert_then_merge_updates_counters_and_logs() {
        let (db, _dir) = temp_database();
        let conn = db.async_connection.clone();
        let job_id = job(&conn).await;

        let inserted = {
            let mut guard = conn.lock().await.unwrap();
            let write = RowWrite::Insert {
                contact: incoming(1, Some("a@b.co"), None, Some("Ann")),
                reason: None,
            };
            write_row(&mut guard, job_id, 1, &write, later()).unwrap()
        };
        assert_eq!(inserted.outcome, RowOutcome::Imported);
        let contact_id = inserted.contact_id.unwrap();

        let merged = {
            let mut guard = conn.lock().await.unwrap();
            let write = RowWrite::Merge {
                contact_id,
                contact: incoming(2, Some("a@b.co"), Some("555 0100"), Some("Ann")),
            };
            write_row(&mut guard, job_id, 1, &write, later()).unwrap()
        };
        assert_eq!(merged.outcome, RowOutcome::Merged);

        let contact = get_contact(conn.clone(), 1, contact_id).await.unwrap().unwrap();
        assert_eq!(contact.phone.as_deref(), Some("555 0100"));
        assert_eq!(contact.import_job_id, Some(job_id));

        let job = get_import_job(conn.clone(), 1, job_id).await.unwrap().unwrap();
        assert_eq!(job.imported_count, 1);
        assert_eq!(job.merged_count, 1);

        let logs = list_row_logs(conn, job_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].contact_id, Some(contact_id));
    }

    #[tokio::test]
    async fn test_merge_into_other_organization_is_not_found() {
        let (db, _dir) = temp_database();
        let conn = db.async_connection.clone();
        let job_id = job(&conn).await;

        let mut guard = conn.lock().await.unwrap();
        let foreign = insert_contact(&guard, 2, None, &incoming(1, Some("x@y.co"), None, None), 0)
            .unwrap();

        let write = RowWrite::Merge {
            contact_id: foreign,
            contact: incoming(1, Some("x@y.co"), Some("1"), None),
        };
        let err = write_row(&mut guard, job_id, 1, &write, later()).unwrap_err();
        assert_eq!(err, RowWriteError::ContactNotFound(foreign));
    }

    #[tokio::test]
    async fn test_expired_deadline_commits_nothing() {
        let (db, _dir) = temp_database();
        let conn = db.async_connection.clone();
        let job_id = job(&conn).await;

        {
            let mut guard = conn.lock().await.unwrap();
            let write = RowWrite::Insert {
                contact: incoming(1, Some("a@b.co"), None, None),
                reason: None,
            };
            let err = write_row(&mut guard, job_id, 1, &write, Instant::now()).unwrap_err();
            assert!(matches!(err, RowWriteError::Timeout { .. }));
        }

        let job = get_import_job(conn.clone(), 1, job_id).await.unwrap().unwrap();
        assert_eq!(job.imported_count, 0);
        assert!(list_row_logs(conn, job_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_finished_past_deadline_is_rolled_back() {
        let (db, _dir) = temp_database();
        let conn = db.async_connection.clone();
        let job_id = job(&conn).await;

        {
            let mut guard = conn.lock().await.unwrap();
            let started = Instant::now();
            let deadline = started + Duration::from_millis(1);

            let tx = guard
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .unwrap();
            insert_contact(&tx, 1, Some(job_id), &incoming(1, Some("a@b.co"), None, None), 0)
                .unwrap();
            increment_counter(&tx, job_id, RowOutcome::Imported, 0).unwrap();
            std::thread::sleep(Duration::from_millis(5));

            let err = commit_before(tx, deadline, started).unwrap_err();
            assert!(matches!(err, RowWriteError::Timeout { elapsed_ms } if elapsed_ms >= 5));
        }

        let job = get_import_job(conn.clone(), 1, job_id).await.unwrap().unwrap();
        assert_eq!(job.imported_count, 0);
        let contacts = crate::database::contacts::list_contacts(conn, 1, 10).await.unwrap();
        assert!(contacts.is_empty());
    }

    #[tokio::test]
    async fn test_record_outcome_counts_failures() {
        let (db, _dir) = temp_database();
        let conn = db.async_connection.clone();
        let job_id = job(&conn).await;

        {
            let mut guard = conn.lock().await.unwrap();
            let log = ImportRowLog {
                row_index: 3,
                outcome: RowOutcome::Failed,
                reason: Some("invalid_email_format".to_string()),
                contact_id: None,
            };
            record_outcome(&mut guard, job_id, &log).unwrap();
            // a row has exactly one outcome
            assert!(record_outcome(&mut guard, job_id, &log).is_err());
        }

        let job = get_import_job(conn, 1, job_id).await.unwrap().unwrap();
        assert_eq!(job.error_count, 1);
    }
}
