use rusqlite::Connection;

/// Run all database migrations
pub fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id INTEGER NOT NULL,
            filename VARCHAR NOT NULL,
            file_size BIGINT NOT NULL,
            file_content BLOB NOT NULL,
            total_rows BIGINT NOT NULL DEFAULT 0,
            status VARCHAR NOT NULL DEFAULT 'uploaded'
                CHECK (status IN ('uploaded', 'parsed', 'duplicates_checked',
                                  'importing', 'completed', 'failed')),
            uploaded_by VARCHAR,
            field_mappings VARCHAR,
            duplicate_strategy VARCHAR NOT NULL DEFAULT 'recommended'
                CHECK (duplicate_strategy IN ('recommended', 'replace', 'keep_both', 'skip')),
            duplicate_count BIGINT NOT NULL DEFAULT 0,
            imported_count BIGINT NOT NULL DEFAULT 0,
            merged_count BIGINT NOT NULL DEFAULT 0,
            skipped_count BIGINT NOT NULL DEFAULT 0,
            error_count BIGINT NOT NULL DEFAULT 0,
            error_message VARCHAR,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            completed_at BIGINT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS contacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id INTEGER NOT NULL,
            import_job_id INTEGER,
            name VARCHAR,
            first_name VARCHAR,
            last_name VARCHAR,
            email VARCHAR,
            phone VARCHAR,
            company VARCHAR,
            title VARCHAR,
            normalized_email VARCHAR,
            normalized_phone VARCHAR,
            normalized_name VARCHAR,
            dedup_hash VARCHAR NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            FOREIGN KEY (import_job_id) REFERENCES import_jobs (id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_row_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            import_job_id INTEGER NOT NULL,
            row_index BIGINT NOT NULL,
            outcome VARCHAR NOT NULL CHECK (outcome IN ('imported', 'merged', 'skipped', 'failed')),
            reason VARCHAR,
            contact_id INTEGER,
            created_at BIGINT NOT NULL,
            UNIQUE (import_job_id, row_index),
            FOREIGN KEY (import_job_id) REFERENCES import_jobs (id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_jobs_org
         ON import_jobs(organization_id, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_jobs_status ON import_jobs(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_contacts_org_email
         ON contacts(organization_id, normalized_email)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_contacts_org_phone
         ON contacts(organization_id, normalized_phone)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_contacts_org_name
         ON contacts(organization_id, normalized_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_row_logs_job
         ON import_row_logs(import_job_id, row_index)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('contacts', 'import_jobs', 'import_row_logs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
