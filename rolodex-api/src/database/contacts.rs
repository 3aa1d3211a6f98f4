use crate::database::AsyncDbConnection;
use anyhow::Result;
use importers::contact_csv::{dedup_hash, normalize_email, normalize_name, normalize_phone};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared_types::{Contact, ExistingContact, NormalizedContact};

const CONTACT_COLUMNS: &str = "id, organization_id, import_job_id, name, first_name, last_name,
    email, phone, company, title, normalized_email, normalized_phone, normalized_name,
    dedup_hash, created_at, updated_at";

fn row_to_contact(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        import_job_id: row.get(2)?,
        name: row.get(3)?,
        first_name: row.get(4)?,
        last_name: row.get(5)?,
        email: row.get(6)?,
        phone: row.get(7)?,
        company: row.get(8)?,
        title: row.get(9)?,
        normalized_email: row.get(10)?,
        normalized_phone: row.get(11)?,
        normalized_name: row.get(12)?,
        dedup_hash: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

pub async fn get_contact(
    conn: AsyncDbConnection,
    organization_id: i64,
    id: i64,
) -> Result<Option<Contact>> {
    let conn = conn.lock().await?;
    find_contact(&conn, organization_id, id)
        .map_err(|e| anyhow::anyhow!("Failed to get contact: {}", e))
}

pub async fn list_contacts(
    conn: AsyncDbConnection,
    organization_id: i64,
    limit: usize,
) -> Result<Vec<Contact>> {
    let conn = conn.lock().await?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts
         WHERE organization_id = ?
         ORDER BY created_at DESC, id DESC
         LIMIT ?"
    ))?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let contacts = stmt
        .query_map(params![organization_id, limit], row_to_contact)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(contacts)
}

/// Identity projection of every contact in one organization, in a single query
pub async fn list_existing_contacts(
    conn: AsyncDbConnection,
    organization_id: i64,
) -> Result<Vec<ExistingContact>> {
    let conn = conn.lock().await?;

    let mut stmt = conn.prepare(
        "SELECT id, organization_id, normalized_email, normalized_phone, normalized_name
         FROM contacts
         WHERE organization_id = ?",
    )?;

    let contacts = stmt
        .query_map([organization_id], |row| {
            Ok(ExistingContact {
                id: row.get(0)?,
                organization_id: row.get(1)?,
                normalized_email: row.get(2)?,
                normalized_phone: row.get(3)?,
                normalized_name: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(contacts)
}

pub fn find_contact(
    conn: &Connection,
    organization_id: i64,
    id: i64,
) -> rusqlite::Result<Option<Contact>> {
    conn.query_row(
        &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ? AND organization_id = ?"),
        params![id, organization_id],
        row_to_contact,
    )
    .optional()
}

pub fn insert_contact(
    conn: &Connection,
    organization_id: i64,
    import_job_id: Option<i64>,
    contact: &NormalizedContact,
    now: i64,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO contacts
         (organization_id, import_job_id, name, first_name, last_name, email, phone, company,
          title, normalized_email, normalized_phone, normalized_name, dedup_hash,
          created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING id",
        params![
            organization_id,
            import_job_id,
            contact.name,
            contact.first_name,
            contact.last_name,
            contact.email,
            contact.phone,
            contact.company,
            contact.title,
            contact.normalized_email,
            contact.normalized_phone,
            contact.normalized_name,
            contact.dedup_hash,
            now,
            now
        ],
        |row| row.get(0),
    )
}

pub fn update_contact(conn: &Connection, contact: &Contact, now: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE contacts
         SET name = ?, first_name = ?, last_name = ?, email = ?, phone = ?, company = ?,
             title = ?, normalized_email = ?, normalized_phone = ?, normalized_name = ?,
             dedup_hash = ?, updated_at = ?
         WHERE id = ? AND organization_id = ?",
        params![
            contact.name,
            contact.first_name,
            contact.last_name,
            contact.email,
            contact.phone,
            contact.company,
            contact.title,
            contact.normalized_email,
            contact.normalized_phone,
            contact.normalized_name,
            contact.dedup_hash,
            now,
            contact.id,
            contact.organization_id
        ],
    )
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Copies incoming values into fields that are currently empty.
///
/// Populated fields are never touched. Returns whether anything changed.
pub fn merge_fields(existing: &mut Contact, incoming: &NormalizedContact) -> bool {
    let mut changed = false;
    let pairs = [
        (&mut existing.name, &incoming.name),
        (&mut existing.first_name, &incoming.first_name),
        (&mut existing.last_name, &incoming.last_name),
        (&mut existing.email, &incoming.email),
        (&mut existing.phone, &incoming.phone),
        (&mut existing.company, &incoming.company),
        (&mut existing.title, &incoming.title),
    ];

    for (target, value) in pairs {
        if is_blank(target) && !is_blank(value) {
            *target = value.clone();
            changed = true;
        }
    }

    if changed {
        refresh_identity(existing);
    }
    changed
}

/// Overwrites fields with every non-empty incoming value
pub fn replace_fields(existing: &mut Contact, incoming: &NormalizedContact) {
    let pairs = [
        (&mut existing.name, &incoming.name),
        (&mut existing.first_name, &incoming.first_name),
        (&mut existing.last_name, &incoming.last_name),
        (&mut existing.email, &incoming.email),
        (&mut existing.phone, &incoming.phone),
        (&mut existing.company, &incoming.company),
        (&mut existing.title, &incoming.title),
    ];

    for (target, value) in pairs {
        if !is_blank(value) {
            *target = value.clone();
        }
    }

    refresh_identity(existing);
}

/// Recomputes the normalized identity and fingerprint from display fields
fn refresh_identity(contact: &mut Contact) {
    contact.normalized_email = contact.email.as_deref().and_then(normalize_email);
    contact.normalized_phone = contact.phone.as_deref().and_then(normalize_phone);
    contact.normalized_name = contact.name.as_deref().and_then(normalize_name);
    contact.dedup_hash = dedup_hash(
        contact.normalized_email.as_deref(),
        contact.normalized_phone.as_deref(),
        contact.normalized_name.as_deref(),
    );
}
