use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// A contact owned by exactly one organization
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Contact {
    pub id: i64,
    pub organization_id: i64,
    pub import_job_id: Option<i64>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub normalized_email: Option<String>,
    pub normalized_phone: Option<String>,
    pub normalized_name: Option<String>,
    pub dedup_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The identity projection of a contact that duplicate matching works on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingContact {
    pub id: i64,
    pub organization_id: i64,
    pub normalized_email: Option<String>,
    pub normalized_phone: Option<String>,
    pub normalized_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ContactsResponse {
    pub contacts: Vec<Contact>,
}
