pub mod contacts;
pub mod imports;

use serde::Deserialize;

/// Every route is scoped to the caller's organization
#[derive(Debug, Deserialize)]
pub struct OrgQuery {
    pub organization_id: i64,
}
