use actix_web::{web, HttpResponse, Result as ActixResult};
use serde::Deserialize;
use shared_types::ContactsResponse;
use std::sync::Arc;

use crate::database::contacts as contacts_db;
use crate::database::Database;

#[derive(Deserialize)]
pub struct ListQuery {
    organization_id: i64,
    #[serde(default = "default_limit")]
    limit: usize,
}

const MAX_LIMIT: usize = 1000;

fn default_limit() -> usize {
    100
}

pub async fn list_contacts(
    db: web::Data<Arc<Database>>,
    query: web::Query<ListQuery>,
) -> ActixResult<HttpResponse> {
    let contacts = contacts_db::list_contacts(
        db.async_connection.clone(),
        query.organization_id,
        query.limit.min(MAX_LIMIT),
    )
    .await
    .map_err(|e| actix_web::error::ErrorInternalServerError(e.to_string()))?;

    Ok(HttpResponse::Ok().json(ContactsResponse { contacts }))
}

pub async fn get_contact(
    db: web::Data<Arc<Database>>,
    path: web::Path<i64>,
    query: web::Query<super::OrgQuery>,
) -> ActixResult<HttpResponse> {
    let contact_id = path.into_inner();

    let contact =
        contacts_db::get_contact(db.async_connection.clone(), query.organization_id, contact_id)
            .await
            .map_err(|e| actix_web::error::ErrorInternalServerError(e.to_string()))?
            .ok_or_else(|| actix_web::error::ErrorNotFound("Contact not found"))?;

    Ok(HttpResponse::Ok().json(contact))
}
