use actix_web::{web, HttpResponse, Result as ActixResult};
use serde::Deserialize;
use shared_types::{
    CheckDuplicatesRequest, ErrorResponse, FieldMappingResponse, ImportJobListResponse,
    ImportRowLogsResponse, StartImportRequest, UpdateFieldMappingRequest,
};
use std::sync::Arc;

use super::OrgQuery;
use crate::jobs::import_manager::{ImportError, ImportManager};

#[derive(Debug)]
pub enum ImportApiError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl std::fmt::Display for ImportApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportApiError::Validation(msg)
            | ImportApiError::NotFound(msg)
            | ImportApiError::Conflict(msg)
            | ImportApiError::Unavailable(msg)
            | ImportApiError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl actix_web::error::ResponseError for ImportApiError {
    fn error_response(&self) -> HttpResponse {
        let body = ErrorResponse {
            error: self.to_string(),
        };
        match self {
            ImportApiError::Validation(_) => HttpResponse::BadRequest().json(body),
            ImportApiError::NotFound(_) => HttpResponse::NotFound().json(body),
            ImportApiError::Conflict(_) => HttpResponse::Conflict().json(body),
            ImportApiError::Unavailable(_) => HttpResponse::ServiceUnavailable().json(body),
            ImportApiError::Internal(_) => HttpResponse::InternalServerError().json(body),
        }
    }
}

impl From<ImportError> for ImportApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::NotFound(_) => ImportApiError::NotFound(err.to_string()),
            ImportError::InvalidRequest(_) | ImportError::Mapping(_) => {
                ImportApiError::Validation(err.to_string())
            }
            ImportError::InvalidState { .. } => ImportApiError::Conflict(err.to_string()),
            ImportError::Lookup(_) => ImportApiError::Unavailable(err.to_string()),
            ImportError::Internal(e) => {
                tracing::error!("Import request failed: {:#}", e);
                ImportApiError::Internal(e.to_string())
            }
        }
    }
}

#[derive(Deserialize)]
pub struct UploadQuery {
    organization_id: i64,
    filename: String,
    uploaded_by: Option<String>,
}

/// Accepts the raw CSV bytes as the request body
pub async fn upload_import(
    manager: web::Data<Arc<ImportManager>>,
    query: web::Query<UploadQuery>,
    body: web::Bytes,
) -> ActixResult<HttpResponse> {
    let query = query.into_inner();

    let response = manager
        .upload(query.organization_id, &query.filename, query.uploaded_by, body.to_vec())
        .await
        .map_err(ImportApiError::from)?;

    Ok(HttpResponse::Created().json(response))
}

pub async fn list_imports(
    manager: web::Data<Arc<ImportManager>>,
    query: web::Query<OrgQuery>,
) -> ActixResult<HttpResponse> {
    let jobs = manager
        .list_jobs(query.organization_id)
        .await
        .map_err(ImportApiError::from)?;

    Ok(HttpResponse::Ok().json(ImportJobListResponse { jobs }))
}

pub async fn get_import(
    manager: web::Data<Arc<ImportManager>>,
    path: web::Path<i64>,
    query: web::Query<OrgQuery>,
) -> ActixResult<HttpResponse> {
    let job = manager
        .get_job(query.organization_id, path.into_inner())
        .await
        .map_err(ImportApiError::from)?;

    Ok(HttpResponse::Ok().json(job))
}

pub async fn get_mapping(
    manager: web::Data<Arc<ImportManager>>,
    path: web::Path<i64>,
    query: web::Query<OrgQuery>,
) -> ActixResult<HttpResponse> {
    let import_id = path.into_inner();

    let mappings = manager
        .get_mappings(query.organization_id, import_id)
        .await
        .map_err(ImportApiError::from)?;

    Ok(HttpResponse::Ok().json(FieldMappingResponse { import_id, mappings }))
}

pub async fn update_mapping(
    manager: web::Data<Arc<ImportManager>>,
    path: web::Path<i64>,
    query: web::Query<OrgQuery>,
    request: web::Json<UpdateFieldMappingRequest>,
) -> ActixResult<HttpResponse> {
    let response = manager
        .update_mappings(query.organization_id, path.into_inner(), request.into_inner().mappings)
        .await
        .map_err(ImportApiError::from)?;

    Ok(HttpResponse::Ok().json(response))
}

/// The body is optional; without one the recommended strategy applies
pub async fn start_import(
    manager: web::Data<Arc<ImportManager>>,
    path: web::Path<i64>,
    query: web::Query<OrgQuery>,
    request: Option<web::Json<StartImportRequest>>,
) -> ActixResult<HttpResponse> {
    let strategy = request
        .map(|r| r.into_inner().duplicate_strategy)
        .unwrap_or_default();

    let job = manager
        .start_import(query.organization_id, path.into_inner(), strategy)
        .await
        .map_err(ImportApiError::from)?;

    Ok(HttpResponse::Accepted().json(job))
}

pub async fn cancel_import(
    manager: web::Data<Arc<ImportManager>>,
    path: web::Path<i64>,
    query: web::Query<OrgQuery>,
) -> ActixResult<HttpResponse> {
    let job = manager
        .cancel_import(query.organization_id, path.into_inner())
        .await
        .map_err(ImportApiError::from)?;

    Ok(HttpResponse::Ok().json(job))
}

pub async fn list_import_rows(
    manager: web::Data<Arc<ImportManager>>,
    path: web::Path<i64>,
    query: web::Query<OrgQuery>,
) -> ActixResult<HttpResponse> {
    let rows = manager
        .row_logs(query.organization_id, path.into_inner())
        .await
        .map_err(ImportApiError::from)?;

    Ok(HttpResponse::Ok().json(ImportRowLogsResponse { rows }))
}

pub async fn check_duplicates(
    manager: web::Data<Arc<ImportManager>>,
    request: web::Json<CheckDuplicatesRequest>,
) -> ActixResult<HttpResponse> {
    let response = manager
        .check_duplicates(request.into_inner())
        .await
        .map_err(ImportApiError::from)?;

    Ok(HttpResponse::Ok().json(response))
}
