//! services/api/src/web/units.rs
//!
//! Content unit ("nugget") endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use curriculum_portal_core::{CallerProfile, DocumentData, Nugget};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiError, ErrorEnvelope};
use crate::web::extract::ApiJson;
use crate::web::rest::MessageResponse;
use crate::web::state::AppState;

/// Fields a unit update may touch. Anything else in the body is ignored.
const EDITABLE_FIELDS: &[&str] = &[
    "Title",
    "Category",
    "Type",
    "Level",
    "Duration",
    "isPublic",
    "Abstract",
    "Instructions",
    "fileUrl",
];

/// List every public content unit.
#[utoipa::path(
    get,
    path = "/api/units",
    responses((status = 200, description = "Public content units"))
)]
pub async fn list_units_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_units(true).await?))
}

#[utoipa::path(
    get,
    path = "/api/unit/{id}",
    params(("id" = String, Path, description = "Unit document id")),
    responses(
        (status = 200, description = "The unit"),
        (status = 404, description = "Unit not found", body = ErrorEnvelope)
    )
)]
pub async fn get_unit_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let unit = state
        .db
        .get_unit(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Unit not found".to_string()))?;
    Ok(Json(unit))
}

/// Create a unit. The caller becomes its author and a fresh `UnitID` is assigned.
#[utoipa::path(
    post,
    path = "/api/unit",
    request_body(content_type = "application/json", description = "Unit fields (Title, Category, Type, Level, ...)"),
    responses(
        (status = 201, description = "Unit created"),
        (status = 403, description = "Caller is not a teacher", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_unit_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerProfile>,
    ApiJson(unit): ApiJson<Nugget>,
) -> Result<impl IntoResponse, ApiError> {
    if unit.title.trim().is_empty() {
        return Err(ApiError::Validation("Title is required".to_string()));
    }
    let created = state.db.create_unit(unit, caller.uid()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Merge the editable fields of the body into an existing unit.
#[utoipa::path(
    post,
    path = "/api/update/{id}",
    params(("id" = String, Path, description = "Unit document id")),
    request_body(content_type = "application/json", description = "Fields to change"),
    responses(
        (status = 200, description = "Unit updated", body = MessageResponse),
        (status = 400, description = "No editable fields, or a field of the wrong type", body = ErrorEnvelope),
        (status = 404, description = "Unit not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn update_unit_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<DocumentData>,
) -> Result<impl IntoResponse, ApiError> {
    let patch = editable_patch(body)?;
    if patch.is_empty() {
        return Err(ApiError::Validation("No updatable fields provided".to_string()));
    }

    state.db.update_unit(&id, patch).await?;
    Ok(Json(MessageResponse::new("Content updated successfully")))
}

/// Delete a unit. Only its author or an admin may do so, and never while a
/// lesson still uses it.
#[utoipa::path(
    delete,
    path = "/api/unit/{id}",
    params(("id" = String, Path, description = "Unit document id")),
    responses(
        (status = 200, description = "Unit deleted", body = MessageResponse),
        (status = 400, description = "Unit is used by a lesson", body = ErrorEnvelope),
        (status = 403, description = "Caller is neither author nor admin", body = ErrorEnvelope),
        (status = 404, description = "Unit not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn delete_unit_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerProfile>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let unit = state
        .db
        .get_unit(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Unit not found".to_string()))?;
    ensure_author_or_admin(&caller, unit.doc.author.as_deref(), "unit")?;

    state.db.delete_unit(&id).await?;
    info!(unit_id = %id, uid = %caller.uid(), "Unit deleted by request");
    Ok(Json(MessageResponse::new("Unit deleted successfully")))
}

/// Keeps the editable fields of `body`, rejecting any value a stored unit
/// could not be read back with.
fn editable_patch(mut body: DocumentData) -> Result<DocumentData, ApiError> {
    body.retain(|key, value| EDITABLE_FIELDS.contains(&key.as_str()) && !value.is_null());
    for (key, value) in &body {
        let mut single = DocumentData::new();
        single.insert(key.clone(), value.clone());
        if serde_json::from_value::<Nugget>(Value::Object(single)).is_err() {
            return Err(ApiError::Validation(format!("Invalid value for field '{key}'")));
        }
    }
    Ok(body)
}

/// Mutations of authored content are limited to the author and admins.
pub(crate) fn ensure_author_or_admin(caller: &CallerProfile, author: Option<&str>, what: &str) -> Result<(), ApiError> {
    if caller.is_admin() || author == Some(caller.uid()) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "Only the author or an admin can modify this {what}"
        )))
    }
}
