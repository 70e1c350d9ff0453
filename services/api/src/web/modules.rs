//! services/api/src/web/modules.rs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use curriculum_portal_core::database::ModuleChanges;
use curriculum_portal_core::Module;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::error::{ApiError, ErrorEnvelope};
use crate::web::extract::ApiJson;
use crate::web::rest::MessageResponse;
use crate::web::state::AppState;

/// The fields a client may set on a module.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub lesson_plans: Option<Vec<String>>,
    pub image: Option<String>,
}

impl From<ModuleRequest> for ModuleChanges {
    fn from(req: ModuleRequest) -> Self {
        ModuleChanges {
            title: req.title,
            description: req.description,
            tags: req.tags,
            lesson_plans: req.lesson_plans,
            image: req.image,
        }
    }
}

impl ModuleRequest {
    fn into_module(self) -> Module {
        let mut module = Module::default();
        ModuleChanges::from(self).apply_to(&mut module);
        module
    }
}

#[utoipa::path(
    get,
    path = "/api/modules",
    responses((status = 200, description = "All modules"))
)]
pub async fn list_modules_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_modules().await?))
}

#[utoipa::path(
    get,
    path = "/api/module/{id}",
    params(("id" = String, Path, description = "Module id")),
    responses(
        (status = 200, description = "The module"),
        (status = 404, description = "Module not found", body = ErrorEnvelope)
    )
)]
pub async fn get_module_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let module = state
        .db
        .get_module(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Module not found".to_string()))?;
    Ok(Json(module))
}

/// Create a module. Missing `tags` and `lessonPlans` are stored as empty lists.
#[utoipa::path(
    post,
    path = "/api/module",
    request_body = ModuleRequest,
    responses(
        (status = 201, description = "Module created"),
        (status = 403, description = "Caller is not a teacher", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_module_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<ModuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.db.create_module(req.into_module()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Edit a module. Absent or empty fields keep their stored value.
#[utoipa::path(
    post,
    path = "/api/module/{id}",
    params(("id" = String, Path, description = "Module id")),
    request_body = ModuleRequest,
    responses(
        (status = 200, description = "Updated module"),
        (status = 404, description = "Module not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn edit_module_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<ModuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state.db.edit_module(&id, req.into()).await?;
    Ok(Json(updated))
}

#[utoipa::path(
    delete,
    path = "/api/module/{id}",
    params(("id" = String, Path, description = "Module id")),
    responses(
        (status = 200, description = "Module deleted", body = MessageResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorEnvelope),
        (status = 404, description = "Module not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn delete_module_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.db.delete_module(&id).await?;
    Ok(Json(MessageResponse::new("Module deleted successfully")))
}
