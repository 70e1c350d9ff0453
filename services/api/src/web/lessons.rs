//! services/api/src/web/lessons.rs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use curriculum_portal_core::database::LessonFilter;
use curriculum_portal_core::{CallerProfile, Lesson};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiError, ErrorEnvelope};
use crate::web::extract::{ApiJson, ApiQuery};
use crate::web::rest::MessageResponse;
use crate::web::state::AppState;
use crate::web::units::ensure_author_or_admin;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct LessonQuery {
    /// Only lessons written by this user.
    pub author_id: Option<String>,
    pub is_draft: Option<bool>,
}

impl From<LessonQuery> for LessonFilter {
    fn from(query: LessonQuery) -> Self {
        LessonFilter {
            author_id: query.author_id.filter(|a| !a.trim().is_empty()),
            is_draft: query.is_draft,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LessonCreatedResponse {
    pub message: String,
    pub id: String,
}

/// List lessons, optionally filtered by author and draft state.
#[utoipa::path(
    get,
    path = "/api/lessons",
    params(LessonQuery),
    responses((status = 200, description = "Matching lessons"))
)]
pub async fn list_lessons_handler(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<LessonQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = LessonFilter::from(query);
    Ok(Json(state.db.list_lessons(&filter).await?))
}

#[utoipa::path(
    get,
    path = "/api/lesson/{id}",
    params(("id" = String, Path, description = "Lesson id")),
    responses(
        (status = 200, description = "The lesson"),
        (status = 404, description = "Lesson not found", body = ErrorEnvelope)
    )
)]
pub async fn get_lesson_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lesson = state
        .db
        .get_lesson(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Lesson not found".to_string()))?;
    Ok(Json(lesson))
}

#[utoipa::path(
    get,
    path = "/api/lesson/{id}/sections",
    params(("id" = String, Path, description = "Lesson id")),
    responses(
        (status = 200, description = "The lesson's sections"),
        (status = 404, description = "Lesson missing or without sections", body = ErrorEnvelope)
    )
)]
pub async fn lesson_sections_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.lesson_sections(&id).await?))
}

/// Create a lesson authored by the caller.
#[utoipa::path(
    post,
    path = "/api/lesson",
    request_body(content_type = "application/json", description = "Lesson plan"),
    responses(
        (status = 201, description = "Lesson created", body = LessonCreatedResponse),
        (status = 400, description = "Missing title", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_lesson_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerProfile>,
    ApiJson(lesson): ApiJson<Lesson>,
) -> Result<impl IntoResponse, ApiError> {
    if lesson.title.trim().is_empty() {
        return Err(ApiError::Validation("Lesson title is required".to_string()));
    }

    let id = state.db.create_lesson(lesson, caller.uid()).await?;
    Ok((
        StatusCode::CREATED,
        Json(LessonCreatedResponse {
            message: "Lesson created successfully".to_string(),
            id,
        }),
    ))
}

/// Replace a lesson's editable fields. Publishing it publishes its units.
#[utoipa::path(
    put,
    path = "/api/lesson/{id}",
    params(("id" = String, Path, description = "Lesson id")),
    request_body(content_type = "application/json", description = "Lesson plan"),
    responses(
        (status = 200, description = "Updated lesson"),
        (status = 403, description = "Caller is neither author nor admin", body = ErrorEnvelope),
        (status = 404, description = "Lesson not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn update_lesson_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerProfile>,
    Path(id): Path<String>,
    ApiJson(lesson): ApiJson<Lesson>,
) -> Result<impl IntoResponse, ApiError> {
    let existing = state
        .db
        .get_lesson(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Lesson not found".to_string()))?;
    ensure_author_or_admin(&caller, existing.doc.author_id.as_deref(), "lesson")?;

    let updated = state.db.replace_lesson(&id, lesson).await?;
    info!(lesson_id = %id, uid = %caller.uid(), public = updated.doc.is_public, "Lesson updated");
    Ok(Json(updated))
}

#[utoipa::path(
    delete,
    path = "/api/lesson/{id}",
    params(("id" = String, Path, description = "Lesson id")),
    responses(
        (status = 200, description = "Lesson deleted", body = MessageResponse),
        (status = 403, description = "Caller is neither author nor admin", body = ErrorEnvelope),
        (status = 404, description = "Lesson not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn delete_lesson_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerProfile>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let existing = state
        .db
        .get_lesson(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Lesson not found".to_string()))?;
    ensure_author_or_admin(&caller, existing.doc.author_id.as_deref(), "lesson")?;

    state.db.delete_lesson(&id).await?;
    Ok(Json(MessageResponse::new("Lesson deleted successfully")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_author_filter_is_ignored() {
        let filter = LessonFilter::from(LessonQuery {
            author_id: Some("  ".into()),
            is_draft: Some(false),
        });
        assert_eq!(filter.author_id, None);
        assert_eq!(filter.is_draft, Some(false));
    }
}
