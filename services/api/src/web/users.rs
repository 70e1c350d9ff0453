//! services/api/src/web/users.rs
//!
//! Profile endpoints. `me` and `register` only need a verified token; the
//! listing and role update are admin-only; the public view needs nothing.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::{DateTime, Utc};
use curriculum_portal_core::database::{RegisterOutcome, UserPage, UserQuery};
use curriculum_portal_core::ports::VerifiedIdentity;
use curriculum_portal_core::{
    Identified, PortError, Role, SubscriptionPlan, SubscriptionStatus, UserProfile,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiError, ErrorEnvelope};
use crate::web::extract::{ApiJson, ApiQuery};
use crate::web::state::AppState;

const MAX_PAGE_SIZE: usize = 100;

/// Profile fields only the server writes. Stripped from sign-up payloads.
const SERVER_MANAGED_FIELDS: &[&str] = &[
    "subscriptionType",
    "subscriptionStatus",
    "subscriptionStartDate",
    "subscriptionEndDate",
    "stripePaymentIntentId",
    "stripeCustomerId",
    "stripeSubscriptionId",
    "createdAt",
    "updatedAt",
];

//=========================================================================================
// Payloads
//=========================================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub institution: Option<String>,
    pub role: Option<String>,
    /// Any further profile fields the sign-up form collected.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredResponse {
    pub message: String,
    pub full_name: Option<String>,
    pub role: String,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UsersQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
    /// Only users holding this role.
    pub role: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPageResponse {
    pub users: Vec<Identified<UserProfile>>,
    pub total_users: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub limit: usize,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl From<UserPage> for UserPageResponse {
    fn from(page: UserPage) -> Self {
        Self {
            users: page.users,
            total_users: page.total_users,
            current_page: page.current_page,
            total_pages: page.total_pages,
            limit: page.limit,
            has_next_page: page.has_next_page,
            has_previous_page: page.has_previous_page,
        }
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoleRequest {
    pub user_id: Option<String>,
    pub new_role: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoleResponse {
    pub message: String,
    pub user_id: String,
    pub new_role: String,
}

/// What anyone may see of a user.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub id: String,
    pub full_name: Option<String>,
    pub institution: Option<String>,
    pub role: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl PublicProfile {
    fn of(id: String, profile: &UserProfile) -> Self {
        Self {
            id,
            full_name: profile.full_name.clone(),
            institution: profile.institution.clone(),
            role: profile.effective_role().to_string(),
            created_at: profile.created_at,
        }
    }
}

//=========================================================================================
// Handlers
//=========================================================================================

/// The caller's own profile.
#[utoipa::path(
    get,
    path = "/api/user/me",
    responses(
        (status = 200, description = "The caller's profile"),
        (status = 404, description = "No profile for this account", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn me_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = state.db.get_user_document(&identity.uid).await?;
    let profile = lookup
        .profile
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    Ok(Json(profile))
}

/// Create the caller's profile. Registering twice returns the existing profile.
#[utoipa::path(
    post,
    path = "/api/user/register",
    request_body(content_type = "application/json", description = "email, fullName, institution, role and any other profile fields"),
    responses(
        (status = 201, description = "Profile created", body = RegisteredResponse),
        (status = 200, description = "Profile already existed"),
        (status = 400, description = "Role may not be self-assigned", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<Response, ApiError> {
    let profile = new_profile(req, &identity)?;

    match state.db.register_user(&identity.uid, profile).await? {
        RegisterOutcome::Created(created) => {
            let body = RegisteredResponse {
                message: "User registered successfully".to_string(),
                full_name: created.full_name.clone(),
                role: created.effective_role().to_string(),
            };
            Ok((StatusCode::CREATED, Json(body)).into_response())
        }
        RegisterOutcome::Existing(existing) => Ok((StatusCode::OK, Json(existing)).into_response()),
    }
}

/// Builds the profile a registration would store. Token claims fill in a
/// missing email or name.
fn new_profile(req: RegisterRequest, identity: &VerifiedIdentity) -> Result<UserProfile, ApiError> {
    let role = match req.role.as_deref() {
        None | Some("") => Role::TeacherDefault,
        Some(raw) => raw.parse::<Role>()?,
    };
    if !role.is_self_assignable() {
        return Err(ApiError::Validation(format!(
            "Role '{role}' cannot be self-assigned"
        )));
    }

    let mut extra = req.extra;
    extra.retain(|key, _| !SERVER_MANAGED_FIELDS.contains(&key.as_str()));

    Ok(UserProfile {
        email: req.email.or_else(|| identity.email.clone()),
        full_name: req.full_name.or_else(|| identity.name.clone()),
        institution: req.institution,
        role: Some(role),
        subscription_type: Some(SubscriptionPlan::Basic),
        subscription_status: Some(SubscriptionStatus::Active),
        extra,
        ..Default::default()
    })
}

/// Page through every user, newest first.
#[utoipa::path(
    get,
    path = "/api/user/users",
    params(UsersQuery),
    responses(
        (status = 200, description = "A page of users"),
        (status = 403, description = "Caller is not an admin", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn list_users_handler(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<UsersQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let query = user_query(query)?;
    let page = state.db.list_users(&query).await?;
    Ok(Json(UserPageResponse::from(page)))
}

fn user_query(query: UsersQuery) -> Result<UserQuery, ApiError> {
    let defaults = UserQuery::default();
    let role = match query.role.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<Role>()?),
    };
    Ok(UserQuery {
        page: query.page.unwrap_or(defaults.page).max(1),
        limit: query.limit.unwrap_or(defaults.limit).clamp(1, MAX_PAGE_SIZE),
        role,
    })
}

#[utoipa::path(
    put,
    path = "/api/user/updateRole",
    request_body = UpdateRoleRequest,
    responses(
        (status = 200, description = "Role updated", body = UpdateRoleResponse),
        (status = 400, description = "Missing or unknown role", body = ErrorEnvelope),
        (status = 404, description = "User not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn update_role_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<UpdateRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(user_id), Some(new_role)) = (
        req.user_id.filter(|u| !u.trim().is_empty()),
        req.new_role.filter(|r| !r.trim().is_empty()),
    ) else {
        return Err(ApiError::Validation("userId and newRole are required".to_string()));
    };
    let role: Role = new_role.parse()?;

    state.db.update_user_role(&user_id, &role).await.map_err(|e| match e {
        PortError::NotFound(_) => ApiError::NotFound("User not found".to_string()),
        other => ApiError::Port(other),
    })?;

    info!(user_id = %user_id, role = %role, "Admin changed user role");
    Ok(Json(UpdateRoleResponse {
        message: "User role updated successfully".to_string(),
        user_id,
        new_role: role.to_string(),
    }))
}

/// Public view of a user's profile.
#[utoipa::path(
    get,
    path = "/api/user/{userId}",
    params(("userId" = String, Path, description = "User id")),
    responses(
        (status = 200, description = "Public profile", body = PublicProfile),
        (status = 400, description = "Blank user id", body = ErrorEnvelope),
        (status = 404, description = "User not found", body = ErrorEnvelope)
    )
)]
pub async fn public_profile_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::Validation("User ID is required".to_string()));
    }

    let lookup = state.db.get_user_document(user_id).await?;
    let profile = lookup
        .profile
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    Ok(Json(PublicProfile::of(lookup.uid, &profile)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> VerifiedIdentity {
        VerifiedIdentity {
            uid: "u1".into(),
            email: Some("token@example.com".into()),
            name: Some("Token Name".into()),
        }
    }

    #[test]
    fn registration_defaults_come_from_the_token() {
        let profile = new_profile(RegisterRequest::default(), &identity()).unwrap();
        assert_eq!(profile.email.as_deref(), Some("token@example.com"));
        assert_eq!(profile.full_name.as_deref(), Some("Token Name"));
        assert_eq!(profile.role, Some(Role::TeacherDefault));
        assert_eq!(profile.plan(), SubscriptionPlan::Basic);
    }

    #[test]
    fn privileged_roles_cannot_be_self_assigned() {
        for role in ["admin", "teacherPlus", "teacherEnterprise"] {
            let req = RegisterRequest {
                role: Some(role.into()),
                ..Default::default()
            };
            let err = new_profile(req, &identity()).unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        }

        let student = RegisterRequest {
            role: Some("student".into()),
            ..Default::default()
        };
        assert_eq!(new_profile(student, &identity()).unwrap().role, Some(Role::Student));
    }

    #[test]
    fn sign_up_cannot_grant_a_plan() {
        let req: RegisterRequest = serde_json::from_value(serde_json::json!({
            "fullName": "Sneaky",
            "subscriptionType": "enterprise",
            "jobTitle": "Teacher"
        }))
        .unwrap();
        let profile = new_profile(req, &identity()).unwrap();
        assert_eq!(profile.plan(), SubscriptionPlan::Basic);
        assert!(!profile.extra.contains_key("subscriptionType"));
        assert_eq!(profile.extra["jobTitle"], "Teacher");
    }

    #[test]
    fn unknown_roles_are_rejected() {
        let req = RegisterRequest {
            role: Some("consumer".into()),
            ..Default::default()
        };
        assert_eq!(new_profile(req, &identity()).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn page_size_is_clamped() {
        let query = user_query(UsersQuery {
            page: Some(0),
            limit: Some(1000),
            role: Some("admin".into()),
        })
        .unwrap();
        assert_eq!(query.page, 1);
        assert_eq!(query.limit, MAX_PAGE_SIZE);
        assert_eq!(query.role, Some(Role::Admin));

        assert!(user_query(UsersQuery {
            role: Some("wizard".into()),
            ..Default::default()
        })
        .is_err());
    }
}
