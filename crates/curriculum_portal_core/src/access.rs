//! crates/curriculum_portal_core/src/access.rs
//!
//! Role gates. A gate loads the caller's profile through the hierarchical
//! lookup and checks its role against a fixed allow-list.

use tracing::debug;

use crate::database::{DatabaseService, UserLookup};
use crate::domain::{Role, UserProfile};
use crate::ports::PortError;

/// The named gates applied to routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleRequirement {
    Admin,
    Teacher,
    PremiumTeacher,
    /// Any role, as long as a profile exists.
    ValidUser,
}

const ADMIN_ROLES: &[Role] = &[Role::Admin];
const TEACHER_ROLES: &[Role] = &[Role::TeacherDefault, Role::TeacherPlus, Role::TeacherEnterprise];
const PREMIUM_ROLES: &[Role] = &[Role::TeacherPlus, Role::TeacherEnterprise];

impl RoleRequirement {
    pub fn allowed_roles(self) -> &'static [Role] {
        match self {
            RoleRequirement::Admin => ADMIN_ROLES,
            RoleRequirement::Teacher => TEACHER_ROLES,
            RoleRequirement::PremiumTeacher => PREMIUM_ROLES,
            RoleRequirement::ValidUser => &[],
        }
    }

    pub fn allows(self, role: &Role) -> bool {
        match self {
            RoleRequirement::ValidUser => true,
            _ => self.allowed_roles().contains(role),
        }
    }
}

/// Why a gate turned a request away.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccessDenied {
    #[error("Authentication required for role check")]
    Unauthenticated,
    #[error("User profile not found")]
    ProfileNotFound,
    #[error("Access denied. Required role: {required}, Current role: {actual}")]
    RoleNotAllowed { required: String, actual: Role },
    #[error(transparent)]
    Store(#[from] PortError),
}

/// The caller's profile, attached to a request once a gate passes.
#[derive(Debug, Clone, PartialEq)]
pub struct CallerProfile {
    pub lookup: UserLookup,
    pub profile: UserProfile,
    pub role: Role,
}

impl CallerProfile {
    pub fn uid(&self) -> &str {
        &self.lookup.uid
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Runs a gate for `uid` (absent when the request carried no identity).
pub async fn authorize(
    db: &DatabaseService,
    uid: Option<&str>,
    requirement: RoleRequirement,
) -> Result<CallerProfile, AccessDenied> {
    let uid = uid.filter(|u| !u.is_empty()).ok_or(AccessDenied::Unauthenticated)?;

    let lookup = db.get_user_document(uid).await?;
    let profile = lookup.profile.clone().ok_or(AccessDenied::ProfileNotFound)?;
    let role = profile.effective_role();

    if !requirement.allows(&role) {
        let required = requirement
            .allowed_roles()
            .iter()
            .map(Role::as_str)
            .collect::<Vec<_>>()
            .join(" or ");
        debug!(uid, role = %role, ?requirement, "Role gate rejected caller");
        return Err(AccessDenied::RoleNotAllowed { required, actual: role });
    }

    Ok(CallerProfile { lookup, profile, role })
}
