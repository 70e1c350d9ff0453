//! User profile operations, including the hierarchical lookup across the
//! legacy `teachers`/`students` collections and the qualified `users` collection.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use super::{decode_listing, timestamp_value, to_document, Collections, DatabaseService};
use crate::domain::{Identified, Role, UserProfile};
use crate::ports::{AccountDirectory, DocumentData, PortError, PortResult, ResolvedAccount};

/// Which of the three profile collections a lookup hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSource {
    Teachers,
    Students,
    Users,
}

impl UserSource {
    pub fn label(self) -> &'static str {
        match self {
            UserSource::Teachers => "teachers",
            UserSource::Students => "students",
            UserSource::Users => "users",
        }
    }
}

/// The outcome of a hierarchical profile lookup.
///
/// A miss still names the qualified `users` collection, which is where a new
/// profile would be written.
#[derive(Debug, Clone, PartialEq)]
pub struct UserLookup {
    pub uid: String,
    pub source: UserSource,
    pub collection: String,
    pub profile: Option<UserProfile>,
}

impl UserLookup {
    pub fn exists(&self) -> bool {
        self.profile.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserQuery {
    pub page: usize,
    pub limit: usize,
    pub role: Option<Role>,
}

impl Default for UserQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            role: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserPage {
    pub users: Vec<Identified<UserProfile>>,
    pub total_users: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub limit: usize,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    Created(UserProfile),
    Existing(UserProfile),
}

impl DatabaseService {
    pub async fn get_user_document(&self, uid: &str) -> PortResult<UserLookup> {
        let probes = [
            (UserSource::Teachers, Collections::TEACHERS.to_string()),
            (UserSource::Students, Collections::STUDENTS.to_string()),
            (UserSource::Users, self.collections.users()),
        ];

        for (source, collection) in probes {
            if let Some(doc) = self.store.get(&collection, uid).await? {
                debug!(uid, collection = %collection, "Found user profile");
                return Ok(UserLookup {
                    uid: uid.to_string(),
                    source,
                    collection,
                    profile: Some(doc.decode()?),
                });
            }
        }

        Ok(UserLookup {
            uid: uid.to_string(),
            source: UserSource::Users,
            collection: self.collections.users(),
            profile: None,
        })
    }

    /// Writes a fresh profile into the qualified `users` collection, stamping
    /// both `createdAt` and `updatedAt`.
    pub async fn set_user_document(&self, uid: &str, profile: &UserProfile) -> PortResult<UserProfile> {
        let now = Utc::now();
        let mut stamped = profile.clone();
        stamped.created_at = Some(now);
        stamped.updated_at = Some(now);

        self.store
            .set(&self.collections.users(), uid, to_document(&stamped)?)
            .await?;
        Ok(stamped)
    }

    /// Merges `patch` into the profile in whichever collection it was found.
    pub async fn update_user_document(&self, lookup: &UserLookup, mut patch: DocumentData) -> PortResult<()> {
        patch.insert("updatedAt".to_string(), timestamp_value(Utc::now()));
        self.store.update(&lookup.collection, &lookup.uid, patch).await
    }

    /// Creates the caller's profile unless one already exists anywhere.
    pub async fn register_user(&self, uid: &str, profile: UserProfile) -> PortResult<RegisterOutcome> {
        let lookup = self.get_user_document(uid).await?;
        if let Some(existing) = lookup.profile {
            debug!(uid, collection = %lookup.collection, "Registration for existing user");
            return Ok(RegisterOutcome::Existing(existing));
        }

        let created = self.set_user_document(uid, &profile).await?;
        info!(uid, role = %created.effective_role(), "Registered new user");
        Ok(RegisterOutcome::Created(created))
    }

    /// Pages through the `users` collection, newest first.
    pub async fn list_users(&self, query: &UserQuery) -> PortResult<UserPage> {
        let page = query.page.max(1);
        let limit = query.limit.max(1);

        let collection = self.collections.users();
        let docs = match &query.role {
            Some(role) => {
                self.store
                    .find_by(&collection, "role", &Value::from(role.as_str()))
                    .await?
            }
            None => self.store.list(&collection).await?,
        };

        let mut users = decode_listing::<UserProfile>(&collection, docs);
        users.sort_by(|a, b| b.doc.created_at.cmp(&a.doc.created_at));

        let total_users = users.len();
        let total_pages = total_users.div_ceil(limit);
        let users = users
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();

        Ok(UserPage {
            users,
            total_users,
            current_page: page,
            total_pages,
            limit,
            has_next_page: page < total_pages,
            has_previous_page: page > 1,
        })
    }

    pub async fn update_user_role(&self, uid: &str, role: &Role) -> PortResult<UserLookup> {
        let lookup = self.get_user_document(uid).await?;
        if !lookup.exists() {
            return Err(PortError::NotFound(format!("User {uid}")));
        }

        let mut patch = DocumentData::new();
        patch.insert("role".to_string(), Value::from(role.as_str()));
        self.update_user_document(&lookup, patch).await?;
        info!(uid, role = %role, collection = %lookup.collection, "Updated user role");
        Ok(lookup)
    }
}

#[async_trait]
impl AccountDirectory for DatabaseService {
    async fn resolve_account(&self, uid: &str) -> PortResult<Option<ResolvedAccount>> {
        let probes = [
            (Collections::TEACHERS, Role::TeacherDefault),
            (Collections::STUDENTS, Role::Student),
        ];

        for (collection, fallback) in probes {
            if let Some(doc) = self.store.get(collection, uid).await? {
                let profile: UserProfile = doc.decode()?;
                return Ok(Some(ResolvedAccount {
                    role: profile.role.unwrap_or(fallback),
                    collection: collection.to_string(),
                }));
            }
        }
        Ok(None)
    }
}
