//! services/api/src/adapters/memory.rs
//!
//! The in-memory `DocumentStore` used in mock mode: development without a
//! database, `APP_ENV=test`, and as the fallback when Postgres is unreachable.

use async_trait::async_trait;
use chrono::Utc;
use curriculum_portal_core::database::timestamp_value;
use curriculum_portal_core::ports::{DocumentData, DocumentStore, PortError, PortResult, StoredDocument};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

type Collection = BTreeMap<String, DocumentData>;

/// Collections of documents held behind a single lock. Every write takes the
/// write half, which is what makes `increment` atomic.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    collections: Arc<RwLock<HashMap<String, Collection>>>,
}

/// A fixed account available in mock mode, reachable through its bearer token.
pub struct MockUser {
    pub token: &'static str,
    pub uid: &'static str,
    pub email: &'static str,
    pub full_name: &'static str,
    pub role: &'static str,
    pub subscription_type: &'static str,
    pub institution: Option<&'static str>,
}

pub const MOCK_USERS: &[MockUser] = &[
    MockUser {
        token: "valid-admin-token",
        uid: "admin-user-123",
        email: "admin@example.com",
        full_name: "Admin User",
        role: "admin",
        subscription_type: "enterprise",
        institution: None,
    },
    MockUser {
        token: "valid-user-token",
        uid: "test-user-123",
        email: "test@example.com",
        full_name: "Test User",
        role: "teacherDefault",
        subscription_type: "basic",
        institution: Some("Test University"),
    },
    MockUser {
        token: "valid-premium-token",
        uid: "premium-user-123",
        email: "premium@example.com",
        full_name: "Premium User",
        role: "teacherPlus",
        subscription_type: "premium",
        institution: None,
    },
];

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the mock accounts into `users_collection`.
    pub async fn seed_mock_users(&self, users_collection: &str) -> PortResult<()> {
        let now = timestamp_value(Utc::now());
        for user in MOCK_USERS {
            let mut profile = json!({
                "email": user.email,
                "fullName": user.full_name,
                "role": user.role,
                "subscriptionType": user.subscription_type,
                "subscriptionStatus": "active",
                "createdAt": now,
                "updatedAt": now,
            });
            if let (Some(institution), Value::Object(map)) = (user.institution, &mut profile) {
                map.insert("institution".to_string(), Value::from(institution));
            }
            if let Value::Object(data) = profile {
                self.set(users_collection, user.uid, data).await?;
            }
        }
        info!(collection = users_collection, count = MOCK_USERS.len(), "Seeded mock users");
        Ok(())
    }
}

fn to_stored(id: &str, data: &DocumentData) -> StoredDocument {
    StoredDocument {
        id: id.to_string(),
        data: data.clone(),
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> PortResult<Option<StoredDocument>> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|data| to_stored(id, data)))
    }

    async fn list(&self, collection: &str) -> PortResult<Vec<StoredDocument>> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|c| c.iter().map(|(id, data)| to_stored(id, data)).collect())
            .unwrap_or_default())
    }

    async fn find_by(&self, collection: &str, field: &str, value: &Value) -> PortResult<Vec<StoredDocument>> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, data)| data.get(field) == Some(value))
                    .map(|(id, data)| to_stored(id, data))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add(&self, collection: &str, data: DocumentData) -> PortResult<StoredDocument> {
        let id = Uuid::new_v4().simple().to_string();
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), data.clone());
        debug!(collection, id = %id, "Added document");
        Ok(StoredDocument { id, data })
    }

    async fn set(&self, collection: &str, id: &str, data: DocumentData) -> PortResult<()> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: DocumentData) -> PortResult<()> {
        let mut guard = self.collections.write().await;
        let doc = guard
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| PortError::NotFound(format!("Document {collection}/{id} not found")))?;
        doc.extend(patch);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> PortResult<()> {
        if let Some(c) = self.collections.write().await.get_mut(collection) {
            c.remove(id);
        }
        Ok(())
    }

    async fn increment(&self, collection: &str, id: &str, field: &str) -> PortResult<i64> {
        let mut guard = self.collections.write().await;
        let doc = guard
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        let next = doc.get(field).and_then(Value::as_i64).unwrap_or(0) + 1;
        doc.insert(field.to_string(), Value::from(next));
        Ok(next)
    }

    fn is_mock(&self) -> bool {
        true
    }
}
