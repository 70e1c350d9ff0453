//! crates/curriculum_portal_core/src/database/mod.rs
//!
//! The database access shim. `DatabaseService` wraps whichever `DocumentStore`
//! was selected at startup (Postgres or the in-memory mock), knows the
//! environment-qualified collection names, and exposes the typed operations the
//! HTTP handlers need.

mod billing;
mod catalog;
mod users;

pub use billing::CheckoutUpdate;
pub use catalog::{BackfillReport, LessonFilter, ModuleChanges};
pub use users::{RegisterOutcome, UserLookup, UserPage, UserQuery, UserSource};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::Identified;
use crate::ports::{DocumentData, DocumentStore, PortError, PortResult, StoredDocument};

//=========================================================================================
// Collection Naming
//=========================================================================================

/// Resolves collection names under the environment's schema qualifier.
///
/// The legacy `teachers` and `students` collections predate the qualifier and
/// are always read unqualified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collections {
    qualifier: String,
}

impl Collections {
    pub const TEACHERS: &'static str = "teachers";
    pub const STUDENTS: &'static str = "students";
    pub const UNIT_COUNTER_ID: &'static str = "unitIdCounter";

    pub fn new(qualifier: impl Into<String>) -> Self {
        Self {
            qualifier: qualifier.into(),
        }
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn qualified(&self, base: &str) -> String {
        format!("{}{}", self.qualifier, base)
    }

    pub fn users(&self) -> String {
        self.qualified("users")
    }

    pub fn content(&self) -> String {
        self.qualified("content")
    }

    pub fn lessons(&self) -> String {
        self.qualified("lesson")
    }

    pub fn modules(&self) -> String {
        self.qualified("module")
    }

    pub fn counters(&self) -> String {
        self.qualified("counters")
    }

    pub fn payment_logs(&self) -> String {
        self.qualified("payment_logs")
    }

    pub fn enterprise_contacts(&self) -> String {
        self.qualified("enterprise_contacts")
    }

    /// Payment logs touched by a Stripe webhook follow the event's mode rather
    /// than the deployment: live events land under `prod.`, test events unqualified.
    pub fn payment_logs_for_livemode(livemode: bool) -> String {
        if livemode {
            "prod.payment_logs".to_string()
        } else {
            "payment_logs".to_string()
        }
    }

    /// Every collection the service writes to, for stores that need them created up front.
    pub fn all(&self) -> Vec<String> {
        let mut names = vec![
            Self::TEACHERS.to_string(),
            Self::STUDENTS.to_string(),
            self.users(),
            self.content(),
            self.lessons(),
            self.modules(),
            self.counters(),
            self.payment_logs(),
            self.enterprise_contacts(),
        ];
        for livemode in [false, true] {
            let logs = Self::payment_logs_for_livemode(livemode);
            if !names.contains(&logs) {
                names.push(logs);
            }
        }
        names
    }
}

//=========================================================================================
// The Service
//=========================================================================================

/// Diagnostic snapshot returned by the info endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
    pub initialized: bool,
    pub mock_mode: bool,
    pub environment: String,
    pub has_valid_config: bool,
    pub schema_qualifier: String,
}

pub struct DatabaseService {
    store: Arc<dyn DocumentStore>,
    collections: Collections,
    environment: String,
    has_valid_config: bool,
}

impl DatabaseService {
    pub fn new(store: Arc<dyn DocumentStore>, collections: Collections) -> Self {
        Self {
            store,
            collections,
            environment: "development".to_string(),
            has_valid_config: false,
        }
    }

    /// Records which environment the service runs in and whether a real store
    /// was configured, for `info()`.
    pub fn with_environment(mut self, environment: impl Into<String>, has_valid_config: bool) -> Self {
        self.environment = environment.into();
        self.has_valid_config = has_valid_config;
        self
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn is_mock_mode(&self) -> bool {
        self.store.is_mock()
    }

    pub fn info(&self) -> DatabaseInfo {
        DatabaseInfo {
            initialized: true,
            mock_mode: self.store.is_mock(),
            environment: self.environment.clone(),
            has_valid_config: self.has_valid_config,
            schema_qualifier: self.collections.qualifier().to_string(),
        }
    }

    /// Issues the next content unit id (`diya1`, `diya2`, ...).
    ///
    /// Backed by the store's atomic counter, so no two callers ever receive the
    /// same id.
    pub async fn next_unit_id(&self) -> PortResult<String> {
        let n = self
            .store
            .increment(
                &self.collections.counters(),
                Collections::UNIT_COUNTER_ID,
                "lastNumber",
            )
            .await?;
        debug!(unit_number = n, "Issued unit id");
        Ok(format!("diya{n}"))
    }
}

//=========================================================================================
// Encoding Helpers
//=========================================================================================

/// Serializes a struct into top-level document fields.
pub(crate) fn to_document<T: Serialize>(value: &T) -> PortResult<DocumentData> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(PortError::Unexpected(
            "Document must serialize to an object".to_string(),
        )),
        Err(e) => Err(PortError::Unexpected(e.to_string())),
    }
}

pub(crate) fn identified<T: DeserializeOwned>(doc: StoredDocument) -> PortResult<Identified<T>> {
    let decoded = doc.decode()?;
    Ok(Identified {
        id: doc.id,
        doc: decoded,
    })
}

/// Decodes a listing, dropping documents that no longer match their type so one
/// bad record cannot take the whole collection down.
pub(crate) fn decode_listing<T: DeserializeOwned>(collection: &str, docs: Vec<StoredDocument>) -> Vec<Identified<T>> {
    docs.into_iter()
        .filter_map(|doc| {
            let id = doc.id.clone();
            match identified(doc) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    warn!(collection, id = %id, error = %e, "Skipping malformed document");
                    None
                }
            }
        })
        .collect()
}

/// The stored representation of a point in time.
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A minimal in-process store for exercising the service without an adapter crate.

    use super::*;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MapStore {
        collections: Mutex<HashMap<String, BTreeMap<String, DocumentData>>>,
        next_id: Mutex<u64>,
    }

    impl MapStore {
        pub fn insert(&self, collection: &str, id: &str, data: Value) {
            let Value::Object(map) = data else {
                panic!("test documents must be objects");
            };
            self.collections
                .lock()
                .unwrap()
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), map);
        }

        pub fn raw(&self, collection: &str, id: &str) -> Option<DocumentData> {
            self.collections
                .lock()
                .unwrap()
                .get(collection)
                .and_then(|c| c.get(id).cloned())
        }
    }

    #[async_trait]
    impl DocumentStore for MapStore {
        async fn get(&self, collection: &str, id: &str) -> PortResult<Option<StoredDocument>> {
            Ok(self.raw(collection, id).map(|data| StoredDocument {
                id: id.to_string(),
                data,
            }))
        }

        async fn list(&self, collection: &str) -> PortResult<Vec<StoredDocument>> {
            Ok(self
                .collections
                .lock()
                .unwrap()
                .get(collection)
                .map(|c| {
                    c.iter()
                        .map(|(id, data)| StoredDocument {
                            id: id.clone(),
                            data: data.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn find_by(
            &self,
            collection: &str,
            field: &str,
            value: &Value,
        ) -> PortResult<Vec<StoredDocument>> {
            let docs = self.list(collection).await?;
            Ok(docs
                .into_iter()
                .filter(|d| d.data.get(field) == Some(value))
                .collect())
        }

        async fn add(&self, collection: &str, data: DocumentData) -> PortResult<StoredDocument> {
            let id = {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                format!("doc{next}")
            };
            self.set(collection, &id, data.clone()).await?;
            Ok(StoredDocument { id, data })
        }

        async fn set(&self, collection: &str, id: &str, data: DocumentData) -> PortResult<()> {
            self.insert(collection, id, Value::Object(data));
            Ok(())
        }

        async fn update(&self, collection: &str, id: &str, patch: DocumentData) -> PortResult<()> {
            let mut guard = self.collections.lock().unwrap();
            let doc = guard
                .get_mut(collection)
                .and_then(|c| c.get_mut(id))
                .ok_or_else(|| PortError::NotFound(format!("{collection}/{id}")))?;
            doc.extend(patch);
            Ok(())
        }

        async fn delete(&self, collection: &str, id: &str) -> PortResult<()> {
            if let Some(c) = self.collections.lock().unwrap().get_mut(collection) {
                c.remove(id);
            }
            Ok(())
        }

        async fn increment(&self, collection: &str, id: &str, field: &str) -> PortResult<i64> {
            let mut guard = self.collections.lock().unwrap();
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

    pub fn service(store: Arc<MapStore>) -> DatabaseService {
        DatabaseService::new(store, Collections::new("test_"))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{service, MapStore};
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn legacy_collections_ignore_the_qualifier() {
        let collections = Collections::new("prod.");
        assert_eq!(collections.users(), "prod.users");
        assert_eq!(collections.lessons(), "prod.lesson");
        assert!(collections.all().contains(&"teachers".to_string()));
        assert!(collections.all().contains(&"prod.payment_logs".to_string()));
        assert!(collections.all().contains(&"payment_logs".to_string()));
        assert_eq!(
            collections.all().iter().filter(|c| c.as_str() == "prod.payment_logs").count(),
            1
        );
    }

    #[tokio::test]
    async fn unit_ids_are_never_reissued() {
        let db = service(Arc::new(MapStore::default()));
        let mut seen = HashSet::new();
        for _ in 0..25 {
            assert!(seen.insert(db.next_unit_id().await.unwrap()));
        }
        assert!(seen.contains("diya1"));
        assert!(seen.contains("diya25"));
    }

    #[tokio::test]
    async fn unit_ids_continue_from_existing_counter() {
        let store = Arc::new(MapStore::default());
        store.insert("test_counters", "unitIdCounter", serde_json::json!({ "lastNumber": 41 }));
        let db = service(store);
        assert_eq!(db.next_unit_id().await.unwrap(), "diya42");
    }

    #[test]
    fn info_reports_mock_mode_and_qualifier() {
        let db = service(Arc::new(MapStore::default())).with_environment("test", false);
        let info = db.info();
        assert!(info.initialized);
        assert!(info.mock_mode);
        assert_eq!(info.environment, "test");
        assert_eq!(info.schema_qualifier, "test_");
    }
}
