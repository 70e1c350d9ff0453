//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DocumentStore` port from the `core` crate. Each collection is a
//! Postgres table of `(id, data JSONB)` rows, accessed with `sqlx`.
//!
//! A collection name of the form `schema.table` lives in its own Postgres
//! schema; anything else is a table in the connection's search path.

use async_trait::async_trait;
use curriculum_portal_core::ports::{DocumentData, DocumentStore, PortError, PortResult, StoredDocument};
use serde_json::Value;
use sqlx::{types::Json, FromRow, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DocumentStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the schemas and tables backing `collections` if they are missing.
    pub async fn ensure_collections(&self, collections: &[String]) -> PortResult<()> {
        for collection in collections {
            let table = TableRef::parse(collection)?;
            if let Some(schema) = &table.schema {
                sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
                    .execute(&self.pool)
                    .await
                    .map_err(classify)?;
            }
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    data JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
                table.quoted()
            ))
            .execute(&self.pool)
            .await
            .map_err(classify)?;
            debug!(collection = %collection, "Ensured collection table");
        }
        info!(count = collections.len(), "Database collections ready");
        Ok(())
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct DocumentRecord {
    id: String,
    data: Json<DocumentData>,
}
impl DocumentRecord {
    fn to_domain(self) -> StoredDocument {
        StoredDocument {
            id: self.id,
            data: self.data.0,
        }
    }
}

/// A validated, quotable table reference.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableRef {
    schema: Option<String>,
    table: String,
}

impl TableRef {
    fn parse(collection: &str) -> PortResult<Self> {
        let (schema, table) = match collection.split_once('.') {
            Some((schema, table)) => (Some(schema), table),
            None => (None, collection),
        };

        let valid = |ident: &str| {
            !ident.is_empty() && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        if !valid(table) || !schema.map_or(true, valid) {
            return Err(PortError::InvalidInput(format!(
                "Invalid collection name '{collection}'"
            )));
        }

        Ok(Self {
            schema: schema.map(str::to_string),
            table: table.to_string(),
        })
    }

    fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{}\".\"{}\"", schema, self.table),
            None => format!("\"{}\"", self.table),
        }
    }
}

fn table(collection: &str) -> PortResult<String> {
    TableRef::parse(collection).map(|t| t.quoted())
}

/// Sorts a driver error into the port's error classes.
fn classify(e: sqlx::Error) -> PortError {
    match &e {
        sqlx::Error::RowNotFound => PortError::NotFound(e.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            PortError::Unavailable(e.to_string())
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => PortError::Conflict(db.message().to_string()),
            Some("42501") => PortError::PermissionDenied(db.message().to_string()),
            Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                PortError::Unavailable(db.message().to_string())
            }
            _ => PortError::Unexpected(e.to_string()),
        },
        _ => PortError::Unexpected(e.to_string()),
    }
}

//=========================================================================================
// `DocumentStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl DocumentStore for DbAdapter {
    async fn get(&self, collection: &str, id: &str) -> PortResult<Option<StoredDocument>> {
        let record = sqlx::query_as::<_, DocumentRecord>(&format!(
            "SELECT id, data FROM {} WHERE id = $1",
            table(collection)?
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        Ok(record.map(DocumentRecord::to_domain))
    }

    async fn list(&self, collection: &str) -> PortResult<Vec<StoredDocument>> {
        let records = sqlx::query_as::<_, DocumentRecord>(&format!(
            "SELECT id, data FROM {} ORDER BY created_at, id",
            table(collection)?
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        Ok(records.into_iter().map(DocumentRecord::to_domain).collect())
    }

    async fn find_by(&self, collection: &str, field: &str, value: &Value) -> PortResult<Vec<StoredDocument>> {
        let records = sqlx::query_as::<_, DocumentRecord>(&format!(
            "SELECT id, data FROM {} WHERE data -> $1 = $2 ORDER BY created_at, id",
            table(collection)?
        ))
        .bind(field)
        .bind(Json(value))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        Ok(records.into_iter().map(DocumentRecord::to_domain).collect())
    }

    async fn add(&self, collection: &str, data: DocumentData) -> PortResult<StoredDocument> {
        let id = Uuid::new_v4().simple().to_string();
        sqlx::query(&format!(
            "INSERT INTO {} (id, data) VALUES ($1, $2)",
            table(collection)?
        ))
        .bind(&id)
        .bind(Json(&data))
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(StoredDocument { id, data })
    }

    async fn set(&self, collection: &str, id: &str, data: DocumentData) -> PortResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
            table(collection)?
        ))
        .bind(id)
        .bind(Json(&data))
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: DocumentData) -> PortResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET data = data || $2 WHERE id = $1",
            table(collection)?
        ))
        .bind(id)
        .bind(Json(&patch))
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Document {collection}/{id} not found")));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> PortResult<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", table(collection)?))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn increment(&self, collection: &str, id: &str, field: &str) -> PortResult<i64> {
        let table = table(collection)?;
        let mut tx = self.pool.begin().await.map_err(classify)?;

        sqlx::query(&format!(
            "INSERT INTO {table} (id, data) VALUES ($1, '{{}}'::jsonb) ON CONFLICT (id) DO NOTHING"
        ))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        // The row lock serialises concurrent callers until commit.
        let Json(current): Json<DocumentData> =
            sqlx::query_scalar(&format!("SELECT data FROM {table} WHERE id = $1 FOR UPDATE"))
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(classify)?;
        let next = current.get(field).and_then(Value::as_i64).unwrap_or(0) + 1;

        sqlx::query(&format!(
            "UPDATE {table} SET data = data || jsonb_build_object($2::text, $3::bigint) WHERE id = $1"
        ))
        .bind(id)
        .bind(field)
        .bind(next)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(next)
    }

    fn is_mock(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_collections_map_to_schemas() {
        assert_eq!(table("users").unwrap(), "\"users\"");
        assert_eq!(table("dev_users").unwrap(), "\"dev_users\"");
        assert_eq!(table("prod.payment_logs").unwrap(), "\"prod\".\"payment_logs\"");
    }

    #[test]
    fn hostile_collection_names_are_rejected() {
        for name in ["", "users; DROP TABLE x", "a.b.c", ".users", "us\"ers"] {
            assert!(
                matches!(table(name), Err(PortError::InvalidInput(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn driver_errors_are_classified() {
        assert!(matches!(classify(sqlx::Error::PoolTimedOut), PortError::Unavailable(_)));
        assert!(matches!(classify(sqlx::Error::RowNotFound), PortError::NotFound(_)));
        assert!(matches!(
            classify(sqlx::Error::Protocol("garbled".into())),
            PortError::Unexpected(_)
        ));
    }
}
