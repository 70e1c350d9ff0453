//! Content units, lesson plans and modules.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{decode_listing, identified, timestamp_value, to_document, DatabaseService};
use crate::domain::{Identified, Lesson, Module, Nugget, Section};
use crate::ports::{DocumentData, PortError, PortResult};

/// Optional filters for listing lessons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LessonFilter {
    pub author_id: Option<String>,
    pub is_draft: Option<bool>,
}

impl LessonFilter {
    fn matches(&self, lesson: &Lesson) -> bool {
        let author_ok = self
            .author_id
            .as_deref()
            .map_or(true, |author| lesson.author_id.as_deref() == Some(author));
        let draft_ok = self.is_draft.map_or(true, |draft| lesson.is_draft == draft);
        author_ok && draft_ok
    }
}

/// Fields accepted when editing a module. Absent or empty strings keep the
/// stored value; a supplied list always replaces the stored one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub lesson_plans: Option<Vec<String>>,
    pub image: Option<String>,
}

impl ModuleChanges {
    pub fn apply_to(self, module: &mut Module) {
        if let Some(title) = non_empty(self.title) {
            module.title = title;
        }
        if let Some(description) = non_empty(self.description) {
            module.description = Some(description);
        }
        if let Some(tags) = self.tags {
            module.tags = tags;
        }
        if let Some(lesson_plans) = self.lesson_plans {
            module.lesson_plans = lesson_plans;
        }
        if let Some(image) = non_empty(self.image) {
            module.image = Some(image);
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Counts reported by the content backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub scanned: usize,
    pub updated: usize,
}

impl DatabaseService {
    //-------------------------------------------------------------------------------------
    // Content units
    //-------------------------------------------------------------------------------------

    pub async fn list_units(&self, public_only: bool) -> PortResult<Vec<Identified<Nugget>>> {
        let collection = self.collections.content();
        let docs = self.store.list(&collection).await?;
        Ok(decode_listing::<Nugget>(&collection, docs)
            .into_iter()
            .filter(|unit| !public_only || unit.doc.is_public)
            .collect())
    }

    pub async fn get_unit(&self, id: &str) -> PortResult<Option<Identified<Nugget>>> {
        let doc = self.store.get(&self.collections.content(), id).await?;
        doc.map(identified).transpose()
    }

    /// Stores a new unit authored by `author`, assigning the next `UnitID`.
    pub async fn create_unit(&self, mut unit: Nugget, author: &str) -> PortResult<Identified<Nugget>> {
        let now = Utc::now();
        if unit.unit_id.is_none() {
            unit.unit_id = Some(self.next_unit_id().await?);
        }
        unit.author = Some(author.to_string());
        unit.created_at = Some(now);
        unit.last_modified = Some(now);

        let stored = self
            .store
            .add(&self.collections.content(), to_document(&unit)?)
            .await?;
        info!(unit_id = %stored.id, author, "Created content unit");
        Ok(Identified {
            id: stored.id,
            doc: unit,
        })
    }

    /// Merges `patch` into an existing unit and stamps `LastModified`.
    pub async fn update_unit(&self, id: &str, mut patch: DocumentData) -> PortResult<()> {
        patch.insert("LastModified".to_string(), timestamp_value(Utc::now()));
        self.store
            .update(&self.collections.content(), id, patch)
            .await
            .map_err(|e| match e {
                PortError::NotFound(_) => PortError::NotFound("Unit not found".to_string()),
                other => other,
            })
    }

    /// Deletes a unit unless some lesson section still embeds it.
    pub async fn delete_unit(&self, id: &str) -> PortResult<()> {
        if self.get_unit(id).await?.is_none() {
            return Err(PortError::NotFound("Unit not found".to_string()));
        }

        let referencing: Vec<String> = self
            .list_lessons(&LessonFilter::default())
            .await?
            .into_iter()
            .filter(|lesson| lesson.doc.references_content(id))
            .map(|lesson| lesson.doc.title)
            .collect();

        if !referencing.is_empty() {
            return Err(PortError::InvalidInput(format!(
                "Cannot delete unit as it is used in the following lesson plans: {}",
                referencing.join(", ")
            )));
        }

        self.store.delete(&self.collections.content(), id).await?;
        info!(unit_id = id, "Deleted content unit");
        Ok(())
    }

    /// Marks each listed unit public. Ids with no stored unit are skipped.
    pub async fn publish_units<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> PortResult<usize> {
        let mut published = 0;
        for id in ids {
            let mut patch = DocumentData::new();
            patch.insert("isPublic".to_string(), Value::Bool(true));
            match self.store.update(&self.collections.content(), id, patch).await {
                Ok(()) => published += 1,
                Err(PortError::NotFound(_)) => warn!(unit_id = id, "Lesson references a missing unit"),
                Err(e) => return Err(e),
            }
        }
        Ok(published)
    }

    /// Fills in `UnitID`, `Author` and `LastModified` on units written before
    /// those fields existed.
    pub async fn backfill_units(&self) -> PortResult<BackfillReport> {
        let docs = self.store.list(&self.collections.content()).await?;
        let mut report = BackfillReport {
            scanned: docs.len(),
            updated: 0,
        };

        for doc in docs {
            let mut patch = DocumentData::new();
            if is_blank(doc.data.get("UnitID")) {
                patch.insert("UnitID".to_string(), Value::from(self.next_unit_id().await?));
            }
            if is_blank(doc.data.get("Author")) {
                patch.insert("Author".to_string(), Value::from("unknown"));
            }
            if is_blank(doc.data.get("LastModified")) {
                patch.insert("LastModified".to_string(), timestamp_value(Utc::now()));
            }

            if !patch.is_empty() {
                debug!(unit_id = %doc.id, fields = patch.len(), "Backfilling unit");
                self.store
                    .update(&self.collections.content(), &doc.id, patch)
                    .await?;
                report.updated += 1;
            }
        }
        Ok(report)
    }

    //-------------------------------------------------------------------------------------
    // Lessons
    //-------------------------------------------------------------------------------------

    pub async fn list_lessons(&self, filter: &LessonFilter) -> PortResult<Vec<Identified<Lesson>>> {
        let collection = self.collections.lessons();
        let docs = self.store.list(&collection).await?;
        Ok(decode_listing::<Lesson>(&collection, docs)
            .into_iter()
            .filter(|lesson| filter.matches(&lesson.doc))
            .collect())
    }

    pub async fn get_lesson(&self, id: &str) -> PortResult<Option<Identified<Lesson>>> {
        let doc = self.store.get(&self.collections.lessons(), id).await?;
        doc.map(identified).transpose()
    }

    /// The sections of a lesson; a lesson without sections counts as not found.
    pub async fn lesson_sections(&self, id: &str) -> PortResult<Vec<Section>> {
        let lesson = self
            .get_lesson(id)
            .await?
            .ok_or_else(|| PortError::NotFound("Lesson not found".to_string()))?;
        if lesson.doc.sections.is_empty() {
            return Err(PortError::NotFound(
                "No sections found for this lesson".to_string(),
            ));
        }
        Ok(lesson.doc.sections)
    }

    pub async fn create_lesson(&self, mut lesson: Lesson, author_id: &str) -> PortResult<String> {
        let now = Utc::now();
        lesson.author_id = Some(author_id.to_string());
        lesson.created_at = Some(now);
        lesson.updated_at = Some(now);

        let stored = self
            .store
            .add(&self.collections.lessons(), to_document(&lesson)?)
            .await?;
        if lesson.is_public {
            self.publish_units(lesson.content_ids()).await?;
        }
        info!(lesson_id = %stored.id, author_id, "Created lesson");
        Ok(stored.id)
    }

    /// Replaces the editable fields of a lesson. Authorship and creation time
    /// are kept from the stored document. Publishing a lesson publishes every
    /// unit it references.
    pub async fn replace_lesson(&self, id: &str, mut lesson: Lesson) -> PortResult<Identified<Lesson>> {
        let existing = self
            .get_lesson(id)
            .await?
            .ok_or_else(|| PortError::NotFound("Lesson not found".to_string()))?;

        lesson.author_id = existing.doc.author_id;
        lesson.created_at = existing.doc.created_at;
        lesson.updated_at = Some(Utc::now());

        self.store
            .set(&self.collections.lessons(), id, to_document(&lesson)?)
            .await?;
        if lesson.is_public {
            let published = self.publish_units(lesson.content_ids()).await?;
            debug!(lesson_id = id, published, "Published lesson content");
        }
        Ok(Identified {
            id: id.to_string(),
            doc: lesson,
        })
    }

    pub async fn delete_lesson(&self, id: &str) -> PortResult<()> {
        if self.get_lesson(id).await?.is_none() {
            return Err(PortError::NotFound("Lesson not found".to_string()));
        }
        self.store.delete(&self.collections.lessons(), id).await?;
        info!(lesson_id = id, "Deleted lesson");
        Ok(())
    }

    //-------------------------------------------------------------------------------------
    // Modules
    //-------------------------------------------------------------------------------------

    pub async fn list_modules(&self) -> PortResult<Vec<Identified<Module>>> {
        let collection = self.collections.modules();
        let docs = self.store.list(&collection).await?;
        Ok(decode_listing(&collection, docs))
    }

    pub async fn get_module(&self, id: &str) -> PortResult<Option<Identified<Module>>> {
        let doc = self.store.get(&self.collections.modules(), id).await?;
        doc.map(identified).transpose()
    }

    pub async fn create_module(&self, module: Module) -> PortResult<Identified<Module>> {
        let stored = self
            .store
            .add(&self.collections.modules(), to_document(&module)?)
            .await?;
        info!(module_id = %stored.id, "Created module");
        Ok(Identified {
            id: stored.id,
            doc: module,
        })
    }

    pub async fn edit_module(&self, id: &str, changes: ModuleChanges) -> PortResult<Identified<Module>> {
        let mut module = self
            .get_module(id)
            .await?
            .ok_or_else(|| PortError::NotFound("Module not found".to_string()))?
            .doc;
        changes.apply_to(&mut module);

        self.store
            .set(&self.collections.modules(), id, to_document(&module)?)
            .await?;
        Ok(Identified {
            id: id.to_string(),
            doc: module,
        })
    }

    pub async fn delete_module(&self, id: &str) -> PortResult<()> {
        if self.get_module(id).await?.is_none() {
            return Err(PortError::NotFound("Module not found".to_string()));
        }
        self.store.delete(&self.collections.modules(), id).await?;
        info!(module_id = id, "Deleted module");
        Ok(())
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{service, MapStore};
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn lesson_with(title: &str, content: &[&str]) -> Lesson {
        Lesson {
            title: title.to_string(),
            sections: vec![Section {
                intro: "intro".into(),
                content_ids: content.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn only_public_units_are_listed() {
        let store = Arc::new(MapStore::default());
        store.insert("test_content", "a", json!({ "Title": "A", "isPublic": true }));
        store.insert("test_content", "b", json!({ "Title": "B", "isPublic": false }));
        store.insert("test_content", "c", json!({ "Title": "C" }));
        let db = service(store);

        let public = db.list_units(true).await.unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].id, "a");
        assert_eq!(db.list_units(false).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn one_malformed_unit_does_not_hide_the_rest() {
        let store = Arc::new(MapStore::default());
        store.insert("test_content", "a", json!({ "Title": "A", "isPublic": true }));
        store.insert("test_content", "b", json!({ "Title": "B", "isPublic": true }));
        let db = service(store);

        let mut patch = DocumentData::new();
        patch.insert("Title".into(), json!(123));
        db.update_unit("b", patch).await.unwrap();

        let units = db.list_units(true).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, "a");
        assert!(db.get_unit("b").await.is_err());
    }

    #[tokio::test]
    async fn created_units_get_sequential_ids_and_author() {
        let db = service(Arc::new(MapStore::default()));
        let first = db.create_unit(Nugget::default(), "t1").await.unwrap();
        let second = db.create_unit(Nugget::default(), "t1").await.unwrap();

        assert_eq!(first.doc.unit_id.as_deref(), Some("diya1"));
        assert_eq!(second.doc.unit_id.as_deref(), Some("diya2"));
        assert_eq!(first.doc.author.as_deref(), Some("t1"));
        assert!(first.doc.created_at.is_some());
    }

    #[tokio::test]
    async fn updating_a_missing_unit_is_not_found() {
        let db = service(Arc::new(MapStore::default()));
        let err = db.update_unit("nope", DocumentData::new()).await.unwrap_err();
        assert_eq!(err, PortError::NotFound("Unit not found".into()));
    }

    #[tokio::test]
    async fn referenced_units_cannot_be_deleted() {
        let store = Arc::new(MapStore::default());
        store.insert("test_content", "c1", json!({ "Title": "Photosynthesis" }));
        store.insert("test_content", "c2", json!({ "Title": "Orphan" }));
        let db = service(store.clone());
        db.create_lesson(lesson_with("Plants", &["c1"]), "t1").await.unwrap();
        db.create_lesson(lesson_with("Light", &["c1"]), "t1").await.unwrap();

        match db.delete_unit("c1").await.unwrap_err() {
            PortError::InvalidInput(msg) => {
                assert!(msg.contains("Plants"));
                assert!(msg.contains("Light"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        db.delete_unit("c2").await.unwrap();
        assert!(store.raw("test_content", "c2").is_none());
        assert!(matches!(db.delete_unit("c2").await, Err(PortError::NotFound(_))));
    }

    #[tokio::test]
    async fn publishing_a_lesson_publishes_its_units() {
        let store = Arc::new(MapStore::default());
        store.insert("test_content", "c1", json!({ "Title": "One", "isPublic": false }));
        let db = service(store.clone());
        let id = db.create_lesson(lesson_with("Draft", &["c1", "missing"]), "t1").await.unwrap();
        assert_eq!(store.raw("test_content", "c1").unwrap()["isPublic"], false);

        let mut published = lesson_with("Final", &["c1", "missing"]);
        published.is_public = true;
        published.author_id = Some("someone-else".into());
        let saved = db.replace_lesson(&id, published).await.unwrap();

        assert_eq!(saved.doc.author_id.as_deref(), Some("t1"));
        assert_eq!(store.raw("test_content", "c1").unwrap()["isPublic"], true);
    }

    #[tokio::test]
    async fn lesson_filters_and_sections() {
        let store = Arc::new(MapStore::default());
        store.insert("test_lesson", "l1", json!({ "title": "A", "authorId": "t1", "isDraft": true }));
        store.insert("test_lesson", "l2", json!({ "title": "B", "authorId": "t2", "sections": [{ "intro": "x", "contentIds": [] }] }));
        let db = service(store);

        let mine = db
            .list_lessons(&LessonFilter { author_id: Some("t1".into()), is_draft: None })
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        let published = db
            .list_lessons(&LessonFilter { author_id: None, is_draft: Some(false) })
            .await
            .unwrap();
        assert_eq!(published[0].id, "l2");

        assert!(matches!(db.lesson_sections("l1").await, Err(PortError::NotFound(_))));
        assert_eq!(db.lesson_sections("l2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn module_edits_keep_previous_values() {
        let db = service(Arc::new(MapStore::default()));
        let created = db
            .create_module(Module {
                title: "Ecology".into(),
                description: Some("Living things".into()),
                tags: vec!["science".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        let edited = db
            .edit_module(
                &created.id,
                ModuleChanges {
                    title: Some(String::new()),
                    lesson_plans: Some(vec!["l1".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(edited.doc.title, "Ecology");
        assert_eq!(edited.doc.description.as_deref(), Some("Living things"));
        assert_eq!(edited.doc.tags, vec!["science"]);
        assert_eq!(edited.doc.lesson_plans, vec!["l1"]);

        db.delete_module(&created.id).await.unwrap();
        assert!(matches!(db.delete_module(&created.id).await, Err(PortError::NotFound(_))));
    }

    #[tokio::test]
    async fn backfill_fills_only_missing_fields() {
        let store = Arc::new(MapStore::default());
        store.insert("test_content", "a", json!({ "Title": "A" }));
        store.insert(
            "test_content",
            "b",
            json!({ "Title": "B", "UnitID": "diya7", "Author": "t1", "LastModified": "2024-01-01T00:00:00Z" }),
        );
        let db = service(store.clone());

        let report = db.backfill_units().await.unwrap();
        assert_eq!(report, BackfillReport { scanned: 2, updated: 1 });

        let a = store.raw("test_content", "a").unwrap();
        assert_eq!(a["UnitID"], "diya1");
        assert_eq!(a["Author"], "unknown");
        assert!(a.contains_key("LastModified"));
        assert_eq!(store.raw("test_content", "b").unwrap()["UnitID"], "diya7");
    }
}
