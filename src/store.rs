//! Document-store accessors used by the backup engine. The route handlers
//! talk to typed `Collection<T>`s directly; the export/import orchestrator
//! instead goes through this trait so the whole engine runs against an
//! in-memory store in tests.

use futures_util::StreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::Collection;
use std::cmp::Ordering;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
    #[error("malformed record: {0}")]
    Malformed(#[from] mongodb::bson::de::Error),
    #[error("unserializable record: {0}")]
    Unserializable(#[from] mongodb::bson::ser::Error),
}

pub trait DocumentStore {
    fn find_one(
        &self,
        filter: Document,
    ) -> impl std::future::Future<Output = Result<Option<Document>, StoreError>>;

    fn find_by_id(
        &self,
        id: &ObjectId,
    ) -> impl std::future::Future<Output = Result<Option<Document>, StoreError>>;

    /// `sort` maps field name to 1 (ascending) or -1 (descending); an empty
    /// document means unspecified order.
    fn find_many(
        &self,
        filter: Document,
        sort: Document,
    ) -> impl std::future::Future<Output = Result<Vec<Document>, StoreError>>;

    /// Inserts the document, assigning a fresh `_id` when absent, and
    /// returns the id.
    fn insert(
        &self,
        doc: Document,
    ) -> impl std::future::Future<Output = Result<ObjectId, StoreError>>;

    /// `update` is a Mongo-style update document (`$set`, `$addToSet`).
    fn update_by_id(
        &self,
        id: &ObjectId,
        update: Document,
    ) -> impl std::future::Future<Output = Result<(), StoreError>>;
}

/// The entity stores the backup engine operates over. GA document sections
/// and calendar settings are not part of the backup format.
pub struct Catalog<S> {
    pub users: S,
    pub students: S,
    pub dashboards: S,
    pub notifications: S,
    pub documents: S,
    pub books: S,
    pub event_signups: S,
}

// ---------------------------------------------------------------------------
// MongoDB-backed store
// ---------------------------------------------------------------------------

pub struct MongoStore {
    coll: Collection<Document>,
}

impl MongoStore {
    pub fn new(coll: Collection<Document>) -> Self {
        MongoStore { coll }
    }
}

impl Catalog<MongoStore> {
    pub fn mongo(db: &mongodb::Database) -> Self {
        Catalog {
            users: MongoStore::new(db.collection("users")),
            students: MongoStore::new(db.collection("students")),
            dashboards: MongoStore::new(db.collection("dashboards")),
            notifications: MongoStore::new(db.collection("notifications")),
            documents: MongoStore::new(db.collection("documents")),
            books: MongoStore::new(db.collection("books")),
            event_signups: MongoStore::new(db.collection("event_signups")),
        }
    }
}

impl DocumentStore for MongoStore {
    async fn find_one(&self, filter: Document) -> Result<Option<Document>, StoreError> {
        Ok(self.coll.find_one(filter).await?)
    }

    async fn find_by_id(&self, id: &ObjectId) -> Result<Option<Document>, StoreError> {
        Ok(self.coll.find_one(doc! { "_id": id }).await?)
    }

    async fn find_many(&self, filter: Document, sort: Document) -> Result<Vec<Document>, StoreError> {
        let mut cursor = if sort.is_empty() {
            self.coll.find(filter).await?
        } else {
            self.coll.find(filter).sort(sort).await?
        };

        let mut docs = vec![];
        while let Some(result) = cursor.next().await {
            docs.push(result?);
        }
        Ok(docs)
    }

    async fn insert(&self, mut doc: Document) -> Result<ObjectId, StoreError> {
        let id = match doc.get_object_id("_id") {
            Ok(id) => id,
            Err(_) => {
                let id = ObjectId::new();
                doc.insert("_id", id);
                id
            }
        };
        self.coll.insert_one(&doc).await?;
        Ok(id)
    }

    async fn update_by_id(&self, id: &ObjectId, update: Document) -> Result<(), StoreError> {
        self.coll.update_one(doc! { "_id": id }, update).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store (tests)
// ---------------------------------------------------------------------------

/// Backing store for tests: a locked vector of documents with just enough
/// of the query language to serve the engine's filters (`$or`, `$ne`,
/// `$gte`, `$lte`, `$in`, dotted paths, null-matches-missing).
#[derive(Default)]
pub struct MemStore {
    docs: Mutex<Vec<Document>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    pub fn dump(&self) -> Vec<Document> {
        self.docs.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }
}

impl Catalog<MemStore> {
    pub fn memory() -> Self {
        Catalog {
            users: MemStore::new(),
            students: MemStore::new(),
            dashboards: MemStore::new(),
            notifications: MemStore::new(),
            documents: MemStore::new(),
            books: MemStore::new(),
            event_signups: MemStore::new(),
        }
    }
}

fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let value = current.get(part)?;
        if parts.peek().is_none() {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

fn matches_condition(value: Option<&Bson>, condition: &Bson) -> bool {
    match condition {
        // Operator document: every operator must hold.
        Bson::Document(ops)
            if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() =>
        {
            ops.iter().all(|(op, operand)| match op.as_str() {
                "$ne" => !matches_condition(value, operand),
                "$gte" => value.is_some_and(|v| cmp_bson(v, operand) != Ordering::Less),
                "$lte" => value.is_some_and(|v| cmp_bson(v, operand) != Ordering::Greater),
                "$in" => operand
                    .as_array()
                    .is_some_and(|arr| value.is_some_and(|v| bson_in(v, arr))),
                _ => false,
            })
        }
        // As in Mongo, an equality match on null also matches a missing field.
        Bson::Null => matches!(value, None | Some(Bson::Null)),
        other => value.is_some_and(|v| bson_eq_or_contains(v, other)),
    }
}

fn bson_eq_or_contains(value: &Bson, target: &Bson) -> bool {
    if value == target {
        return true;
    }
    // Equality against an array field matches any element.
    value
        .as_array()
        .is_some_and(|arr| arr.iter().any(|v| v == target))
}

fn bson_in(value: &Bson, candidates: &[Bson]) -> bool {
    candidates.iter().any(|c| bson_eq_or_contains(value, c))
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| {
        if key == "$or" {
            return condition.as_array().is_some_and(|branches| {
                branches.iter().any(|b| {
                    b.as_document()
                        .is_some_and(|sub| matches_filter(doc, sub))
                })
            });
        }
        matches_condition(lookup_path(doc, key), condition)
    })
}

fn cmp_bson(a: &Bson, b: &Bson) -> Ordering {
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
        (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
        (Bson::Int32(x), Bson::Int64(y)) => (*x as i64).cmp(y),
        (Bson::Int64(x), Bson::Int32(y)) => x.cmp(&(*y as i64)),
        (Bson::Double(x), Bson::Double(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn apply_update(doc: &mut Document, update: &Document) {
    if let Ok(set) = update.get_document("$set") {
        for (key, value) in set {
            doc.insert(key.clone(), value.clone());
        }
    }
    if let Ok(add) = update.get_document("$addToSet") {
        for (key, value) in add {
            match doc.get_mut(key) {
                Some(Bson::Array(arr)) => {
                    if !arr.contains(value) {
                        arr.push(value.clone());
                    }
                }
                _ => {
                    doc.insert(key.clone(), vec![value.clone()]);
                }
            }
        }
    }
}

impl DocumentStore for MemStore {
    async fn find_one(&self, filter: Document) -> Result<Option<Document>, StoreError> {
        let docs = self.docs.lock().unwrap();
        Ok(docs.iter().find(|d| matches_filter(d, &filter)).cloned())
    }

    async fn find_by_id(&self, id: &ObjectId) -> Result<Option<Document>, StoreError> {
        self.find_one(doc! { "_id": id }).await
    }

    async fn find_many(&self, filter: Document, sort: Document) -> Result<Vec<Document>, StoreError> {
        let docs = self.docs.lock().unwrap();
        let mut selected: Vec<Document> = docs
            .iter()
            .filter(|d| matches_filter(d, &filter))
            .cloned()
            .collect();

        let sort_entries: Vec<(&String, &Bson)> = sort.iter().collect();
        for (key, direction) in sort_entries.into_iter().rev() {
            let descending = matches!(direction, Bson::Int32(d) if *d < 0)
                || matches!(direction, Bson::Int64(d) if *d < 0);
            selected.sort_by(|a, b| {
                let ordering = match (lookup_path(a, key), lookup_path(b, key)) {
                    (Some(x), Some(y)) => cmp_bson(x, y),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        Ok(selected)
    }

    async fn insert(&self, mut doc: Document) -> Result<ObjectId, StoreError> {
        let id = match doc.get_object_id("_id") {
            Ok(id) => id,
            Err(_) => {
                let id = ObjectId::new();
                doc.insert("_id", id);
                id
            }
        };
        self.docs.lock().unwrap().push(doc);
        Ok(id)
    }

    async fn update_by_id(&self, id: &ObjectId, update: Document) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().unwrap();
        if let Some(doc) = docs
            .iter_mut()
            .find(|d| d.get_object_id("_id").map(|i| i == *id).unwrap_or(false))
        {
            apply_update(doc, &update);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_filter_matches_missing_field() {
        let store = MemStore::new();
        store.insert(doc! { "title": "a" }).await.unwrap();
        store
            .insert(doc! { "title": "b", "lending": { "borrower": ObjectId::new() } })
            .await
            .unwrap();

        let available = store
            .find_many(doc! { "lending.borrower": Bson::Null }, doc! {})
            .await
            .unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].get_str("title").unwrap(), "a");

        let lent = store
            .find_many(doc! { "lending.borrower": { "$ne": Bson::Null } }, doc! {})
            .await
            .unwrap();
        assert_eq!(lent.len(), 1);
        assert_eq!(lent[0].get_str("title").unwrap(), "b");
    }

    #[tokio::test]
    async fn range_filter_and_sort() {
        let store = MemStore::new();
        for (title, date) in [
            ("jan", "2024-01-10T00:00:00Z"),
            ("mar", "2024-03-10T00:00:00Z"),
            ("feb", "2024-02-10T00:00:00Z"),
        ] {
            store
                .insert(doc! { "title": title, "createdAt": date })
                .await
                .unwrap();
        }

        let found = store
            .find_many(
                doc! { "createdAt": { "$gte": "2024-02-01T00:00:00Z" } },
                doc! { "createdAt": -1 },
            )
            .await
            .unwrap();
        let titles: Vec<_> = found.iter().map(|d| d.get_str("title").unwrap()).collect();
        assert_eq!(titles, vec!["mar", "feb"]);
    }

    #[tokio::test]
    async fn add_to_set_is_idempotent() {
        let store = MemStore::new();
        let id = store.insert(doc! { "username": "p" }).await.unwrap();
        let student = ObjectId::new();

        let update = doc! { "$addToSet": { "students": student } };
        store.update_by_id(&id, update.clone()).await.unwrap();
        store.update_by_id(&id, update).await.unwrap();

        let doc = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(doc.get_array("students").unwrap().len(), 1);
    }
}
