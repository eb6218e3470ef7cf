//! Per-entity exporters and the full-system backup assembler. Each
//! exporter filters its collection, sanitizes every record and wraps the
//! result in a `{_metadata, <entityKey>}` envelope; `export_all` runs all
//! six concurrently and combines them into one backup document.

use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, Utc};
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::sanitize::{
    sanitize_book, sanitize_dashboard, sanitize_document_section, sanitize_event_signup,
    sanitize_notification, sanitize_student, sanitize_user, SanitizeOptions,
};
use crate::store::{Catalog, DocumentStore, StoreError};

pub const COMPLETE_BACKUP_TYPE: &str = "complete-system-backup";
pub const BACKUP_VERSION: &str = "1.0";

/// The stored form of a datetime. Routed through serde so filters compare
/// against exactly the representation the typed models persist.
pub(crate) fn stored_date(dt: DateTime<Utc>) -> String {
    match serde_json::to_value(dt) {
        Ok(Value::String(s)) => s,
        _ => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserExportFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StudentExportFilters {
    /// `YYYY-MM`; selects on enrollment start date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_month: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_month: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub include_dashboard: bool,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationExportFilters {
    /// `YYYY-MM-DD`; selects on creation date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookExportFilters {
    /// `available` or `lent`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventSignupExportFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllExportFilters {
    pub users: UserExportFilters,
    pub students: StudentExportFilters,
    pub notifications: NotificationExportFilters,
    pub documents: Map<String, Value>,
    pub books: BookExportFilters,
    pub event_signups: EventSignupExportFilters,
}

fn envelope(export_type: &str, entity_key: &str, records: Vec<Value>, filters: Value) -> Value {
    let mut out = Map::new();
    out.insert(
        "_metadata".to_string(),
        json!({
            "exportType": export_type,
            "exportTimestamp": timestamp(),
            "totalRecords": records.len(),
            "filters": filters,
        }),
    );
    out.insert(entity_key.to_string(), Value::Array(records));
    Value::Object(out)
}

fn metadata_insert(envelope: &mut Value, key: &str, value: Value) {
    if let Some(meta) = envelope.get_mut("_metadata").and_then(Value::as_object_mut) {
        meta.insert(key.to_string(), value);
    }
}

async fn username_index<S: DocumentStore>(
    users: &S,
) -> Result<HashMap<ObjectId, String>, StoreError> {
    let docs = users.find_many(doc! {}, doc! {}).await?;
    Ok(docs
        .iter()
        .filter_map(|d| {
            Some((
                d.get_object_id("_id").ok()?,
                d.get_str("username").ok()?.to_string(),
            ))
        })
        .collect())
}

pub async fn export_users<S: DocumentStore>(
    users: &S,
    filters: &UserExportFilters,
    options: SanitizeOptions,
) -> Result<Value, StoreError> {
    let mut query = doc! {};
    if let Some(role) = &filters.role {
        query.insert("role", role);
    }

    let docs = users.find_many(query, doc! { "createdAt": -1 }).await?;
    let records: Vec<Value> = docs.iter().map(|u| sanitize_user(u, options)).collect();

    let mut out = envelope(
        "users",
        "users",
        records,
        serde_json::to_value(filters).unwrap_or(Value::Null),
    );
    metadata_insert(&mut out, "preservePasswords", json!(options.preserve_passwords));
    Ok(out)
}

/// First day of the month at midnight UTC.
fn month_start(month: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(&format!("{}-01", month), "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Last day of the month at midnight UTC.
fn month_end(month: &str) -> Option<DateTime<Utc>> {
    let first = NaiveDate::parse_from_str(&format!("{}-01", month), "%Y-%m-%d").ok()?;
    let next_month = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)?
    };
    let last = next_month.pred_opt()?;
    Some(last.and_hms_opt(0, 0, 0)?.and_utc())
}

fn day_start(date: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn day_end(date: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some(date.and_hms_milli_opt(23, 59, 59, 999)?.and_utc())
}

pub async fn export_students<S: DocumentStore>(
    catalog: &Catalog<S>,
    filters: &StudentExportFilters,
) -> Result<Value, StoreError> {
    let mut query = doc! {};
    let mut enrollment = doc! {};
    if let Some(start) = filters.start_month.as_deref().and_then(month_start) {
        enrollment.insert("$gte", stored_date(start));
    }
    if let Some(end) = filters.end_month.as_deref().and_then(month_end) {
        enrollment.insert("$lte", stored_date(end));
    }
    if !enrollment.is_empty() {
        query.insert("enrollmentStartDate", enrollment);
    }
    if let Some(user_id) = filters.user_id.as_deref().and_then(|s| ObjectId::parse_str(s).ok()) {
        query.insert("userId", user_id);
    }

    let students = catalog
        .students
        .find_many(query, doc! { "enrollmentStartDate": -1, "createdAt": -1 })
        .await?;

    let usernames = username_index(&catalog.users).await?;

    let mut dashboards_by_student: HashMap<ObjectId, Document> = HashMap::new();
    if filters.include_dashboard {
        let ids: Vec<Bson> = students
            .iter()
            .filter_map(|s| s.get_object_id("_id").ok())
            .map(Bson::ObjectId)
            .collect();
        let dashboards = catalog
            .dashboards
            .find_many(doc! { "studentId": { "$in": ids } }, doc! {})
            .await?;
        for dashboard in dashboards {
            if let Ok(student_id) = dashboard.get_object_id("studentId") {
                dashboards_by_student.insert(student_id, dashboard);
            }
        }
    }

    let records: Vec<Value> = students
        .iter()
        .map(|student| {
            let parent_username = student
                .get_object_id("userId")
                .ok()
                .and_then(|id| usernames.get(&id))
                .map(String::as_str);
            let dashboard = student
                .get_object_id("_id")
                .ok()
                .and_then(|id| dashboards_by_student.get(&id))
                .map(sanitize_dashboard);
            sanitize_student(student, parent_username, dashboard)
        })
        .collect();

    let mut out = envelope(
        "students",
        "students",
        records,
        serde_json::to_value(filters).unwrap_or(Value::Null),
    );
    metadata_insert(&mut out, "includeDashboard", json!(filters.include_dashboard));
    Ok(out)
}

pub async fn export_users_with_students<S: DocumentStore>(
    catalog: &Catalog<S>,
    filters: &UserExportFilters,
    options: SanitizeOptions,
) -> Result<Value, StoreError> {
    let mut query = doc! {};
    if let Some(role) = &filters.role {
        query.insert("role", role);
    }

    let users = catalog.users.find_many(query, doc! { "createdAt": -1 }).await?;

    let mut data = vec![];
    let mut total_students = 0usize;
    for user in &users {
        let students = match user.get_object_id("_id") {
            Ok(id) => {
                catalog
                    .students
                    .find_many(doc! { "userId": id }, doc! {})
                    .await?
            }
            Err(_) => vec![],
        };
        total_students += students.len();
        data.push(json!({
            "user": sanitize_user(user, options),
            "students": students
                .iter()
                .map(|s| sanitize_student(s, None, None))
                .collect::<Vec<_>>(),
        }));
    }

    Ok(json!({
        "_metadata": {
            "exportType": "users-with-students",
            "exportTimestamp": timestamp(),
            "totalUsers": users.len(),
            "totalStudents": total_students,
            "filters": serde_json::to_value(filters).unwrap_or(Value::Null),
            "preservePasswords": options.preserve_passwords,
        },
        "data": data,
    }))
}

pub async fn export_notifications<S: DocumentStore>(
    notifications: &S,
    filters: &NotificationExportFilters,
) -> Result<Value, StoreError> {
    let mut query = doc! {};
    let mut created = doc! {};
    if let Some(start) = filters.start_date.as_deref().and_then(day_start) {
        created.insert("$gte", stored_date(start));
    }
    if let Some(end) = filters.end_date.as_deref().and_then(day_end) {
        created.insert("$lte", stored_date(end));
    }
    if !created.is_empty() {
        query.insert("createdAt", created);
    }
    if let Some(target_type) = &filters.target_type {
        query.insert("targetType", target_type);
    }

    let docs = notifications.find_many(query, doc! { "createdAt": -1 }).await?;
    let records: Vec<Value> = docs.iter().map(sanitize_notification).collect();

    Ok(envelope(
        "notifications",
        "notifications",
        records,
        serde_json::to_value(filters).unwrap_or(Value::Null),
    ))
}

pub async fn export_documents<S: DocumentStore>(documents: &S) -> Result<Value, StoreError> {
    let docs = documents.find_many(doc! {}, doc! { "createdAt": -1 }).await?;
    let records: Vec<Value> = docs.iter().map(sanitize_document_section).collect();

    Ok(envelope("documents", "documents", records, json!({})))
}

pub async fn export_books<S: DocumentStore>(
    catalog: &Catalog<S>,
    filters: &BookExportFilters,
) -> Result<Value, StoreError> {
    let mut query = doc! {};
    match filters.availability.as_deref() {
        Some("available") => {
            query.insert("lending.borrower", Bson::Null);
        }
        Some("lent") => {
            query.insert("lending.borrower", doc! { "$ne": Bson::Null });
        }
        _ => {}
    }

    let books = catalog.books.find_many(query, doc! { "title": 1 }).await?;
    let usernames = username_index(&catalog.users).await?;
    let records: Vec<Value> = books.iter().map(|b| sanitize_book(b, &usernames)).collect();

    Ok(envelope(
        "books",
        "books",
        records,
        serde_json::to_value(filters).unwrap_or(Value::Null),
    ))
}

pub async fn export_event_signups<S: DocumentStore>(
    catalog: &Catalog<S>,
    filters: &EventSignupExportFilters,
) -> Result<Value, StoreError> {
    let mut query = doc! {};
    let mut event_date = doc! {};
    if let Some(start) = filters.start_date.as_deref().and_then(day_start) {
        event_date.insert("$gte", stored_date(start));
    }
    if let Some(end) = filters.end_date.as_deref().and_then(day_end) {
        event_date.insert("$lte", stored_date(end));
    }
    if !event_date.is_empty() {
        query.insert("eventDate", event_date);
    }
    if let Some(active) = filters.is_active {
        query.insert("isActive", active);
    }

    let events = catalog
        .event_signups
        .find_many(query, doc! { "eventDate": -1 })
        .await?;
    let usernames = username_index(&catalog.users).await?;
    let records: Vec<Value> = events
        .iter()
        .map(|e| sanitize_event_signup(e, &usernames))
        .collect();

    Ok(envelope(
        "event-signups",
        "eventSignups",
        records,
        serde_json::to_value(filters).unwrap_or(Value::Null),
    ))
}

fn take_section(mut export: Value, entity_key: &str) -> (Value, Vec<Value>) {
    let records = export
        .get_mut(entity_key)
        .and_then(Value::as_array_mut)
        .map(std::mem::take)
        .unwrap_or_default();
    let metadata = export.get_mut("_metadata").map(Value::take).unwrap_or(Value::Null);
    (metadata, records)
}

/// Runs all six exporters concurrently and assembles the
/// `complete-system-backup` document. Passwords are preserved by default
/// here (a full backup is meant to restore working accounts); pass
/// `preserve_passwords: false` to strip them.
pub async fn export_all<S: DocumentStore>(
    catalog: &Catalog<S>,
    filters: &AllExportFilters,
    options: SanitizeOptions,
) -> Result<Value, StoreError> {
    let mut student_filters = filters.students.clone();
    student_filters.include_dashboard = true;

    let (users, students, notifications, documents, books, event_signups) = futures::join!(
        export_users(&catalog.users, &filters.users, options),
        export_students(catalog, &student_filters),
        export_notifications(&catalog.notifications, &filters.notifications),
        export_documents(&catalog.documents),
        export_books(catalog, &filters.books),
        export_event_signups(catalog, &filters.event_signups),
    );

    let (users_meta, users_data) = take_section(users?, "users");
    let (mut students_meta, students_data) = take_section(students?, "students");
    let (notifications_meta, notifications_data) = take_section(notifications?, "notifications");
    let (documents_meta, documents_data) = take_section(documents?, "documents");
    let (books_meta, books_data) = take_section(books?, "books");
    let (events_meta, events_data) = take_section(event_signups?, "eventSignups");

    if let Some(meta) = students_meta.as_object_mut() {
        meta.insert(
            "dashboardNote".to_string(),
            json!("Dashboard data included for complete backup"),
        );
    }

    let password_note = if options.preserve_passwords {
        "WARNING: User password hashes are included for login functionality - store securely!"
    } else {
        "User password hashes excluded - users will need password reset after import"
    };

    Ok(json!({
        "_metadata": {
            "exportType": COMPLETE_BACKUP_TYPE,
            "exportTimestamp": timestamp(),
            "version": BACKUP_VERSION,
            "systemInfo": {
                "totalUsers": users_data.len(),
                "totalStudents": students_data.len(),
                "totalNotifications": notifications_data.len(),
                "totalDocumentSections": documents_data.len(),
                "totalBooks": books_data.len(),
                "totalEventSignups": events_data.len(),
            },
            "filters": serde_json::to_value(filters).unwrap_or(Value::Null),
            "options": { "preservePasswords": options.preserve_passwords },
            "sections": ["users", "students", "notifications", "documents", "books", "eventSignups"],
            "notes": {
                "students": "Includes dashboard data (portfolios, documents, history)",
                "files": crate::sanitize::FILE_NOTE,
                "import": "Import users first, then students, then other data types",
                "passwords": password_note,
            },
        },
        "users": { "metadata": users_meta, "data": users_data },
        "students": { "metadata": students_meta, "data": students_data },
        "notifications": { "metadata": notifications_meta, "data": notifications_data },
        "documents": { "metadata": documents_meta, "data": documents_data },
        "books": { "metadata": books_meta, "data": books_data },
        "eventSignups": { "metadata": events_meta, "data": events_data },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn seeded_catalog() -> Catalog<MemStore> {
        Catalog::memory()
    }

    #[tokio::test]
    async fn book_export_filters_availability() {
        let catalog = seeded_catalog();
        let borrower = ObjectId::new();
        catalog
            .users
            .insert(doc! { "_id": borrower, "username": "parent2", "email": "p2@example.com" })
            .await
            .unwrap();
        catalog
            .books
            .insert(doc! { "title": "Matilda", "author": "Roald Dahl", "lending": { "borrower": Bson::Null } })
            .await
            .unwrap();
        catalog
            .books
            .insert(doc! { "title": "The BFG", "author": "Roald Dahl", "lending": { "borrower": borrower } })
            .await
            .unwrap();

        let lent = export_books(
            &catalog,
            &BookExportFilters { availability: Some("lent".to_string()) },
        )
        .await
        .unwrap();
        assert_eq!(lent["_metadata"]["totalRecords"], 1);
        assert_eq!(lent["books"][0]["title"], "The BFG");
        assert_eq!(lent["books"][0]["lentToUsername"], "parent2");

        let available = export_books(
            &catalog,
            &BookExportFilters { availability: Some("available".to_string()) },
        )
        .await
        .unwrap();
        assert_eq!(available["books"][0]["title"], "Matilda");
    }

    #[tokio::test]
    async fn student_export_inlines_dashboards_when_asked() {
        let catalog = seeded_catalog();
        let parent = ObjectId::new();
        let student = ObjectId::new();
        catalog
            .users
            .insert(doc! { "_id": parent, "username": "parent1", "email": "p1@example.com" })
            .await
            .unwrap();
        catalog
            .students
            .insert(doc! { "_id": student, "userId": parent, "firstName": "Ana", "lastName": "Silva" })
            .await
            .unwrap();
        catalog
            .dashboards
            .insert(doc! {
                "studentId": student,
                "history": [ { "type": "enrollment_start", "date": "2023-09-01T00:00:00Z" } ],
            })
            .await
            .unwrap();

        let filters = StudentExportFilters { include_dashboard: true, ..Default::default() };
        let out = export_students(&catalog, &filters).await.unwrap();

        assert_eq!(out["students"][0]["parentUsername"], "parent1");
        assert_eq!(out["students"][0]["dashboard"]["history"][0]["type"], "enrollment_start");

        let without = export_students(&catalog, &StudentExportFilters::default())
            .await
            .unwrap();
        assert!(without["students"][0].get("dashboard").is_none());
    }

    #[tokio::test]
    async fn full_export_has_all_sections_and_counts() {
        let catalog = seeded_catalog();
        catalog
            .users
            .insert(doc! { "username": "admin", "email": "a@example.com", "passwordHash": "$2b$10$x" })
            .await
            .unwrap();
        catalog
            .notifications
            .insert(doc! { "title": "Welcome", "message": "Term starts Monday", "targetType": "public" })
            .await
            .unwrap();

        let backup = export_all(&catalog, &AllExportFilters::default(), SanitizeOptions { preserve_passwords: true })
            .await
            .unwrap();

        assert_eq!(backup["_metadata"]["exportType"], COMPLETE_BACKUP_TYPE);
        assert_eq!(backup["_metadata"]["systemInfo"]["totalUsers"], 1);
        assert_eq!(backup["_metadata"]["systemInfo"]["totalNotifications"], 1);
        for section in ["users", "students", "notifications", "documents", "books", "eventSignups"] {
            assert!(backup[section]["data"].is_array(), "missing section {}", section);
        }
        // Passwords ride along when explicitly preserved.
        assert_eq!(backup["users"]["data"][0]["passwordHash"], "$2b$10$x");
    }

    #[test]
    fn month_bounds() {
        assert_eq!(stored_date(month_start("2024-02").unwrap()), "2024-02-01T00:00:00Z");
        assert_eq!(stored_date(month_end("2024-02").unwrap()), "2024-02-29T00:00:00Z");
        assert_eq!(stored_date(month_end("2023-12").unwrap()), "2023-12-31T00:00:00Z");
    }
}
