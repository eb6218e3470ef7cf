//! Full-system restore: walks a `complete-system-backup` document in
//! dependency order (users first, then students with their dashboards,
//! then the independent entity groups), applying duplicate detection and
//! the merge engine per record. Records are processed strictly one at a
//! time so duplicate checks see the effects of earlier records in the same
//! batch. A single bad record never aborts the batch; only a malformed
//! envelope rejects the whole import, before any write happens.

use log::{info, warn};
use mongodb::bson::{doc, from_document, oid::ObjectId, to_document, Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::export::{stored_date, COMPLETE_BACKUP_TYPE};
use crate::media::{validate_file_url, FileStatus, MediaHost};
use crate::merge::{
    apply_merge, find_book_duplicates, find_document_duplicates, find_event_signup_duplicates,
    find_notification_duplicates, find_student_duplicates, find_user_duplicates, merge_entity,
    DuplicateHandling, MergeStrategy, DASHBOARD_PROFILE, GENERIC_PROFILE, STUDENT_PROFILE,
    USER_PROFILE,
};
use crate::models::{Book, Dashboard, DocumentSection, EventSignup, Notification, Student, User};
use crate::store::{Catalog, DocumentStore, StoreError};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid backup format - not a complete system backup")]
    InvalidEnvelope,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-entity duplicate handling for the full-system path. Only `skip` and
/// `merge` are implemented here; the single-entity endpoints additionally
/// offer `replace` and `interactive`. Anything else downgrades to `skip`.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportOptions {
    pub user_duplicate_handling: DuplicateHandling,
    pub student_duplicate_handling: DuplicateHandling,
    pub notification_duplicate_handling: DuplicateHandling,
    pub document_duplicate_handling: DuplicateHandling,
    pub book_duplicate_handling: DuplicateHandling,
    pub event_signup_duplicate_handling: DuplicateHandling,
}

fn effective(handling: DuplicateHandling) -> DuplicateHandling {
    match handling {
        DuplicateHandling::Skip | DuplicateHandling::Merge => handling,
        other => {
            warn!(
                "{:?} duplicate handling is not supported by the full-system import; using skip",
                other
            );
            DuplicateHandling::Skip
        }
    }
}

// ---------------------------------------------------------------------------
// Result shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signups_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signups_added: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub label: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSkip {
    pub label: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMerge {
    pub label: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<usize>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InvalidFileNote {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExternalFileNote {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
}

/// Non-fatal file findings attached to the owning record's result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWarning {
    pub label: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid_files: Vec<InvalidFileNote>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_files: Vec<ExternalFileNote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReport {
    pub success: Vec<RecordOutcome>,
    pub errors: Vec<RecordError>,
    pub duplicates: Vec<RecordSkip>,
    pub merged: Vec<RecordMerge>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<FileWarning>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySummary {
    pub total: usize,
    pub created: usize,
    pub merged: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub users: EntitySummary,
    pub students: EntitySummary,
    pub notifications: EntitySummary,
    pub documents: EntitySummary,
    pub books: EntitySummary,
    pub event_signups: EntitySummary,
    pub total_processed: usize,
    pub total_created: usize,
    pub total_merged: usize,
    pub total_skipped: usize,
    pub total_errors: usize,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub users: EntityReport,
    pub students: EntityReport,
    pub notifications: EntityReport,
    pub documents: EntityReport,
    pub books: EntityReport,
    pub event_signups: EntityReport,
    pub summary: ImportSummary,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "_metadata")]
    metadata: Option<EnvelopeMetadata>,
    users: Option<Section>,
    students: Option<Section>,
    notifications: Option<Section>,
    documents: Option<Section>,
    books: Option<Section>,
    #[serde(rename = "eventSignups")]
    event_signups: Option<Section>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeMetadata {
    #[serde(rename = "exportType")]
    export_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Section {
    #[serde(default)]
    data: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Record helpers
// ---------------------------------------------------------------------------

fn record_doc(value: &Value) -> Result<Document, String> {
    mongodb::bson::to_bson(value)
        .ok()
        .and_then(|b| b.as_document().cloned())
        .ok_or_else(|| "Invalid record structure".to_string())
}

fn strip_portable_keys(doc: &mut Document) {
    for key in ["id", "_fileNote", "_attachmentNote", "attachmentMetadata"] {
        doc.remove(key);
    }
}

pub(crate) fn parse_portable_date(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&chrono::Utc));
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}

/// Re-serializes date strings into the stored canonical form so natural-key
/// filters and typed deserialization line up. Unparseable values are left
/// alone and surface later as a per-record error.
fn normalize_date_fields(doc: &mut Document, fields: &[&str]) {
    for field in fields {
        let parsed = match doc.get_str(*field) {
            Ok(raw) => parse_portable_date(raw),
            Err(_) => None,
        };
        if let Some(parsed) = parsed {
            doc.insert(*field, stored_date(parsed));
        }
    }
}

fn doc_oid(doc: &Document, field: &str) -> Option<ObjectId> {
    match doc.get(field) {
        Some(Bson::ObjectId(id)) => Some(*id),
        Some(Bson::String(s)) => ObjectId::parse_str(s).ok(),
        _ => None,
    }
}

fn non_empty<'a>(doc: &'a Document, field: &str) -> Option<&'a str> {
    match doc.get_str(field) {
        Ok(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

async fn resolve_user<S: DocumentStore>(
    users: &S,
    username: Option<&str>,
    id: Option<ObjectId>,
) -> Result<Option<Document>, StoreError> {
    if let Some(username) = username {
        if let Some(user) = users.find_one(doc! { "username": username }).await? {
            return Ok(Some(user));
        }
    }
    if let Some(id) = id {
        return users.find_by_id(&id).await;
    }
    Ok(None)
}

enum Disposition {
    Created { id: ObjectId, signups: Option<usize> },
    Merged { id: ObjectId, changes: Option<usize> },
    MergedSignups { id: ObjectId, added: usize },
    Duplicate { message: String },
}

fn record_disposition(report: &mut EntityReport, label: &str, disposition: Disposition) {
    match disposition {
        Disposition::Created { id, signups } => report.success.push(RecordOutcome {
            label: label.to_string(),
            id: Some(id.to_hex()),
            signups_count: signups,
            signups_added: None,
        }),
        Disposition::Merged { id, changes } => report.merged.push(RecordMerge {
            label: label.to_string(),
            id: id.to_hex(),
            changes,
        }),
        Disposition::MergedSignups { id, added } => report.success.push(RecordOutcome {
            label: label.to_string(),
            id: Some(id.to_hex()),
            signups_count: None,
            signups_added: Some(added),
        }),
        Disposition::Duplicate { message } => report.duplicates.push(RecordSkip {
            label: label.to_string(),
            message,
        }),
    }
}

fn err<E: std::fmt::Display>(e: E) -> String {
    e.to_string()
}

// ---------------------------------------------------------------------------
// File validation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FileValidationReport {
    pub invalid: Vec<InvalidFileNote>,
    pub external: Vec<ExternalFileNote>,
    pub errors: Vec<String>,
}

impl FileValidationReport {
    fn is_clean(&self) -> bool {
        self.invalid.is_empty() && self.external.is_empty() && self.errors.is_empty()
    }

    fn into_warning(self, label: &str) -> Option<FileWarning> {
        if self.is_clean() {
            return None;
        }
        Some(FileWarning {
            label: label.to_string(),
            invalid_files: self.invalid,
            external_files: self.external,
            validation_error: self.errors.into_iter().next(),
        })
    }
}

fn str_of(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn first_url(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| str_of(value, k))
}

async fn check_file<M: MediaHost>(
    media: &M,
    report: &mut FileValidationReport,
    kind: &str,
    url: &str,
    file_name: Option<String>,
    name: Option<String>,
) {
    match validate_file_url(media, url).await {
        FileStatus::Valid { external: false } => {}
        FileStatus::Valid { external: true } => report.external.push(ExternalFileNote {
            kind: kind.to_string(),
            file_name,
            name,
            message: "External URL - validation skipped".to_string(),
        }),
        FileStatus::Invalid { error, suggestion } => report.invalid.push(InvalidFileNote {
            kind: kind.to_string(),
            file_name,
            name,
            error,
            suggestion,
        }),
    }
}

pub async fn validate_dashboard_files<M: MediaHost>(
    media: &M,
    dashboard: &Value,
) -> FileValidationReport {
    let mut report = FileValidationReport::default();

    for portfolio in dashboard
        .get("portfolios")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(url) = first_url(portfolio, &["portfolioUrl", "pdfUrl"]) {
            let file_name = str_of(portfolio, "fileName");
            check_file(media, &mut report, "portfolio", &url, file_name, None).await;
        }
    }

    for document in dashboard
        .get("documents")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(url) = first_url(document, &["documentUrl", "url"]) {
            let file_name = str_of(document, "fileName");
            let name = str_of(document, "name");
            check_file(media, &mut report, "document", &url, file_name, name).await;
        }
    }

    for event in dashboard
        .get("history")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(url) = first_url(event, &["receiptUrl", "downloadUrl"]) {
            let file_name = str_of(event, "fileName");
            check_file(media, &mut report, "receipt", &url, file_name, None).await;
        }
    }

    report
}

pub async fn validate_notification_files<M: MediaHost>(
    media: &M,
    notification: &Value,
) -> FileValidationReport {
    let mut report = FileValidationReport::default();
    if let Some(url) = str_of(notification, "attachmentUrl") {
        let file_name = str_of(notification, "attachmentFileName");
        check_file(media, &mut report, "notification-attachment", &url, file_name, None).await;
    }
    report
}

pub async fn validate_document_files<M: MediaHost>(
    media: &M,
    section: &Value,
) -> FileValidationReport {
    let mut report = FileValidationReport::default();
    for entry in section
        .get("documents")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(url) = first_url(entry, &["documentUrl", "fileUrl"]) {
            let file_name = str_of(entry, "fileName");
            let name = str_of(entry, "name");
            check_file(media, &mut report, "document", &url, file_name, name).await;
        }
    }
    report
}

// ---------------------------------------------------------------------------
// Per-entity record processing
// ---------------------------------------------------------------------------

async fn import_user_record<S: DocumentStore>(
    users: &S,
    record: &Value,
    handling: DuplicateHandling,
) -> Result<Disposition, String> {
    let mut incoming = record_doc(record)?;
    strip_portable_keys(&mut incoming);
    // Back-reference lists are rebuilt by the student phase; ids from a
    // foreign database would dangle.
    incoming.remove("students");
    incoming.remove("books");
    normalize_date_fields(&mut incoming, &["createdAt", "lockUntil"]);

    let duplicates = find_user_duplicates(users, &incoming).await.map_err(err)?;
    if let Some(duplicate) = duplicates.first() {
        if handling == DuplicateHandling::Skip {
            return Ok(Disposition::Duplicate {
                message: "Skipped - duplicate found".to_string(),
            });
        }
        let existing = &duplicate.existing;
        let id = existing.get_object_id("_id").map_err(err)?;
        let merged = merge_entity(existing, &incoming, MergeStrategy::Merge, &USER_PROFILE);
        let outcome = apply_merge(existing, merged);
        let validated: User = from_document(outcome.merged).map_err(err)?;
        let mut patch = to_document(&validated).map_err(err)?;
        patch.remove("_id");
        users.update_by_id(&id, doc! { "$set": patch }).await.map_err(err)?;
        return Ok(Disposition::Merged {
            id,
            changes: Some(outcome.changes.len()),
        });
    }

    if !incoming.contains_key("createdAt") {
        incoming.insert("createdAt", stored_date(chrono::Utc::now()));
    }
    let validated: User = from_document(incoming).map_err(err)?;
    let id = users
        .insert(to_document(&validated).map_err(err)?)
        .await
        .map_err(err)?;
    Ok(Disposition::Created { id, signups: None })
}

/// Rebuilds a storage-shaped dashboard document from its portable form
/// (the sanitizer's inverse mapping).
fn dashboard_from_portable(portable: &Value, student_id: ObjectId) -> Result<Document, String> {
    let mut mapped = doc! { "studentId": student_id };

    if let Some(portfolios) = portable.get("portfolios").and_then(Value::as_array) {
        let entries: Vec<Bson> = portfolios
            .iter()
            .map(|p| {
                let mut entry = doc! {};
                if let Some(url) = first_url(p, &["portfolioUrl", "pdfUrl"]) {
                    entry.insert("pdfUrl", url);
                }
                copy_json_fields(p, &mut entry, &["fileName", "mediaPublicId", "uploadDate"]);
                normalize_date_fields(&mut entry, &["uploadDate"]);
                Bson::Document(entry)
            })
            .collect();
        mapped.insert("portfolios", entries);
    }

    if let Some(documents) = portable.get("documents").and_then(Value::as_array) {
        let entries: Vec<Bson> = documents
            .iter()
            .map(|d| {
                let mut entry = doc! {};
                if let Some(url) = first_url(d, &["documentUrl", "url"]) {
                    entry.insert("url", url);
                }
                copy_json_fields(d, &mut entry, &["name", "fileName", "mediaPublicId", "uploadDate"]);
                normalize_date_fields(&mut entry, &["uploadDate"]);
                Bson::Document(entry)
            })
            .collect();
        mapped.insert("documents", entries);
    }

    if let Some(history) = portable.get("history").and_then(Value::as_array) {
        let entries: Vec<Bson> = history
            .iter()
            .map(|event| {
                let mut entry = doc! {};
                if let Some(url) = first_url(event, &["receiptUrl", "downloadUrl"]) {
                    entry.insert("downloadUrl", url);
                }
                copy_json_fields(
                    event,
                    &mut entry,
                    &[
                        "type",
                        "date",
                        "month",
                        "year",
                        "donorName",
                        "donationAmount",
                        "paymentStatus",
                        "fileName",
                        "mediaPublicId",
                        "description",
                    ],
                );
                normalize_date_fields(&mut entry, &["date"]);
                Bson::Document(entry)
            })
            .collect();
        mapped.insert("history", entries);
    }

    Ok(mapped)
}

fn copy_json_fields(source: &Value, target: &mut Document, fields: &[&str]) {
    for field in fields {
        if let Some(value) = source.get(*field) {
            if value.is_null() {
                continue;
            }
            if let Ok(bson) = mongodb::bson::to_bson(value) {
                target.insert(*field, bson);
            }
        }
    }
}

async fn upsert_dashboard<S: DocumentStore>(
    dashboards: &S,
    student_id: ObjectId,
    portable: &Value,
) -> Result<(), String> {
    let mapped = dashboard_from_portable(portable, student_id)?;

    match dashboards
        .find_one(doc! { "studentId": student_id })
        .await
        .map_err(err)?
    {
        Some(existing) => {
            let merged = merge_entity(&existing, &mapped, MergeStrategy::Merge, &DASHBOARD_PROFILE);
            let validated: Dashboard = from_document(merged).map_err(err)?;
            let mut patch = to_document(&validated).map_err(err)?;
            patch.remove("_id");
            let id = existing.get_object_id("_id").map_err(err)?;
            dashboards
                .update_by_id(&id, doc! { "$set": patch })
                .await
                .map_err(err)?;
        }
        None => {
            let mut fresh = mapped;
            fresh.insert("createdAt", stored_date(chrono::Utc::now()));
            let validated: Dashboard = from_document(fresh).map_err(err)?;
            dashboards
                .insert(to_document(&validated).map_err(err)?)
                .await
                .map_err(err)?;
        }
    }
    Ok(())
}

async fn import_student_record<S: DocumentStore, M: MediaHost>(
    catalog: &Catalog<S>,
    media: &M,
    record: &Value,
    handling: DuplicateHandling,
    label: &str,
    report: &mut EntityReport,
) -> Result<Disposition, String> {
    let mut incoming = record_doc(record)?;
    strip_portable_keys(&mut incoming);
    incoming.remove("dashboard");
    // Wishlist entries reference book ids from the source system.
    incoming.remove("wishlist");
    normalize_date_fields(
        &mut incoming,
        &["dateOfBirth", "enrollmentStartDate", "enrollmentEndDate", "createdAt"],
    );

    let dashboard = record.get("dashboard").filter(|d| !d.is_null()).cloned();

    if let Some(dashboard) = &dashboard {
        let validation = validate_dashboard_files(media, dashboard).await;
        if let Some(warning) = validation.into_warning(label) {
            report.warnings.push(warning);
        }
    }

    // Re-resolve the parent reference against this database; the exported
    // user id is only meaningful on the system the backup came from.
    let parent_username = non_empty(&incoming, "parentUsername").map(str::to_string);
    let parent_id = doc_oid(&incoming, "userId");
    let parent = resolve_user(&catalog.users, parent_username.as_deref(), parent_id)
        .await
        .map_err(err)?;
    let Some(parent) = parent else {
        return Err(match &parent_username {
            Some(username) => format!("Parent user '{}' not found", username),
            None => "Parent user not found".to_string(),
        });
    };
    let parent_oid = parent.get_object_id("_id").map_err(err)?;
    incoming.remove("parentUsername");
    incoming.insert("userId", parent_oid);

    let duplicates = find_student_duplicates(&catalog.students, &incoming)
        .await
        .map_err(err)?;
    if let Some(duplicate) = duplicates.first() {
        if handling == DuplicateHandling::Skip {
            return Ok(Disposition::Duplicate {
                message: "Skipped - duplicate found".to_string(),
            });
        }
        let existing = &duplicate.existing;
        let id = existing.get_object_id("_id").map_err(err)?;
        let merged = merge_entity(existing, &incoming, MergeStrategy::Merge, &STUDENT_PROFILE);
        let outcome = apply_merge(existing, merged);
        let validated: Student = from_document(outcome.merged).map_err(err)?;
        let mut patch = to_document(&validated).map_err(err)?;
        patch.remove("_id");
        catalog
            .students
            .update_by_id(&id, doc! { "$set": patch })
            .await
            .map_err(err)?;

        if let Some(dashboard) = &dashboard {
            upsert_dashboard(&catalog.dashboards, id, dashboard).await?;
        }
        return Ok(Disposition::Merged {
            id,
            changes: Some(outcome.changes.len()),
        });
    }

    if !incoming.contains_key("createdAt") {
        incoming.insert("createdAt", stored_date(chrono::Utc::now()));
    }
    let validated: Student = from_document(incoming).map_err(err)?;
    let id = catalog
        .students
        .insert(to_document(&validated).map_err(err)?)
        .await
        .map_err(err)?;

    if let Some(dashboard) = &dashboard {
        upsert_dashboard(&catalog.dashboards, id, dashboard).await?;
    }

    catalog
        .users
        .update_by_id(&parent_oid, doc! { "$addToSet": { "students": id } })
        .await
        .map_err(err)?;

    Ok(Disposition::Created { id, signups: None })
}

async fn import_notification_record<S: DocumentStore, M: MediaHost>(
    catalog: &Catalog<S>,
    media: &M,
    record: &Value,
    handling: DuplicateHandling,
    label: &str,
    report: &mut EntityReport,
) -> Result<Disposition, String> {
    if record.get("attachmentUrl").and_then(Value::as_str).is_some() {
        let validation = validate_notification_files(media, record).await;
        if let Some(warning) = validation.into_warning(label) {
            report.warnings.push(warning);
        }
    }

    let mut incoming = record_doc(record)?;
    strip_portable_keys(&mut incoming);
    normalize_date_fields(&mut incoming, &["createdAt"]);

    // Creator and target students are re-resolved; unknown references are
    // dropped rather than imported dangling.
    match doc_oid(&incoming, "createdBy") {
        Some(creator) if catalog.users.find_by_id(&creator).await.map_err(err)?.is_some() => {
            incoming.insert("createdBy", creator);
        }
        _ => {
            incoming.remove("createdBy");
        }
    }

    if let Some(Bson::Array(targets)) = incoming.get("targetStudents").cloned() {
        let mut resolved = vec![];
        for target in targets {
            let oid = match target {
                Bson::ObjectId(id) => Some(id),
                Bson::String(s) => ObjectId::parse_str(&s).ok(),
                _ => None,
            };
            if let Some(oid) = oid {
                if catalog.students.find_by_id(&oid).await.map_err(err)?.is_some() {
                    resolved.push(Bson::ObjectId(oid));
                }
            }
        }
        incoming.insert("targetStudents", resolved);
    }

    let duplicates = find_notification_duplicates(&catalog.notifications, &incoming)
        .await
        .map_err(err)?;
    if let Some(duplicate) = duplicates.first() {
        if handling == DuplicateHandling::Skip {
            return Ok(Disposition::Duplicate {
                message: "Skipped - duplicate found".to_string(),
            });
        }
        let existing = &duplicate.existing;
        let id = existing.get_object_id("_id").map_err(err)?;
        let merged = merge_entity(existing, &incoming, MergeStrategy::Merge, &GENERIC_PROFILE);
        let outcome = apply_merge(existing, merged);
        let validated: Notification = from_document(outcome.merged).map_err(err)?;
        let mut patch = to_document(&validated).map_err(err)?;
        patch.remove("_id");
        catalog
            .notifications
            .update_by_id(&id, doc! { "$set": patch })
            .await
            .map_err(err)?;
        return Ok(Disposition::Merged { id, changes: Some(outcome.changes.len()) });
    }

    if !incoming.contains_key("createdAt") {
        incoming.insert("createdAt", stored_date(chrono::Utc::now()));
    }
    let validated: Notification = from_document(incoming).map_err(err)?;
    let id = catalog
        .notifications
        .insert(to_document(&validated).map_err(err)?)
        .await
        .map_err(err)?;
    Ok(Disposition::Created { id, signups: None })
}

async fn import_document_record<S: DocumentStore, M: MediaHost>(
    catalog: &Catalog<S>,
    media: &M,
    record: &Value,
    handling: DuplicateHandling,
    label: &str,
    report: &mut EntityReport,
) -> Result<Disposition, String> {
    if record.get("documents").and_then(Value::as_array).is_some() {
        let validation = validate_document_files(media, record).await;
        if let Some(warning) = validation.into_warning(label) {
            report.warnings.push(warning);
        }
    }

    let mut incoming = record_doc(record)?;
    strip_portable_keys(&mut incoming);
    normalize_date_fields(&mut incoming, &["createdAt"]);

    match doc_oid(&incoming, "createdBy") {
        Some(creator) if catalog.users.find_by_id(&creator).await.map_err(err)?.is_some() => {
            incoming.insert("createdBy", creator);
        }
        _ => {
            incoming.remove("createdBy");
        }
    }

    if let Some(entries) = record.get("documents").and_then(Value::as_array) {
        let mut mapped = vec![];
        for entry in entries {
            let mut out = doc! {};
            if let Some(url) = first_url(entry, &["fileUrl", "documentUrl"]) {
                out.insert("fileUrl", url);
            }
            copy_json_fields(
                entry,
                &mut out,
                &["name", "fileName", "fileType", "mediaPublicId", "uploadDate"],
            );
            normalize_date_fields(&mut out, &["uploadDate"]);
            if let Some(uploader) = entry
                .get("uploadedBy")
                .and_then(Value::as_str)
                .and_then(|s| ObjectId::parse_str(s).ok())
            {
                if catalog.users.find_by_id(&uploader).await.map_err(err)?.is_some() {
                    out.insert("uploadedBy", uploader);
                }
            }
            mapped.push(Bson::Document(out));
        }
        incoming.insert("documents", mapped);
    }

    let duplicates = find_document_duplicates(&catalog.documents, &incoming)
        .await
        .map_err(err)?;
    if let Some(duplicate) = duplicates.first() {
        if handling == DuplicateHandling::Skip {
            return Ok(Disposition::Duplicate {
                message: "Skipped - duplicate section found".to_string(),
            });
        }
        let existing = &duplicate.existing;
        let id = existing.get_object_id("_id").map_err(err)?;
        let merged = merge_entity(existing, &incoming, MergeStrategy::Merge, &GENERIC_PROFILE);
        let outcome = apply_merge(existing, merged);
        let validated: DocumentSection = from_document(outcome.merged).map_err(err)?;
        let mut patch = to_document(&validated).map_err(err)?;
        patch.remove("_id");
        catalog
            .documents
            .update_by_id(&id, doc! { "$set": patch })
            .await
            .map_err(err)?;
        return Ok(Disposition::Merged { id, changes: Some(outcome.changes.len()) });
    }

    if !incoming.contains_key("createdAt") {
        incoming.insert("createdAt", stored_date(chrono::Utc::now()));
    }
    let validated: DocumentSection = from_document(incoming).map_err(err)?;
    let id = catalog
        .documents
        .insert(to_document(&validated).map_err(err)?)
        .await
        .map_err(err)?;
    Ok(Disposition::Created { id, signups: None })
}

async fn import_book_record<S: DocumentStore>(
    catalog: &Catalog<S>,
    record: &Value,
    handling: DuplicateHandling,
) -> Result<Disposition, String> {
    let mut incoming = record_doc(record)?;
    strip_portable_keys(&mut incoming);
    normalize_date_fields(&mut incoming, &["createdAt"]);

    match doc_oid(&incoming, "user") {
        Some(owner) if catalog.users.find_by_id(&owner).await.map_err(err)?.is_some() => {
            incoming.insert("user", owner);
        }
        _ => {
            incoming.remove("user");
        }
    }

    // Current borrower: alias first, exported id second; an unresolvable
    // borrower leaves the book on the shelf.
    let mut lending = incoming
        .get_document("lending")
        .cloned()
        .unwrap_or_default();
    normalize_date_fields(&mut lending, &["lentDate", "dueDate"]);
    let borrower_username = non_empty(&incoming, "lentToUsername").map(str::to_string);
    let borrower_id = doc_oid(&incoming, "lentTo");
    incoming.remove("lentToUsername");
    incoming.remove("lentTo");
    match resolve_user(&catalog.users, borrower_username.as_deref(), borrower_id)
        .await
        .map_err(err)?
    {
        Some(user) => {
            lending.insert("borrower", user.get_object_id("_id").map_err(err)?);
        }
        None => {
            lending.remove("borrower");
            if borrower_username.is_some() || borrower_id.is_some() {
                lending.remove("lentDate");
            }
        }
    }
    if !lending.is_empty() {
        incoming.insert("lending", lending);
    } else {
        incoming.remove("lending");
    }

    if let Some(entries) = record.get("lendingHistory").and_then(Value::as_array) {
        let mut history = vec![];
        for entry in entries {
            let username = str_of(entry, "username");
            let entry_id = str_of(entry, "user").and_then(|s| ObjectId::parse_str(&s).ok());
            let Some(user) = resolve_user(&catalog.users, username.as_deref(), entry_id)
                .await
                .map_err(err)?
            else {
                continue;
            };
            let mut out = doc! { "user": user.get_object_id("_id").map_err(err)? };
            copy_json_fields(entry, &mut out, &["lentDate", "returnedDate"]);
            normalize_date_fields(&mut out, &["lentDate", "returnedDate"]);
            history.push(Bson::Document(out));
        }
        incoming.insert("lendingHistory", history);
    }

    let duplicates = find_book_duplicates(&catalog.books, &incoming)
        .await
        .map_err(err)?;
    if let Some(duplicate) = duplicates.first() {
        if handling == DuplicateHandling::Skip {
            return Ok(Disposition::Duplicate {
                message: "Skipped - duplicate book found".to_string(),
            });
        }
        let existing = &duplicate.existing;
        let id = existing.get_object_id("_id").map_err(err)?;
        let merged = merge_entity(existing, &incoming, MergeStrategy::Merge, &GENERIC_PROFILE);
        let outcome = apply_merge(existing, merged);
        let validated: Book = from_document(outcome.merged).map_err(err)?;
        let mut patch = to_document(&validated).map_err(err)?;
        patch.remove("_id");
        catalog
            .books
            .update_by_id(&id, doc! { "$set": patch })
            .await
            .map_err(err)?;
        return Ok(Disposition::Merged { id, changes: Some(outcome.changes.len()) });
    }

    if !incoming.contains_key("createdAt") {
        incoming.insert("createdAt", stored_date(chrono::Utc::now()));
    }
    let validated: Book = from_document(incoming).map_err(err)?;
    let id = catalog
        .books
        .insert(to_document(&validated).map_err(err)?)
        .await
        .map_err(err)?;
    Ok(Disposition::Created { id, signups: None })
}

async fn import_event_record<S: DocumentStore>(
    catalog: &Catalog<S>,
    record: &Value,
    handling: DuplicateHandling,
) -> Result<Disposition, String> {
    let mut incoming = record_doc(record)?;
    strip_portable_keys(&mut incoming);
    normalize_date_fields(&mut incoming, &["eventDate", "createdAt", "updatedAt"]);

    let creator_username = non_empty(&incoming, "createdByUsername").map(str::to_string);
    let creator_id = doc_oid(&incoming, "createdBy");
    incoming.remove("createdByUsername");
    match resolve_user(&catalog.users, creator_username.as_deref(), creator_id)
        .await
        .map_err(err)?
    {
        Some(user) => {
            incoming.insert("createdBy", user.get_object_id("_id").map_err(err)?);
        }
        None => {
            incoming.remove("createdBy");
        }
    }

    // Signups survive only when their user resolves here; the display name
    // is refreshed from the live account.
    let mut signups = vec![];
    if let Some(entries) = record.get("signups").and_then(Value::as_array) {
        for entry in entries {
            let username = str_of(entry, "userUsername");
            let entry_id = str_of(entry, "userId").and_then(|s| ObjectId::parse_str(&s).ok());
            let Some(user) = resolve_user(&catalog.users, username.as_deref(), entry_id)
                .await
                .map_err(err)?
            else {
                continue;
            };
            let user_oid = user.get_object_id("_id").map_err(err)?;
            let user_name = user
                .get_str("name")
                .ok()
                .filter(|n| !n.is_empty())
                .or_else(|| user.get_str("username").ok())
                .unwrap_or_default()
                .to_string();
            let mut out = doc! { "userId": user_oid, "userName": user_name };
            copy_json_fields(entry, &mut out, &["responsibility", "notes", "createdAt", "updatedAt"]);
            normalize_date_fields(&mut out, &["createdAt", "updatedAt"]);
            signups.push(Bson::Document(out));
        }
    }
    incoming.insert("signups", signups.clone());

    let duplicates = find_event_signup_duplicates(&catalog.event_signups, &incoming)
        .await
        .map_err(err)?;
    if let Some(duplicate) = duplicates.first() {
        if handling == DuplicateHandling::Skip {
            return Ok(Disposition::Duplicate {
                message: "Skipped - duplicate event found".to_string(),
            });
        }
        let existing = &duplicate.existing;
        let id = existing.get_object_id("_id").map_err(err)?;

        let existing_signups = existing.get_array("signups").cloned().unwrap_or_default();
        let known_users: Vec<ObjectId> = existing_signups
            .iter()
            .filter_map(Bson::as_document)
            .filter_map(|s| s.get_object_id("userId").ok())
            .collect();
        let fresh: Vec<Bson> = signups
            .iter()
            .filter(|s| {
                s.as_document()
                    .and_then(|d| d.get_object_id("userId").ok())
                    .map(|id| !known_users.contains(&id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        if fresh.is_empty() {
            return Ok(Disposition::Duplicate {
                message: "No new signups to merge".to_string(),
            });
        }

        let mut combined = existing_signups;
        let added = fresh.len();
        combined.extend(fresh);

        let mut patch = doc! { "signups": combined };
        for field in ["eventTitle", "eventDescription", "googleCalendarLink", "maxSignups", "isActive"] {
            if let Some(value) = incoming.get(field) {
                patch.insert(field, value.clone());
            }
        }
        patch.insert("updatedAt", stored_date(chrono::Utc::now()));
        catalog
            .event_signups
            .update_by_id(&id, doc! { "$set": patch })
            .await
            .map_err(err)?;
        return Ok(Disposition::MergedSignups { id, added });
    }

    if !incoming.contains_key("createdAt") {
        incoming.insert("createdAt", stored_date(chrono::Utc::now()));
    }
    let signup_count = signups.len();
    let validated: EventSignup = from_document(incoming).map_err(err)?;
    let id = catalog
        .event_signups
        .insert(to_document(&validated).map_err(err)?)
        .await
        .map_err(err)?;
    Ok(Disposition::Created { id, signups: Some(signup_count) })
}

/// Batch entry point for the single-entity book import route. Uses the same
/// per-record pipeline as the full restore, so only `skip` and `merge` are
/// honored here.
pub async fn import_book_records<S: DocumentStore>(
    catalog: &Catalog<S>,
    records: &[Value],
    handling: DuplicateHandling,
) -> EntityReport {
    let handling = effective(handling);
    let mut report = EntityReport::default();
    for record in records {
        let label = title_label(record);
        match import_book_record(catalog, record, handling).await {
            Ok(disposition) => record_disposition(&mut report, &label, disposition),
            Err(error) => report.errors.push(RecordError { label, error }),
        }
    }
    report
}

/// Batch entry point for the single-entity document-section import route.
pub async fn import_document_records<S: DocumentStore, M: MediaHost>(
    catalog: &Catalog<S>,
    media: &M,
    records: &[Value],
    handling: DuplicateHandling,
) -> EntityReport {
    let handling = effective(handling);
    let mut report = EntityReport::default();
    for record in records {
        let label = title_label(record);
        match import_document_record(catalog, media, record, handling, &label, &mut report).await {
            Ok(disposition) => record_disposition(&mut report, &label, disposition),
            Err(error) => report.errors.push(RecordError { label, error }),
        }
    }
    report
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

fn user_label(record: &Value) -> String {
    str_of(record, "username").unwrap_or_else(|| "Unknown".to_string())
}

fn student_label(record: &Value) -> String {
    format!(
        "{} {}",
        str_of(record, "firstName").unwrap_or_else(|| "Unknown".to_string()),
        str_of(record, "lastName").unwrap_or_else(|| "Student".to_string()),
    )
}

fn title_label(record: &Value) -> String {
    str_of(record, "title").unwrap_or_else(|| "Unknown".to_string())
}

fn event_label(record: &Value) -> String {
    str_of(record, "eventTitle").unwrap_or_else(|| "Unknown".to_string())
}

fn summarize(section_len: usize, report: &EntityReport) -> EntitySummary {
    EntitySummary {
        total: section_len,
        created: report.success.len(),
        merged: report.merged.len(),
        skipped: report.duplicates.len(),
        errors: report.errors.len(),
    }
}

/// Restores a complete system backup. The envelope is validated up front;
/// afterwards every record is processed independently and the caller always
/// receives the full per-record result set, however many records failed.
pub async fn import_all<S: DocumentStore, M: MediaHost>(
    catalog: &Catalog<S>,
    media: &M,
    backup: &Value,
    options: &ImportOptions,
) -> Result<ImportResult, ImportError> {
    let envelope: Envelope =
        serde_json::from_value(backup.clone()).map_err(|_| ImportError::InvalidEnvelope)?;
    let export_type = envelope
        .metadata
        .as_ref()
        .and_then(|m| m.export_type.as_deref());
    if export_type != Some(COMPLETE_BACKUP_TYPE) {
        return Err(ImportError::InvalidEnvelope);
    }

    let mut result = ImportResult::default();

    let users_data = envelope.users.map(|s| s.data).unwrap_or_default();
    let handling = effective(options.user_duplicate_handling);
    for record in &users_data {
        let label = user_label(record);
        match import_user_record(&catalog.users, record, handling).await {
            Ok(disposition) => record_disposition(&mut result.users, &label, disposition),
            Err(error) => result.users.errors.push(RecordError { label, error }),
        }
    }

    let students_data = envelope.students.map(|s| s.data).unwrap_or_default();
    let handling = effective(options.student_duplicate_handling);
    for record in &students_data {
        let label = student_label(record);
        match import_student_record(catalog, media, record, handling, &label, &mut result.students)
            .await
        {
            Ok(disposition) => record_disposition(&mut result.students, &label, disposition),
            Err(error) => result.students.errors.push(RecordError { label, error }),
        }
    }

    let notifications_data = envelope.notifications.map(|s| s.data).unwrap_or_default();
    let handling = effective(options.notification_duplicate_handling);
    for record in &notifications_data {
        let label = title_label(record);
        match import_notification_record(
            catalog,
            media,
            record,
            handling,
            &label,
            &mut result.notifications,
        )
        .await
        {
            Ok(disposition) => record_disposition(&mut result.notifications, &label, disposition),
            Err(error) => result.notifications.errors.push(RecordError { label, error }),
        }
    }

    let documents_data = envelope.documents.map(|s| s.data).unwrap_or_default();
    let handling = effective(options.document_duplicate_handling);
    for record in &documents_data {
        let label = title_label(record);
        match import_document_record(catalog, media, record, handling, &label, &mut result.documents)
            .await
        {
            Ok(disposition) => record_disposition(&mut result.documents, &label, disposition),
            Err(error) => result.documents.errors.push(RecordError { label, error }),
        }
    }

    let books_data = envelope.books.map(|s| s.data).unwrap_or_default();
    let handling = effective(options.book_duplicate_handling);
    for record in &books_data {
        let label = title_label(record);
        match import_book_record(catalog, record, handling).await {
            Ok(disposition) => record_disposition(&mut result.books, &label, disposition),
            Err(error) => result.books.errors.push(RecordError { label, error }),
        }
    }

    let events_data = envelope.event_signups.map(|s| s.data).unwrap_or_default();
    let handling = effective(options.event_signup_duplicate_handling);
    for record in &events_data {
        let label = event_label(record);
        match import_event_record(catalog, record, handling).await {
            Ok(disposition) => record_disposition(&mut result.event_signups, &label, disposition),
            Err(error) => result.event_signups.errors.push(RecordError { label, error }),
        }
    }

    result.summary = ImportSummary {
        users: summarize(users_data.len(), &result.users),
        students: summarize(students_data.len(), &result.students),
        notifications: summarize(notifications_data.len(), &result.notifications),
        documents: summarize(documents_data.len(), &result.documents),
        books: summarize(books_data.len(), &result.books),
        event_signups: summarize(events_data.len(), &result.event_signups),
        ..Default::default()
    };
    let entity_summaries = [
        &result.summary.users,
        &result.summary.students,
        &result.summary.notifications,
        &result.summary.documents,
        &result.summary.books,
        &result.summary.event_signups,
    ];
    result.summary.total_processed = entity_summaries.iter().map(|s| s.total).sum();
    result.summary.total_created = entity_summaries.iter().map(|s| s.created).sum();
    result.summary.total_merged = entity_summaries.iter().map(|s| s.merged).sum();
    result.summary.total_skipped = entity_summaries.iter().map(|s| s.skipped).sum();
    result.summary.total_errors = entity_summaries.iter().map(|s| s.errors).sum();

    info!(
        "backup import finished: {} processed, {} created, {} merged, {} skipped, {} errors",
        result.summary.total_processed,
        result.summary.total_created,
        result.summary.total_merged,
        result.summary.total_skipped,
        result.summary.total_errors,
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StubMediaHost;
    use crate::store::MemStore;
    use serde_json::json;

    fn backup(sections: Value) -> Value {
        let mut envelope = json!({
            "_metadata": {
                "exportType": COMPLETE_BACKUP_TYPE,
                "version": "1.0",
            },
        });
        if let (Some(target), Some(source)) = (envelope.as_object_mut(), sections.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), json!({ "data": value }));
            }
        }
        envelope
    }

    fn merge_everything() -> ImportOptions {
        ImportOptions {
            user_duplicate_handling: DuplicateHandling::Merge,
            student_duplicate_handling: DuplicateHandling::Merge,
            notification_duplicate_handling: DuplicateHandling::Merge,
            document_duplicate_handling: DuplicateHandling::Merge,
            book_duplicate_handling: DuplicateHandling::Merge,
            event_signup_duplicate_handling: DuplicateHandling::Merge,
        }
    }

    #[tokio::test]
    async fn malformed_envelope_rejects_before_any_write() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::default();
        let bad = json!({
            "_metadata": { "exportType": "not-a-backup" },
            "users": { "data": [ { "username": "parent1", "email": "p1@example.com" } ] },
        });

        let result = import_all(&catalog, &media, &bad, &ImportOptions::default()).await;
        assert!(matches!(result, Err(ImportError::InvalidEnvelope)));
        assert_eq!(catalog.users.len(), 0);
    }

    #[tokio::test]
    async fn import_is_idempotent_under_skip() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::default();
        let data = backup(json!({
            "users": [
                { "username": "parent1", "email": "p1@example.com", "name": "First Parent" },
            ],
            "students": [
                {
                    "firstName": "Ana", "lastName": "Silva",
                    "dateOfBirth": "2010-05-15", "parentUsername": "parent1",
                },
            ],
            "books": [
                { "title": "Matilda", "author": "Roald Dahl" },
            ],
        }));

        let first = import_all(&catalog, &media, &data, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(first.summary.total_created, 3);
        assert_eq!(first.summary.total_errors, 0);
        assert_eq!(catalog.users.len(), 1);
        assert_eq!(catalog.students.len(), 1);
        assert_eq!(catalog.books.len(), 1);

        let second = import_all(&catalog, &media, &data, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(second.summary.total_created, 0);
        assert_eq!(second.summary.total_skipped, 3);
        assert_eq!(catalog.users.len(), 1);
        assert_eq!(catalog.students.len(), 1);
        assert_eq!(catalog.books.len(), 1);
    }

    #[tokio::test]
    async fn student_with_unknown_parent_is_rejected_individually() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::default();
        let data = backup(json!({
            "students": [
                {
                    "firstName": "Ana", "lastName": "Silva",
                    "dateOfBirth": "2010-05-15", "parentUsername": "ghost",
                },
            ],
        }));

        let result = import_all(&catalog, &media, &data, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(result.students.success.len(), 0);
        assert_eq!(result.students.errors.len(), 1);
        assert!(result.students.errors[0].error.contains("'ghost' not found"));
        assert_eq!(catalog.students.len(), 0);
    }

    #[tokio::test]
    async fn student_import_creates_dashboard_and_back_reference() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::default();
        let data = backup(json!({
            "users": [
                { "username": "parent1", "email": "p1@example.com" },
            ],
            "students": [
                {
                    "firstName": "Ana", "lastName": "Silva",
                    "dateOfBirth": "2010-05-15", "parentUsername": "parent1",
                    "dashboard": {
                        "portfolios": [
                            {
                                "portfolioUrl": "https://archive.example/p.pdf",
                                "fileName": "p.pdf",
                                "_fileNote": "File URL preserved - will be validated during import. Re-upload if inaccessible.",
                            },
                        ],
                        "history": [
                            { "type": "enrollment_start", "date": "2023-09-01" },
                        ],
                    },
                },
            ],
        }));

        let result = import_all(&catalog, &media, &data, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(result.students.success.len(), 1);

        let dashboard = &catalog.dashboards.dump()[0];
        let portfolios = dashboard.get_array("portfolios").unwrap();
        let first = portfolios[0].as_document().unwrap();
        // Portable keys are mapped back to the storage shape.
        assert_eq!(first.get_str("pdfUrl").unwrap(), "https://archive.example/p.pdf");
        assert!(first.get("_fileNote").is_none());

        let student_id = catalog.dashboards.dump()[0].get_object_id("studentId").unwrap();
        let parent = &catalog.users.dump()[0];
        let students = parent.get_array("students").unwrap();
        assert_eq!(students[0], Bson::ObjectId(student_id));
    }

    #[tokio::test]
    async fn user_merge_prefers_non_empty_and_keeps_credentials() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::default();
        catalog
            .users
            .insert(doc! {
                "username": "parent1",
                "email": "parent1@old.example",
                "name": "First Parent",
                "passwordHash": "$2b$10$existing",
            })
            .await
            .unwrap();

        let data = backup(json!({
            "users": [
                {
                    "username": "parent1",
                    "email": "parent1@new.example",
                    "name": "",
                    "passwordHash": "$2b$10$incoming",
                },
            ],
        }));

        let result = import_all(&catalog, &media, &data, &merge_everything())
            .await
            .unwrap();
        assert_eq!(result.users.merged.len(), 1);

        let user = &catalog.users.dump()[0];
        assert_eq!(user.get_str("email").unwrap(), "parent1@new.example");
        assert_eq!(user.get_str("name").unwrap(), "First Parent");
        assert_eq!(user.get_str("passwordHash").unwrap(), "$2b$10$existing");
    }

    #[tokio::test]
    async fn student_merge_appends_dashboard_history() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::default();
        let parent = catalog
            .users
            .insert(doc! { "username": "parent1", "email": "p1@example.com" })
            .await
            .unwrap();
        let student = catalog
            .students
            .insert(doc! {
                "userId": parent,
                "firstName": "Ana",
                "lastName": "Silva",
                "dateOfBirth": "2010-05-15T00:00:00Z",
            })
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

        let data = backup(json!({
            "students": [
                {
                    "firstName": "Ana", "lastName": "Silva",
                    "dateOfBirth": "2010-05-15", "parentUsername": "parent1",
                    "dashboard": {
                        "history": [
                            { "type": "receipt", "date": "2023-10-01", "paymentStatus": "paid" },
                        ],
                    },
                },
            ],
        }));

        let result = import_all(&catalog, &media, &data, &merge_everything())
            .await
            .unwrap();
        assert_eq!(result.students.merged.len(), 1);
        assert_eq!(catalog.dashboards.len(), 1);

        let history = catalog.dashboards.dump()[0].get_array("history").unwrap().clone();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_book_is_skipped() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::default();
        catalog
            .books
            .insert(doc! { "title": "Matilda", "author": "Roald Dahl" })
            .await
            .unwrap();

        let data = backup(json!({
            "books": [ { "title": "Matilda", "author": "Roald Dahl" } ],
        }));

        let result = import_all(&catalog, &media, &data, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(result.books.duplicates.len(), 1);
        assert_eq!(result.books.success.len(), 0);
        assert_eq!(catalog.books.len(), 1);
    }

    #[tokio::test]
    async fn book_borrower_resolves_by_username_or_falls_off() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::default();
        catalog
            .users
            .insert(doc! { "username": "parent2", "email": "p2@example.com" })
            .await
            .unwrap();

        let data = backup(json!({
            "books": [
                {
                    "title": "The BFG", "author": "Roald Dahl",
                    "lentTo": "aaaaaaaaaaaaaaaaaaaaaaaa",
                    "lentToUsername": "parent2",
                    "lending": { "lentDate": "2024-05-01", "returnRequested": false },
                },
                {
                    "title": "Danny", "author": "Roald Dahl",
                    "lentTo": "bbbbbbbbbbbbbbbbbbbbbbbb",
                    "lentToUsername": "nobody",
                    "lending": { "lentDate": "2024-05-01" },
                },
            ],
        }));

        let result = import_all(&catalog, &media, &data, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(result.books.success.len(), 2);

        let books = catalog.books.dump();
        let bfg = books.iter().find(|b| b.get_str("title") == Ok("The BFG")).unwrap();
        assert!(bfg.get_document("lending").unwrap().get_object_id("borrower").is_ok());

        let danny = books.iter().find(|b| b.get_str("title") == Ok("Danny")).unwrap();
        let lending = danny.get_document("lending").map(|l| l.clone()).unwrap_or_default();
        assert!(lending.get("borrower").is_none());
        assert!(lending.get("lentDate").is_none());
    }

    #[tokio::test]
    async fn event_merge_adds_only_new_signups() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::default();
        let existing_user = catalog
            .users
            .insert(doc! { "username": "parent1", "email": "p1@example.com", "name": "First Parent" })
            .await
            .unwrap();
        catalog
            .users
            .insert(doc! { "username": "parent2", "email": "p2@example.com" })
            .await
            .unwrap();
        catalog
            .event_signups
            .insert(doc! {
                "eventTitle": "Spring Fair",
                "eventDate": "2024-04-20T00:00:00Z",
                "signups": [ { "userId": existing_user, "userName": "First Parent" } ],
                "isActive": true,
            })
            .await
            .unwrap();

        let data = backup(json!({
            "eventSignups": [
                {
                    "eventTitle": "Spring Fair",
                    "eventDate": "2024-04-20",
                    "signups": [
                        { "userUsername": "parent1", "userName": "stale" },
                        { "userUsername": "parent2", "userName": "stale" },
                    ],
                },
            ],
        }));

        let result = import_all(&catalog, &media, &data, &merge_everything())
            .await
            .unwrap();
        assert_eq!(result.event_signups.success.len(), 1);
        assert_eq!(result.event_signups.success[0].signups_added, Some(1));

        let signups = catalog.event_signups.dump()[0].get_array("signups").unwrap().clone();
        assert_eq!(signups.len(), 2);

        // Same backup again: nothing new to merge.
        let again = import_all(&catalog, &media, &data, &merge_everything())
            .await
            .unwrap();
        assert_eq!(again.event_signups.duplicates.len(), 1);
        assert!(again.event_signups.duplicates[0].message.contains("No new signups"));
    }

    #[tokio::test]
    async fn missing_files_warn_but_never_block() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::with_known(vec![
            "https://res.cloudinary.com/demo/raw/private/v1/ok.pdf".to_string(),
        ]);

        let data = backup(json!({
            "users": [ { "username": "parent1", "email": "p1@example.com" } ],
            "students": [
                {
                    "firstName": "Ana", "lastName": "Silva",
                    "dateOfBirth": "2010-05-15", "parentUsername": "parent1",
                    "dashboard": {
                        "portfolios": [
                            { "portfolioUrl": "https://res.cloudinary.com/demo/raw/private/v1/ok.pdf", "fileName": "ok.pdf" },
                            { "portfolioUrl": "https://res.cloudinary.com/demo/raw/private/v1/gone.pdf", "fileName": "gone.pdf" },
                        ],
                        "documents": [
                            { "documentUrl": "https://elsewhere.example/handbook.pdf", "name": "Handbook" },
                        ],
                    },
                },
            ],
        }));

        let result = import_all(&catalog, &media, &data, &ImportOptions::default())
            .await
            .unwrap();

        assert_eq!(result.students.success.len(), 1);
        assert_eq!(result.students.warnings.len(), 1);
        let warning = &result.students.warnings[0];
        assert_eq!(warning.invalid_files.len(), 1);
        assert_eq!(warning.invalid_files[0].file_name.as_deref(), Some("gone.pdf"));
        assert_eq!(warning.external_files.len(), 1);

        // All portfolio entries land regardless of validation outcome.
        let dashboard = &catalog.dashboards.dump()[0];
        assert_eq!(dashboard.get_array("portfolios").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unsupported_handling_downgrades_to_skip() {
        let catalog = Catalog::memory();
        let media = StubMediaHost::default();
        catalog
            .users
            .insert(doc! { "username": "parent1", "email": "p1@example.com", "name": "Keep Me" })
            .await
            .unwrap();

        let data = backup(json!({
            "users": [ { "username": "parent1", "email": "p1@example.com", "name": "Replaced" } ],
        }));

        let options = ImportOptions {
            user_duplicate_handling: DuplicateHandling::Replace,
            ..Default::default()
        };
        let result = import_all(&catalog, &media, &data, &options).await.unwrap();
        assert_eq!(result.users.duplicates.len(), 1);
        assert_eq!(catalog.users.dump()[0].get_str("name").unwrap(), "Keep Me");
    }
}
