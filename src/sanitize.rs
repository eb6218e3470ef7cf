//! Entity sanitizers: turn stored documents into portable backup records.
//! Pure functions — internal ids become `id` strings, foreign references
//! gain human-readable aliases where one exists, and hosted-file fields are
//! re-keyed to a single `*Url` plus a note that the URL must be revalidated
//! on import.

use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use serde_json::Value;
use std::collections::HashMap;

pub const FILE_NOTE: &str =
    "File URL preserved - will be validated during import. Re-upload if inaccessible.";

#[derive(Debug, Clone, Copy, Default)]
pub struct SanitizeOptions {
    /// Password hashes are dropped unless the caller opts in. Keeping them
    /// makes restored accounts immediately usable; dropping them forces a
    /// password reset after import.
    pub preserve_passwords: bool,
}

/// Converts a stored BSON value into its portable JSON form: ObjectIds
/// become hex strings, datetimes become RFC 3339 strings.
fn portable_bson(value: &Bson) -> Value {
    match value {
        Bson::ObjectId(id) => Value::String(id.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or(Value::Null),
        Bson::Array(items) => Value::Array(items.iter().map(portable_bson).collect()),
        Bson::Document(inner) => Value::Object(
            inner
                .iter()
                .map(|(k, v)| (k.clone(), portable_bson(v)))
                .collect(),
        ),
        other => other.clone().into_relaxed_extjson(),
    }
}

/// Replaces the internal `_id` with a public `id` string.
fn rewrite_id(doc: &mut Document) {
    if let Ok(id) = doc.get_object_id("_id") {
        doc.remove("_id");
        doc.insert("id", id.to_hex());
    }
}

fn id_list_to_strings(doc: &mut Document, field: &str) {
    if let Some(Bson::Array(items)) = doc.get(field) {
        let ids: Vec<Bson> = items
            .iter()
            .map(|item| match item {
                Bson::ObjectId(id) => Bson::String(id.to_hex()),
                other => other.clone(),
            })
            .collect();
        doc.insert(field, ids);
    }
}

fn ref_to_string(doc: &mut Document, field: &str) -> Option<ObjectId> {
    if let Ok(id) = doc.get_object_id(field) {
        doc.insert(field, id.to_hex());
        return Some(id);
    }
    None
}

pub fn sanitize_user(user: &Document, options: SanitizeOptions) -> Value {
    let mut sanitized = user.clone();

    if !options.preserve_passwords {
        sanitized.remove("passwordHash");
    }
    // Lockout bookkeeping is runtime state, not part of the account.
    sanitized.remove("loginAttempts");
    sanitized.remove("lockUntil");

    rewrite_id(&mut sanitized);
    id_list_to_strings(&mut sanitized, "students");
    id_list_to_strings(&mut sanitized, "books");

    portable_bson(&Bson::Document(sanitized))
}

pub fn sanitize_student(
    student: &Document,
    parent_username: Option<&str>,
    dashboard: Option<Value>,
) -> Value {
    let mut sanitized = student.clone();

    rewrite_id(&mut sanitized);
    ref_to_string(&mut sanitized, "userId");
    if let Some(username) = parent_username {
        sanitized.insert("parentUsername", username);
    }
    id_list_to_strings(&mut sanitized, "wishlist");

    let mut value = portable_bson(&Bson::Document(sanitized));
    if let (Some(dash), Some(map)) = (dashboard, value.as_object_mut()) {
        map.insert("dashboard".to_string(), dash);
    }
    value
}

pub fn sanitize_dashboard(dashboard: &Document) -> Value {
    let mut sanitized = dashboard.clone();
    rewrite_id(&mut sanitized);
    ref_to_string(&mut sanitized, "studentId");

    if let Ok(portfolios) = dashboard.get_array("portfolios") {
        let mapped: Vec<Bson> = portfolios
            .iter()
            .filter_map(Bson::as_document)
            .map(|p| {
                let mut out = doc! {};
                copy_fields(p, &mut out, &["fileName", "uploadDate"]);
                rekey(p, &mut out, "pdfUrl", "portfolioUrl");
                out.insert("_fileNote", FILE_NOTE);
                Bson::Document(out)
            })
            .collect();
        sanitized.insert("portfolios", mapped);
    }

    if let Ok(documents) = dashboard.get_array("documents") {
        let mapped: Vec<Bson> = documents
            .iter()
            .filter_map(Bson::as_document)
            .map(|d| {
                let mut out = doc! {};
                copy_fields(d, &mut out, &["name", "fileName", "uploadDate"]);
                rekey(d, &mut out, "url", "documentUrl");
                out.insert("_fileNote", FILE_NOTE);
                Bson::Document(out)
            })
            .collect();
        sanitized.insert("documents", mapped);
    }

    if let Ok(history) = dashboard.get_array("history") {
        let mapped: Vec<Bson> = history
            .iter()
            .filter_map(Bson::as_document)
            .map(|event| {
                let mut out = doc! {};
                copy_fields(
                    event,
                    &mut out,
                    &[
                        "type",
                        "date",
                        "month",
                        "year",
                        "donorName",
                        "donationAmount",
                        "paymentStatus",
                        "fileName",
                        "description",
                    ],
                );
                rekey(event, &mut out, "downloadUrl", "receiptUrl");
                if event.get_str("fileName").is_ok() && event.get("downloadUrl").is_some() {
                    out.insert("_fileNote", FILE_NOTE);
                }
                Bson::Document(out)
            })
            .collect();
        sanitized.insert("history", mapped);
    }

    portable_bson(&Bson::Document(sanitized))
}

pub fn sanitize_notification(notification: &Document) -> Value {
    let mut sanitized = notification.clone();
    rewrite_id(&mut sanitized);
    ref_to_string(&mut sanitized, "createdBy");
    id_list_to_strings(&mut sanitized, "targetStudents");

    if matches!(notification.get_str("attachmentUrl"), Ok(url) if !url.is_empty()) {
        sanitized.insert("_attachmentNote", FILE_NOTE);
    }

    portable_bson(&Bson::Document(sanitized))
}

pub fn sanitize_document_section(section: &Document) -> Value {
    let mut sanitized = section.clone();
    rewrite_id(&mut sanitized);
    ref_to_string(&mut sanitized, "createdBy");

    if let Ok(documents) = section.get_array("documents") {
        let mapped: Vec<Bson> = documents
            .iter()
            .filter_map(Bson::as_document)
            .map(|entry| {
                let mut out = doc! {};
                copy_fields(entry, &mut out, &["name", "fileName", "uploadDate"]);
                rekey(entry, &mut out, "fileUrl", "documentUrl");
                if let Ok(uploader) = entry.get_object_id("uploadedBy") {
                    out.insert("uploadedBy", uploader.to_hex());
                }
                if entry.get_str("fileName").is_ok() && entry.get("fileUrl").is_some() {
                    out.insert("_fileNote", FILE_NOTE);
                }
                Bson::Document(out)
            })
            .collect();
        sanitized.insert("documents", mapped);
    }

    portable_bson(&Bson::Document(sanitized))
}

pub fn sanitize_book(book: &Document, usernames: &HashMap<ObjectId, String>) -> Value {
    let mut sanitized = book.clone();
    rewrite_id(&mut sanitized);
    ref_to_string(&mut sanitized, "user");

    if let Ok(lending) = book.get_document("lending") {
        let mut portable_lending = doc! {};
        copy_fields(lending, &mut portable_lending, &["lentDate", "dueDate", "returnRequested"]);
        sanitized.insert("lending", portable_lending);

        if let Ok(borrower) = lending.get_object_id("borrower") {
            sanitized.insert("lentTo", borrower.to_hex());
            if let Some(username) = usernames.get(&borrower) {
                sanitized.insert("lentToUsername", username.as_str());
            }
        }
    }

    if let Ok(history) = book.get_array("lendingHistory") {
        let mapped: Vec<Bson> = history
            .iter()
            .filter_map(Bson::as_document)
            .map(|entry| {
                let mut out = doc! {};
                if let Ok(user) = entry.get_object_id("user") {
                    out.insert("user", user.to_hex());
                    if let Some(username) = usernames.get(&user) {
                        out.insert("username", username.as_str());
                    }
                }
                copy_fields(entry, &mut out, &["lentDate", "returnedDate"]);
                Bson::Document(out)
            })
            .collect();
        sanitized.insert("lendingHistory", mapped);
    }

    portable_bson(&Bson::Document(sanitized))
}

pub fn sanitize_event_signup(event: &Document, usernames: &HashMap<ObjectId, String>) -> Value {
    let mut sanitized = event.clone();
    rewrite_id(&mut sanitized);

    if let Some(creator) = ref_to_string(&mut sanitized, "createdBy") {
        if let Some(username) = usernames.get(&creator) {
            sanitized.insert("createdByUsername", username.as_str());
        }
    }

    if let Ok(signups) = event.get_array("signups") {
        let mapped: Vec<Bson> = signups
            .iter()
            .filter_map(Bson::as_document)
            .map(|signup| {
                let mut out = doc! {};
                if let Ok(user) = signup.get_object_id("userId") {
                    out.insert("userId", user.to_hex());
                    if let Some(username) = usernames.get(&user) {
                        out.insert("userUsername", username.as_str());
                    }
                }
                copy_fields(
                    signup,
                    &mut out,
                    &["userName", "responsibility", "notes", "createdAt", "updatedAt"],
                );
                Bson::Document(out)
            })
            .collect();
        sanitized.insert("signups", mapped);
    }

    portable_bson(&Bson::Document(sanitized))
}

fn copy_fields(source: &Document, target: &mut Document, fields: &[&str]) {
    for field in fields {
        if let Some(value) = source.get(*field) {
            target.insert(*field, value.clone());
        }
    }
}

/// Copies `from` into `to_key`, falling back to an already-portable key of
/// the same name (re-exports of previously imported backups).
fn rekey(source: &Document, target: &mut Document, from: &str, to_key: &str) {
    if let Some(value) = source.get(from).or_else(|| source.get(to_key)) {
        target.insert(to_key, value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_sanitizer_drops_password_unless_preserved() {
        let user = doc! {
            "_id": ObjectId::new(),
            "username": "parent1",
            "email": "p1@example.com",
            "passwordHash": "$2b$10$secret",
            "loginAttempts": 3,
            "students": [ObjectId::new()],
        };

        let portable = sanitize_user(&user, SanitizeOptions::default());
        assert!(portable.get("passwordHash").is_none());
        assert!(portable.get("loginAttempts").is_none());
        assert!(portable.get("_id").is_none());
        assert!(portable.get("id").unwrap().is_string());
        assert!(portable["students"][0].is_string());

        let preserved = sanitize_user(&user, SanitizeOptions { preserve_passwords: true });
        assert_eq!(preserved["passwordHash"], "$2b$10$secret");
    }

    #[test]
    fn student_sanitizer_adds_parent_alias_and_inlines_dashboard() {
        let parent = ObjectId::new();
        let student = doc! {
            "_id": ObjectId::new(),
            "userId": parent,
            "firstName": "Ana",
            "lastName": "Silva",
        };
        let dashboard = doc! {
            "_id": ObjectId::new(),
            "studentId": ObjectId::new(),
            "portfolios": [
                { "pdfUrl": "https://media.example/p.pdf", "fileName": "p.pdf" },
            ],
        };

        let portable = sanitize_student(
            &student,
            Some("parent1"),
            Some(sanitize_dashboard(&dashboard)),
        );

        assert_eq!(portable["parentUsername"], "parent1");
        assert_eq!(portable["userId"], parent.to_hex());
        let portfolio = &portable["dashboard"]["portfolios"][0];
        assert_eq!(portfolio["portfolioUrl"], "https://media.example/p.pdf");
        assert_eq!(portfolio["_fileNote"], FILE_NOTE);
        assert!(portfolio.get("pdfUrl").is_none());
    }

    #[test]
    fn history_note_requires_a_file() {
        let dashboard = doc! {
            "_id": ObjectId::new(),
            "studentId": ObjectId::new(),
            "history": [
                { "type": "enrollment_start", "date": "2023-09-01T00:00:00Z" },
                {
                    "type": "receipt",
                    "date": "2023-10-01T00:00:00Z",
                    "paymentStatus": "paid",
                    "fileName": "receipt.pdf",
                    "downloadUrl": "https://media.example/r.pdf",
                },
            ],
        };

        let portable = sanitize_dashboard(&dashboard);
        assert!(portable["history"][0].get("_fileNote").is_none());
        assert_eq!(portable["history"][1]["_fileNote"], FILE_NOTE);
        assert_eq!(portable["history"][1]["receiptUrl"], "https://media.example/r.pdf");
    }

    #[test]
    fn book_sanitizer_exposes_borrower_alias() {
        let borrower = ObjectId::new();
        let usernames = HashMap::from([(borrower, "parent2".to_string())]);
        let book = doc! {
            "_id": ObjectId::new(),
            "title": "Matilda",
            "author": "Roald Dahl",
            "lending": {
                "borrower": borrower,
                "lentDate": "2024-05-01T00:00:00Z",
                "returnRequested": false,
            },
            "lendingHistory": [
                { "user": borrower, "lentDate": "2024-01-01T00:00:00Z", "returnedDate": "2024-02-01T00:00:00Z" },
            ],
        };

        let portable = sanitize_book(&book, &usernames);
        assert_eq!(portable["lentTo"], borrower.to_hex());
        assert_eq!(portable["lentToUsername"], "parent2");
        assert!(portable["lending"].get("borrower").is_none());
        assert_eq!(portable["lendingHistory"][0]["username"], "parent2");
    }
}
