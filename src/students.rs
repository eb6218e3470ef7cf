use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures_util::StreamExt;
use log::{error, info};
use mongodb::bson::{doc, from_document, oid::ObjectId, to_document, Document};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::auth::{authorize, require_user};
use crate::export::{export_students, stored_date, StudentExportFilters};
use crate::merge::{
    apply_merge, find_student_duplicates, merge_entity, DuplicateHandling, MergeStrategy,
    STUDENT_PROFILE,
};
use crate::models::{Role, Student, User};
use crate::policy::Action;
use crate::sanitize::sanitize_student;
use crate::store::{Catalog, DocumentStore};

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
}

fn public_student(student: &Student) -> Value {
    let doc = to_document(student).unwrap_or_default();
    sanitize_student(&doc, None, None)
}

fn can_view(user: &User, student: &Student) -> bool {
    user.role == Role::Admin || user.role == Role::Tutor || student.user_id == user.id
}

pub async fn list_students(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    // Admins and tutors see everyone; parents see their own children.
    let filter = if crate::policy::allows(user.role, Action::ListStudents) {
        doc! { "isArchived": { "$ne": true } }
    } else {
        match user.id {
            Some(id) => doc! { "userId": id, "isArchived": { "$ne": true } },
            None => return internal_error(),
        }
    };

    let mut cursor = match data.mongodb.students().find(filter).await {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error listing students: {}", e);
            return internal_error();
        }
    };
    let mut students = vec![];
    while let Some(Ok(student)) = cursor.next().await {
        students.push(public_student(&student));
    }
    HttpResponse::Ok().json(students)
}

pub async fn get_student(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let student_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    match data.mongodb.students().find_one(doc! { "_id": student_id }).await {
        Ok(Some(student)) if can_view(&user, &student) => {
            HttpResponse::Ok().json(public_student(&student))
        }
        Ok(Some(_)) => HttpResponse::Forbidden().json(json!({ "error": "Permission denied" })),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Student not found" })),
        Err(_) => internal_error(),
    }
}

const STUDENT_DATE_FIELDS: &[&str] =
    &["dateOfBirth", "enrollmentStartDate", "enrollmentEndDate"];

fn student_payload_doc(payload: &Value) -> Option<Document> {
    let mut doc = mongodb::bson::to_bson(payload)
        .ok()
        .and_then(|b| b.as_document().cloned())?;
    for field in ["_id", "id", "createdAt", "wishlist", "isArchived", "dashboard"] {
        doc.remove(field);
    }
    for field in STUDENT_DATE_FIELDS {
        let parsed = match doc.get_str(*field) {
            Ok(raw) => crate::import::parse_portable_date(raw),
            Err(_) => None,
        };
        if let Some(parsed) = parsed {
            doc.insert(*field, stored_date(parsed));
        }
    }
    Some(doc)
}

pub async fn create_student(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<Value>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let Some(mut doc) = student_payload_doc(&payload) else {
        return HttpResponse::BadRequest().json(json!({ "error": "Invalid student data" }));
    };

    // Parents enroll their own children; admins may enroll on behalf of
    // another account by passing userId.
    let owner = match (user.role, doc.get_str("userId").ok().map(str::to_string)) {
        (Role::Admin, Some(raw)) => match ObjectId::parse_str(&raw) {
            Ok(id) => id,
            Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Invalid userId" })),
        },
        _ => match user.id {
            Some(id) => id,
            None => return internal_error(),
        },
    };
    doc.insert("userId", owner);
    doc.insert("createdAt", stored_date(chrono::Utc::now()));

    let student: Student = match from_document(doc) {
        Ok(student) => student,
        Err(e) => return HttpResponse::BadRequest().json(json!({ "error": e.to_string() })),
    };

    let inserted = match data.mongodb.students().insert_one(&student).await {
        Ok(result) => result,
        Err(e) => {
            error!("Error inserting student: {}", e);
            return internal_error();
        }
    };

    if let Some(student_id) = inserted.inserted_id.as_object_id() {
        let _ = data
            .mongodb
            .users()
            .update_one(
                doc! { "_id": owner },
                doc! { "$addToSet": { "students": student_id } },
            )
            .await;
        info!("Student created: {} {}", student.first_name, student.last_name);
        let mut created = public_student(&student);
        if let Some(map) = created.as_object_mut() {
            map.insert("id".to_string(), json!(student_id.to_hex()));
        }
        return HttpResponse::Created().json(created);
    }
    internal_error()
}

pub async fn update_student(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<Value>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let student_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let students = data.mongodb.students();
    let existing = match students.find_one(doc! { "_id": student_id }).await {
        Ok(Some(student)) => student,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Student not found" })),
        Err(_) => return internal_error(),
    };
    if user.role != Role::Admin && existing.user_id != user.id {
        return HttpResponse::Forbidden().json(json!({ "error": "Permission denied" }));
    }

    let Some(mut update) = student_payload_doc(&payload) else {
        return HttpResponse::BadRequest().json(json!({ "error": "Invalid student data" }));
    };
    // Ownership moves only through admin-level user management.
    update.remove("userId");
    if update.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "No fields to update" }));
    }

    match students
        .find_one_and_update(doc! { "_id": student_id }, doc! { "$set": update })
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Ok().json(public_student(&updated)),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Student not found" })),
        Err(e) => {
            error!("Error updating student: {}", e);
            internal_error()
        }
    }
}

pub async fn delete_student(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageStudents) {
        return resp;
    }
    let student_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let students = data.mongodb.students();
    let existing = match students.find_one(doc! { "_id": student_id }).await {
        Ok(Some(student)) => student,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Student not found" })),
        Err(_) => return internal_error(),
    };

    if students.delete_one(doc! { "_id": student_id }).await.is_err() {
        return internal_error();
    }
    // Remove the dashboard and the parent's back-reference along with it.
    let _ = data
        .mongodb
        .dashboards()
        .delete_one(doc! { "studentId": student_id })
        .await;
    if let Some(owner) = existing.user_id {
        let _ = data
            .mongodb
            .users()
            .update_one(
                doc! { "_id": owner },
                doc! { "$pull": { "students": student_id } },
            )
            .await;
    }
    HttpResponse::NoContent().finish()
}

// ---------------------------------------------------------------------------
// Wishlist
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WishlistRequest {
    pub book_id: String,
}

pub async fn add_wishlist_book(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<WishlistRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let student_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };
    let book_id = match ObjectId::parse_str(&payload.book_id) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Invalid book id" })),
    };

    let students = data.mongodb.students();
    let student = match students.find_one(doc! { "_id": student_id }).await {
        Ok(Some(student)) => student,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Student not found" })),
        Err(_) => return internal_error(),
    };
    if user.role != Role::Admin && student.user_id != user.id {
        return HttpResponse::Forbidden().json(json!({ "error": "Permission denied" }));
    }
    match data.mongodb.books().find_one(doc! { "_id": book_id }).await {
        Ok(Some(_)) => {}
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Book not found" })),
        Err(_) => return internal_error(),
    }

    match students
        .update_one(
            doc! { "_id": student_id },
            doc! { "$addToSet": { "wishlist": book_id } },
        )
        .await
    {
        Ok(_) => HttpResponse::Ok().json(json!({ "message": "Book added to wishlist" })),
        Err(_) => internal_error(),
    }
}

pub async fn remove_wishlist_book(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let (student_raw, book_raw) = path.into_inner();
    let (Ok(student_id), Ok(book_id)) = (
        ObjectId::parse_str(&student_raw),
        ObjectId::parse_str(&book_raw),
    ) else {
        return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" }));
    };

    let students = data.mongodb.students();
    let student = match students.find_one(doc! { "_id": student_id }).await {
        Ok(Some(student)) => student,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Student not found" })),
        Err(_) => return internal_error(),
    };
    if user.role != Role::Admin && student.user_id != user.id {
        return HttpResponse::Forbidden().json(json!({ "error": "Permission denied" }));
    }

    match students
        .update_one(
            doc! { "_id": student_id },
            doc! { "$pull": { "wishlist": book_id } },
        )
        .await
    {
        Ok(_) => HttpResponse::Ok().json(json!({ "message": "Book removed from wishlist" })),
        Err(_) => internal_error(),
    }
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

pub async fn archive_student(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    set_student_archived(req, data, path, true).await
}

pub async fn unarchive_student(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    set_student_archived(req, data, path, false).await
}

async fn set_student_archived(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    archived: bool,
) -> HttpResponse {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageStudents) {
        return resp;
    }
    let student_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    match data
        .mongodb
        .students()
        .find_one_and_update(
            doc! { "_id": student_id },
            doc! { "$set": { "isArchived": archived } },
        )
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Ok().json(public_student(&updated)),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Student not found" })),
        Err(_) => internal_error(),
    }
}

pub async fn list_archived_students(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageStudents) {
        return resp;
    }

    let mut cursor = match data.mongodb.students().find(doc! { "isArchived": true }).await {
        Ok(cursor) => cursor,
        Err(_) => return internal_error(),
    };
    let mut students = vec![];
    while let Some(Ok(student)) = cursor.next().await {
        students.push(public_student(&student));
    }
    HttpResponse::Ok().json(students)
}

// ---------------------------------------------------------------------------
// Export / single-entity import
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentExportQuery {
    pub start_month: Option<String>,
    pub end_month: Option<String>,
    #[serde(default)]
    pub include_dashboard: bool,
}

pub async fn export_students_handler(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<StudentExportQuery>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ExportData) {
        return resp;
    }

    let filters = StudentExportFilters {
        start_month: query.start_month.clone(),
        end_month: query.end_month.clone(),
        include_dashboard: query.include_dashboard,
        ..Default::default()
    };
    let catalog = Catalog::mongo(&data.mongodb.db);
    match export_students(&catalog, &filters).await {
        Ok(export) => {
            let stamp = chrono::Utc::now().format("%Y-%m-%d");
            HttpResponse::Ok()
                .insert_header((
                    "Content-Disposition",
                    format!("attachment; filename=\"students-export-{}.json\"", stamp),
                ))
                .json(export)
        }
        Err(e) => {
            error!("Export error: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to export students" }))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStudentsRequest {
    pub students: Value,
    #[serde(default)]
    pub duplicate_handling: DuplicateHandling,
}

/// Imports student records, re-resolving each `parentUsername` against the
/// live user collection. Duplicate control mirrors the user import:
/// `skip`, `replace`, `merge`, `interactive`.
pub async fn import_students(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<ImportStudentsRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ImportData) {
        return resp;
    }

    let records: Vec<Value> = match &payload.students {
        Value::Array(records) => records.clone(),
        single => vec![single.clone()],
    };
    let catalog = Catalog::mongo(&data.mongodb.db);

    let mut success = vec![];
    let mut errors = vec![];
    let mut duplicates = vec![];
    let mut merged_out = vec![];
    let mut conflicts_out = vec![];

    for record in &records {
        let label = format!(
            "{} {}",
            record.get("firstName").and_then(Value::as_str).unwrap_or("Unknown"),
            record.get("lastName").and_then(Value::as_str).unwrap_or("Student"),
        );
        match import_one_student(&catalog, record, payload.duplicate_handling).await {
            Ok(StudentImportOutcome::Created { id }) => {
                success.push(json!({ "name": label, "id": id }));
            }
            Ok(StudentImportOutcome::Skipped) => {
                duplicates.push(json!({ "name": label, "message": "Skipped - duplicate found" }));
            }
            Ok(StudentImportOutcome::Applied { id, action, changes }) => {
                merged_out.push(json!({
                    "name": label,
                    "id": id,
                    "action": action,
                    "changesCount": changes,
                }));
            }
            Ok(StudentImportOutcome::Conflict { conflicts }) => {
                conflicts_out.push(json!({
                    "name": label,
                    "incomingData": record,
                    "conflicts": serde_json::to_value(&conflicts).unwrap_or(Value::Null),
                }));
            }
            Err(error) => {
                errors.push(json!({ "name": label, "error": error }));
            }
        }
    }

    HttpResponse::Ok().json(json!({
        "results": {
            "success": success,
            "errors": errors,
            "duplicates": duplicates,
            "merged": merged_out,
            "conflicts": conflicts_out,
        },
        "summary": {
            "total": records.len(),
            "created": success.len(),
            "merged": merged_out.len(),
            "skipped": duplicates.len(),
            "conflicts": conflicts_out.len(),
            "errors": errors.len(),
        },
    }))
}

enum StudentImportOutcome {
    Created { id: String },
    Skipped,
    Applied { id: String, action: &'static str, changes: usize },
    Conflict { conflicts: Vec<crate::merge::FieldConflict> },
}

async fn import_one_student<S: DocumentStore>(
    catalog: &Catalog<S>,
    record: &Value,
    handling: DuplicateHandling,
) -> Result<StudentImportOutcome, String> {
    let mut incoming = mongodb::bson::to_bson(record)
        .ok()
        .and_then(|b| b.as_document().cloned())
        .ok_or("Invalid record structure")?;
    for field in ["id", "_id", "dashboard", "wishlist"] {
        incoming.remove(field);
    }
    for field in STUDENT_DATE_FIELDS {
        let parsed = match incoming.get_str(*field) {
            Ok(raw) => crate::import::parse_portable_date(raw),
            Err(_) => None,
        };
        if let Some(parsed) = parsed {
            incoming.insert(*field, stored_date(parsed));
        }
    }

    if incoming.get_str("firstName").unwrap_or("").is_empty()
        || incoming.get_str("lastName").unwrap_or("").is_empty()
    {
        return Err("First and last name are required".to_string());
    }

    let parent_username = incoming.get_str("parentUsername").ok().map(str::to_string);
    let parent = match &parent_username {
        Some(username) => catalog
            .users
            .find_one(doc! { "username": username })
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Parent user '{}' not found", username))?,
        None => {
            let raw = incoming.get_str("userId").unwrap_or("").to_string();
            let oid = ObjectId::parse_str(&raw).map_err(|_| "Parent user not found")?;
            catalog
                .users
                .find_by_id(&oid)
                .await
                .map_err(|e| e.to_string())?
                .ok_or("Parent user not found")?
        }
    };
    incoming.remove("parentUsername");
    let parent_id = parent.get_object_id("_id").map_err(|e| e.to_string())?;
    incoming.insert("userId", parent_id);

    let found = find_student_duplicates(&catalog.students, &incoming)
        .await
        .map_err(|e| e.to_string())?;
    if let Some(duplicate) = found.first() {
        let existing = &duplicate.existing;
        let existing_id = existing.get_object_id("_id").map_err(|e| e.to_string())?;
        match handling {
            DuplicateHandling::Skip => return Ok(StudentImportOutcome::Skipped),
            DuplicateHandling::Interactive => {
                return Ok(StudentImportOutcome::Conflict {
                    conflicts: duplicate.conflicts.clone(),
                })
            }
            DuplicateHandling::Replace | DuplicateHandling::Merge => {
                let strategy = if handling == DuplicateHandling::Replace {
                    MergeStrategy::Replace
                } else {
                    MergeStrategy::Merge
                };
                let merged = merge_entity(existing, &incoming, strategy, &STUDENT_PROFILE);
                let outcome = apply_merge(existing, merged);
                let validated: Student =
                    from_document(outcome.merged).map_err(|e| e.to_string())?;
                let mut patch = to_document(&validated).map_err(|e| e.to_string())?;
                patch.remove("_id");
                catalog
                    .students
                    .update_by_id(&existing_id, doc! { "$set": patch })
                    .await
                    .map_err(|e| e.to_string())?;
                let action = if handling == DuplicateHandling::Replace {
                    "replaced"
                } else {
                    "merged"
                };
                return Ok(StudentImportOutcome::Applied {
                    id: existing_id.to_hex(),
                    action,
                    changes: outcome.changes.len(),
                });
            }
        }
    }

    if !incoming.contains_key("createdAt") {
        incoming.insert("createdAt", stored_date(chrono::Utc::now()));
    }
    let validated: Student = from_document(incoming).map_err(|e| e.to_string())?;
    let id = catalog
        .students
        .insert(to_document(&validated).map_err(|e| e.to_string())?)
        .await
        .map_err(|e| e.to_string())?;
    catalog
        .users
        .update_by_id(&parent_id, doc! { "$addToSet": { "students": id } })
        .await
        .map_err(|e| e.to_string())?;
    Ok(StudentImportOutcome::Created { id: id.to_hex() })
}
