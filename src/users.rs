use actix_web::{web, HttpRequest, HttpResponse, Responder};
use bcrypt::{hash, DEFAULT_COST};
use futures_util::StreamExt;
use log::{error, info};
use mongodb::bson::{doc, from_document, oid::ObjectId, to_document, Document};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::auth::{authorize, require_user, validate_password};
use crate::export::{
    export_all, export_users, export_users_with_students, AllExportFilters, BookExportFilters,
    NotificationExportFilters, StudentExportFilters, UserExportFilters,
};
use crate::import::{import_all, ImportError, ImportOptions};
use crate::merge::{
    apply_merge, find_user_duplicates, merge_entity, DuplicateHandling, MergeStrategy,
    USER_PROFILE,
};
use crate::models::{Role, User};
use crate::policy::Action;
use crate::sanitize::{sanitize_user, SanitizeOptions};
use crate::store::{Catalog, DocumentStore};

/// API shape of an account: internal id rewritten, credentials and lockout
/// state stripped.
pub fn public_user(user: &User) -> Value {
    let doc = to_document(user).unwrap_or_default();
    sanitize_user(&doc, SanitizeOptions::default())
}

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
}

pub async fn list_users(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ListUsers) {
        return resp;
    }

    let mut cursor = match data
        .mongodb
        .users()
        .find(doc! { "isArchived": { "$ne": true } })
        .await
    {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error listing users: {}", e);
            return internal_error();
        }
    };

    let mut users = vec![];
    while let Some(result) = cursor.next().await {
        match result {
            Ok(user) => users.push(public_user(&user)),
            Err(e) => {
                error!("Error reading users: {}", e);
                return internal_error();
            }
        }
    }
    HttpResponse::Ok().json(users)
}

pub async fn list_archived_users(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ArchiveUsers) {
        return resp;
    }

    let mut cursor = match data.mongodb.users().find(doc! { "isArchived": true }).await {
        Ok(cursor) => cursor,
        Err(_) => return internal_error(),
    };
    let mut users = vec![];
    while let Some(Ok(user)) = cursor.next().await {
        users.push(public_user(&user));
    }
    HttpResponse::Ok().json(users)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub email: String,
    pub name: Option<String>,
    pub role: Option<Role>,
    #[serde(rename = "isGAMember")]
    pub is_ga_member: Option<bool>,
    pub email_notifications: Option<bool>,
    pub contact_number: Option<String>,
    pub parent_street_address: Option<String>,
    pub parent_city: Option<String>,
    pub parent_postal_code: Option<String>,
    pub parent_country: Option<String>,
    pub parent_nationality: Option<String>,
    pub parent_passport_number: Option<String>,
    pub parent_passport_expiry_date: Option<String>,
    pub parent_nif_number: Option<String>,
    pub emergency_contact_relationship: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_number: Option<String>,
}

pub async fn create_user(
    data: web::Data<AppState>,
    payload: web::Json<CreateUserRequest>,
) -> impl Responder {
    if let Some(problem) = validate_password(&payload.password) {
        return HttpResponse::BadRequest().json(json!({ "error": problem }));
    }
    if payload.username.len() < 3 {
        return HttpResponse::BadRequest()
            .json(json!({ "error": "Username must be at least 3 characters long." }));
    }
    if payload.email.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "Email is required." }));
    }

    let users = data.mongodb.users();
    match users.find_one(doc! { "username": &payload.username }).await {
        Ok(Some(_)) => {
            return HttpResponse::BadRequest().json(json!({ "error": "Username must be unique" }))
        }
        Ok(None) => {}
        Err(_) => return internal_error(),
    }
    match users.find_one(doc! { "email": &payload.email }).await {
        Ok(Some(_)) => {
            return HttpResponse::BadRequest().json(json!({ "error": "Email must be unique" }))
        }
        Ok(None) => {}
        Err(_) => return internal_error(),
    }

    let password_hash = match hash(&payload.password, DEFAULT_COST) {
        Ok(hashed) => hashed,
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Error hashing password" }))
        }
    };

    let payload = payload.into_inner();
    let user = User {
        id: None,
        username: payload.username,
        email: payload.email,
        password_hash: Some(password_hash),
        role: payload.role.unwrap_or_default(),
        name: payload.name,
        is_ga_member: payload.is_ga_member.unwrap_or(false),
        email_notifications: payload.email_notifications.unwrap_or(true),
        is_archived: false,
        contact_number: payload.contact_number,
        parent_street_address: payload.parent_street_address,
        parent_city: payload.parent_city,
        parent_postal_code: payload.parent_postal_code,
        parent_country: payload.parent_country,
        parent_nationality: payload.parent_nationality,
        parent_passport_number: payload.parent_passport_number,
        parent_passport_expiry_date: payload.parent_passport_expiry_date,
        parent_nif_number: payload.parent_nif_number,
        emergency_contact_relationship: payload.emergency_contact_relationship,
        emergency_contact_name: payload.emergency_contact_name,
        emergency_contact_number: payload.emergency_contact_number,
        login_attempts: 0,
        lock_until: None,
        students: vec![],
        books: vec![],
        created_at: Some(chrono::Utc::now()),
    };

    match users.insert_one(&user).await {
        Ok(result) => {
            info!("User created: {}", user.username);
            let mut created = public_user(&user);
            if let (Some(map), Some(id)) = (created.as_object_mut(), result.inserted_id.as_object_id())
            {
                map.insert("id".to_string(), json!(id.to_hex()));
            }
            HttpResponse::Created().json(created)
        }
        Err(e) => {
            error!("Error inserting user: {}", e);
            internal_error()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub contact_number: Option<String>,
    #[serde(rename = "isGAMember")]
    pub is_ga_member: Option<bool>,
    pub email_notifications: Option<bool>,
    pub parent_street_address: Option<String>,
    pub parent_city: Option<String>,
    pub parent_postal_code: Option<String>,
    pub parent_country: Option<String>,
    pub parent_nationality: Option<String>,
    pub parent_passport_number: Option<String>,
    pub parent_passport_expiry_date: Option<String>,
    pub parent_nif_number: Option<String>,
    pub emergency_contact_relationship: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_number: Option<String>,
}

pub async fn update_user(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateUserRequest>,
) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let target_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    // Accounts may edit themselves; everything else is an admin operation.
    let is_self = current.id == Some(target_id);
    if !is_self && current.role != Role::Admin {
        return HttpResponse::Forbidden().json(json!({ "error": "Permission denied" }));
    }

    let mut update = doc! {};
    if let Some(name) = &payload.name {
        update.insert("name", name);
    }
    if let Some(email) = &payload.email {
        update.insert("email", email);
    }
    if let Some(password) = &payload.password {
        if !password.trim().is_empty() {
            if let Some(problem) = validate_password(password) {
                return HttpResponse::BadRequest().json(json!({ "error": problem }));
            }
            match hash(password, DEFAULT_COST) {
                Ok(hashed) => {
                    update.insert("passwordHash", hashed);
                }
                Err(_) => return internal_error(),
            }
        }
    }
    if let Some(is_ga_member) = payload.is_ga_member {
        // Membership is an admin-granted flag.
        if current.role == Role::Admin {
            update.insert("isGAMember", is_ga_member);
        }
    }
    if let Some(email_notifications) = payload.email_notifications {
        update.insert("emailNotifications", email_notifications);
    }
    for (key, value) in [
        ("contactNumber", &payload.contact_number),
        ("parentStreetAddress", &payload.parent_street_address),
        ("parentCity", &payload.parent_city),
        ("parentPostalCode", &payload.parent_postal_code),
        ("parentCountry", &payload.parent_country),
        ("parentNationality", &payload.parent_nationality),
        ("parentPassportNumber", &payload.parent_passport_number),
        ("parentPassportExpiryDate", &payload.parent_passport_expiry_date),
        ("parentNifNumber", &payload.parent_nif_number),
        ("emergencyContactRelationship", &payload.emergency_contact_relationship),
        ("emergencyContactName", &payload.emergency_contact_name),
        ("emergencyContactNumber", &payload.emergency_contact_number),
    ] {
        if let Some(value) = value {
            update.insert(key, value);
        }
    }

    if update.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "No fields to update" }));
    }

    let users = data.mongodb.users();
    match users
        .find_one_and_update(doc! { "_id": target_id }, doc! { "$set": update })
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Ok().json(public_user(&updated)),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "User not found" })),
        Err(e) => {
            error!("Error updating user: {}", e);
            internal_error()
        }
    }
}

pub async fn delete_user(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ManageUsers) {
        return resp;
    }
    let target_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };
    if current.id == Some(target_id) {
        return HttpResponse::BadRequest().json(json!({ "error": "Cannot delete your own account" }));
    }

    let users = data.mongodb.users();
    match users.find_one(doc! { "_id": target_id }).await {
        Ok(Some(_)) => {}
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "User not found" })),
        Err(_) => return internal_error(),
    }
    match users.delete_one(doc! { "_id": target_id }).await {
        Ok(_) => HttpResponse::NoContent().finish(),
        Err(e) => {
            error!("Error deleting user: {}", e);
            internal_error()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChangeRoleRequest {
    pub role: Role,
}

pub async fn change_role(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<ChangeRoleRequest>,
) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ManageRoles) {
        return resp;
    }
    let target_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Invalid user ID" })),
    };

    let users = data.mongodb.users();
    let target = match users.find_one(doc! { "_id": target_id }).await {
        Ok(Some(user)) => user,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "User not found" })),
        Err(_) => return internal_error(),
    };

    // The system must always keep at least one admin.
    if target.role == Role::Admin && payload.role != Role::Admin {
        match users.count_documents(doc! { "role": "admin" }).await {
            Ok(count) if count <= 1 => {
                return HttpResponse::BadRequest()
                    .json(json!({ "error": "Cannot remove the last admin from the system" }))
            }
            Ok(_) => {}
            Err(_) => return internal_error(),
        }
    }
    if current.id == Some(target_id) && payload.role != target.role {
        return HttpResponse::BadRequest().json(json!({ "error": "Cannot change your own role" }));
    }

    let role_value = match mongodb::bson::to_bson(&payload.role) {
        Ok(value) => value,
        Err(_) => return internal_error(),
    };
    match users
        .find_one_and_update(doc! { "_id": target_id }, doc! { "$set": { "role": role_value } })
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Ok().json(public_user(&updated)),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "User not found" })),
        Err(_) => internal_error(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GaMemberRequest {
    #[serde(rename = "isGAMember")]
    pub is_ga_member: bool,
}

pub async fn set_ga_member(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<GaMemberRequest>,
) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ManageUsers) {
        return resp;
    }
    let target_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Invalid user ID" })),
    };

    match data
        .mongodb
        .users()
        .find_one_and_update(
            doc! { "_id": target_id },
            doc! { "$set": { "isGAMember": payload.is_ga_member } },
        )
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Ok().json(public_user(&updated)),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "User not found" })),
        Err(_) => internal_error(),
    }
}

/// Archives the account and all of its students; archived accounts cannot
/// log in but keep their data.
pub async fn archive_user(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    set_archived(req, data, path, true).await
}

/// Unarchives the account only; students are restored individually.
pub async fn unarchive_user(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    set_archived(req, data, path, false).await
}

async fn set_archived(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    archived: bool,
) -> HttpResponse {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ArchiveUsers) {
        return resp;
    }
    let target_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let users = data.mongodb.users();
    let updated = match users
        .find_one_and_update(
            doc! { "_id": target_id },
            doc! { "$set": { "isArchived": archived } },
        )
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(user)) => user,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "User not found" })),
        Err(_) => return internal_error(),
    };

    if archived {
        if let Err(e) = data
            .mongodb
            .students()
            .update_many(
                doc! { "userId": target_id },
                doc! { "$set": { "isArchived": true } },
            )
            .await
        {
            error!("Error archiving students of {}: {}", updated.username, e);
        }
    }

    HttpResponse::Ok().json(public_user(&updated))
}

/// Blank import row, with the allowed enum values documented inline so an
/// admin can fill the file out without consulting the source.
pub async fn user_template(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ImportData) {
        return resp;
    }

    HttpResponse::Ok().json(json!({
        "_documentation": {
            "role": ["user", "admin", "tutor"],
            "isGAMember": "boolean - true if user is a General Assembly member",
        },
        "username": "",
        "password": "",
        "email": "",
        "role": "user",
        "name": "",
        "contactNumber": "",
        "parentNationality": "",
        "parentPassportNumber": "",
        "parentPassportExpiryDate": "",
        "parentNifNumber": "",
        "parentStreetAddress": "",
        "parentCity": "",
        "parentPostalCode": "",
        "parentCountry": "",
        "emergencyContactRelationship": "",
        "emergencyContactName": "",
        "emergencyContactNumber": "",
    }))
}

// ---------------------------------------------------------------------------
// Single-entity import
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportUsersRequest {
    pub users: Value,
    #[serde(default)]
    pub duplicate_handling: DuplicateHandling,
}

fn import_record_doc(record: &Value) -> Option<Document> {
    mongodb::bson::to_bson(record)
        .ok()
        .and_then(|b| b.as_document().cloned())
}

/// Imports a list of accounts with full duplicate control: `skip`,
/// `replace`, `merge`, or `interactive` (conflicts are returned for the
/// caller to resolve instead of being applied).
pub async fn import_users(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<ImportUsersRequest>,
) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ImportData) {
        return resp;
    }

    let records: Vec<Value> = match &payload.users {
        Value::Array(records) => records.clone(),
        single => vec![single.clone()],
    };
    let handling = payload.duplicate_handling;
    let catalog = Catalog::mongo(&data.mongodb.db);

    let mut success = vec![];
    let mut errors = vec![];
    let mut duplicates = vec![];
    let mut merged_out = vec![];
    let mut conflicts_out = vec![];

    for record in &records {
        let username = record
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();

        let outcome = import_one_user(&catalog.users, record, handling).await;
        match outcome {
            Ok(UserImportOutcome::Created { id, email }) => {
                success.push(json!({ "id": id, "username": username, "email": email }));
            }
            Ok(UserImportOutcome::Skipped { duplicate_type, existing_id }) => {
                duplicates.push(json!({
                    "username": username,
                    "message": "Skipped - duplicate found",
                    "duplicateType": duplicate_type,
                    "existingId": existing_id,
                }));
            }
            Ok(UserImportOutcome::Applied { id, action, duplicate_type, changes }) => {
                let mut entry = json!({
                    "id": id,
                    "username": username,
                    "action": action,
                    "duplicateType": duplicate_type,
                });
                if let (Some(map), Some(changes)) = (entry.as_object_mut(), changes) {
                    map.insert("changesCount".to_string(), json!(changes.len()));
                    map.insert(
                        "changes".to_string(),
                        serde_json::to_value(&changes).unwrap_or(Value::Null),
                    );
                }
                merged_out.push(entry);
            }
            Ok(UserImportOutcome::Conflict { existing, duplicate_type, conflicts }) => {
                conflicts_out.push(json!({
                    "username": username,
                    "existingUser": existing,
                    "incomingData": record,
                    "duplicateType": duplicate_type,
                    "conflicts": serde_json::to_value(&conflicts).unwrap_or(Value::Null),
                }));
            }
            Err(error) => {
                errors.push(json!({ "username": username, "error": error }));
            }
        }
    }

    let mut message = format!("Import completed: {} created", success.len());
    if !merged_out.is_empty() {
        message.push_str(&format!(", {} merged", merged_out.len()));
    }
    if !duplicates.is_empty() {
        message.push_str(&format!(", {} skipped", duplicates.len()));
    }
    if !conflicts_out.is_empty() {
        message.push_str(&format!(", {} conflicts need resolution", conflicts_out.len()));
    }

    HttpResponse::Ok().json(json!({
        "message": message,
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

enum UserImportOutcome {
    Created {
        id: String,
        email: String,
    },
    Skipped {
        duplicate_type: &'static str,
        existing_id: String,
    },
    Applied {
        id: String,
        action: &'static str,
        duplicate_type: &'static str,
        changes: Option<Vec<crate::merge::FieldChange>>,
    },
    Conflict {
        existing: Value,
        duplicate_type: &'static str,
        conflicts: Vec<crate::merge::FieldConflict>,
    },
}

async fn import_one_user<S: DocumentStore>(
    users: &S,
    record: &Value,
    handling: DuplicateHandling,
) -> Result<UserImportOutcome, String> {
    let username = record.get("username").and_then(Value::as_str).unwrap_or("");
    if username.len() < 3 {
        return Err("Username must be at least 3 characters long".to_string());
    }
    let password = record.get("password").and_then(Value::as_str).unwrap_or("");
    if let Some(problem) = validate_password(password) {
        return Err(problem.to_string());
    }
    if record.get("email").and_then(Value::as_str).unwrap_or("").is_empty() {
        return Err("Email is required".to_string());
    }

    let mut incoming = import_record_doc(record).ok_or("Invalid record structure")?;
    incoming.remove("password");
    incoming.remove("id");
    incoming.remove("students");
    incoming.remove("books");

    let found = find_user_duplicates(users, &incoming)
        .await
        .map_err(|e| e.to_string())?;

    if let Some(duplicate) = found.first() {
        let existing = &duplicate.existing;
        let existing_id = existing
            .get_object_id("_id")
            .map_err(|e| e.to_string())?;

        match handling {
            DuplicateHandling::Skip => {
                return Ok(UserImportOutcome::Skipped {
                    duplicate_type: duplicate.match_type,
                    existing_id: existing_id.to_hex(),
                });
            }
            DuplicateHandling::Replace | DuplicateHandling::Merge => {
                let strategy = if handling == DuplicateHandling::Replace {
                    MergeStrategy::Replace
                } else {
                    MergeStrategy::Merge
                };
                let merged = merge_entity(existing, &incoming, strategy, &USER_PROFILE);
                let outcome = apply_merge(existing, merged);
                let mut merged_doc = outcome.merged;

                // A supplied password re-hashes; otherwise the existing
                // credential stands (it is protected either way).
                if !password.trim().is_empty() {
                    let hashed = hash(password, DEFAULT_COST).map_err(|e| e.to_string())?;
                    merged_doc.insert("passwordHash", hashed);
                }

                let validated: User = from_document(merged_doc).map_err(|e| e.to_string())?;
                let mut patch = to_document(&validated).map_err(|e| e.to_string())?;
                patch.remove("_id");
                users
                    .update_by_id(&existing_id, doc! { "$set": patch })
                    .await
                    .map_err(|e| e.to_string())?;

                let action = if handling == DuplicateHandling::Replace {
                    "replaced"
                } else {
                    "merged"
                };
                let changes = (handling == DuplicateHandling::Merge).then_some(outcome.changes);
                return Ok(UserImportOutcome::Applied {
                    id: existing_id.to_hex(),
                    action,
                    duplicate_type: duplicate.match_type,
                    changes,
                });
            }
            DuplicateHandling::Interactive => {
                return Ok(UserImportOutcome::Conflict {
                    existing: json!({
                        "id": existing_id.to_hex(),
                        "username": existing.get_str("username").unwrap_or_default(),
                        "email": existing.get_str("email").unwrap_or_default(),
                        "name": existing.get_str("name").unwrap_or_default(),
                    }),
                    duplicate_type: duplicate.match_type,
                    conflicts: duplicate.conflicts.clone(),
                });
            }
        }
    }

    let hashed = hash(password, DEFAULT_COST).map_err(|e| e.to_string())?;
    incoming.insert("passwordHash", hashed);
    if !incoming.contains_key("createdAt") {
        incoming.insert("createdAt", crate::export::stored_date(chrono::Utc::now()));
    }
    let validated: User = from_document(incoming).map_err(|e| e.to_string())?;
    let id = users
        .insert(to_document(&validated).map_err(|e| e.to_string())?)
        .await
        .map_err(|e| e.to_string())?;
    Ok(UserImportOutcome::Created {
        id: id.to_hex(),
        email: validated.email,
    })
}

// ---------------------------------------------------------------------------
// Export / full backup
// ---------------------------------------------------------------------------

fn attachment(filename: &str) -> (&'static str, String) {
    (
        "Content-Disposition",
        format!("attachment; filename=\"{}\"", filename),
    )
}

fn date_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

#[derive(Debug, Deserialize)]
pub struct UserExportQuery {
    pub role: Option<String>,
}

pub async fn export_users_handler(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<UserExportQuery>,
) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ExportData) {
        return resp;
    }

    let filters = UserExportFilters { role: query.role.clone() };
    let catalog = Catalog::mongo(&data.mongodb.db);
    match export_users(&catalog.users, &filters, SanitizeOptions::default()).await {
        Ok(export) => HttpResponse::Ok()
            .insert_header(attachment(&format!("users-export-{}.json", date_stamp())))
            .json(export),
        Err(e) => {
            error!("Export error: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to export users" }))
        }
    }
}

pub async fn export_users_with_students_handler(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<UserExportQuery>,
) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ExportData) {
        return resp;
    }

    let filters = UserExportFilters { role: query.role.clone() };
    let catalog = Catalog::mongo(&data.mongodb.db);
    match export_users_with_students(&catalog, &filters, SanitizeOptions::default()).await {
        Ok(export) => HttpResponse::Ok()
            .insert_header(attachment(&format!(
                "users-with-students-export-{}.json",
                date_stamp()
            )))
            .json(export),
        Err(e) => {
            error!("Export error: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to export users with students" }))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportAllQuery {
    pub user_role: Option<String>,
    pub student_start_month: Option<String>,
    pub student_end_month: Option<String>,
    pub notification_start_date: Option<String>,
    pub notification_end_date: Option<String>,
    pub notification_target_type: Option<String>,
    pub book_availability: Option<String>,
    pub preserve_passwords: Option<String>,
}

pub async fn export_all_handler(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<ExportAllQuery>,
) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ExportData) {
        return resp;
    }

    let filters = AllExportFilters {
        users: UserExportFilters { role: query.user_role.clone() },
        students: StudentExportFilters {
            start_month: query.student_start_month.clone(),
            end_month: query.student_end_month.clone(),
            ..Default::default()
        },
        notifications: NotificationExportFilters {
            start_date: query.notification_start_date.clone(),
            end_date: query.notification_end_date.clone(),
            target_type: query.notification_target_type.clone(),
        },
        books: BookExportFilters { availability: query.book_availability.clone() },
        ..Default::default()
    };
    let options = SanitizeOptions {
        preserve_passwords: query.preserve_passwords.as_deref() != Some("false"),
    };

    let catalog = Catalog::mongo(&data.mongodb.db);
    match export_all(&catalog, &filters, options).await {
        Ok(backup) => {
            info!("Full system backup exported by {}", current.username);
            HttpResponse::Ok()
                .insert_header(attachment(&format!("system-backup-{}.json", date_stamp())))
                .json(backup)
        }
        Err(e) => {
            error!("Export error: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to export system data", "details": e.to_string() }))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportAllRequest {
    pub backup_data: Value,
    #[serde(default)]
    pub options: ImportOptions,
}

pub async fn import_all_handler(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<ImportAllRequest>,
) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ImportData) {
        return resp;
    }

    if !payload.backup_data.is_object() {
        return HttpResponse::BadRequest().json(json!({ "error": "Invalid backup data format" }));
    }

    let catalog = Catalog::mongo(&data.mongodb.db);
    let result = match import_all(&catalog, data.media.as_ref(), &payload.backup_data, &payload.options).await
    {
        Ok(result) => result,
        Err(ImportError::InvalidEnvelope) => {
            return HttpResponse::BadRequest()
                .json(json!({ "error": "Invalid backup file - must be a complete system backup" }))
        }
        Err(e) => {
            error!("Import error: {}", e);
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to restore system data", "details": e.to_string() }));
        }
    };

    let mut parts = vec![];
    for (count, noun) in [
        (result.summary.users.created, "users"),
        (result.summary.students.created, "students"),
        (result.summary.notifications.created, "notifications"),
        (result.summary.documents.created, "documents"),
        (result.summary.books.created, "books"),
        (result.summary.event_signups.created, "event signups"),
    ] {
        if count > 0 {
            parts.push(format!("{} {} created", count, noun));
        }
    }
    let message = if parts.is_empty() {
        "System restore completed: No new records created".to_string()
    } else {
        format!("System restore completed: {}", parts.join(", "))
    };

    let summary = json!({
        "totalProcessed": result.summary.total_processed,
        "totalCreated": result.summary.total_created,
        "totalErrors": result.summary.total_errors,
    });
    HttpResponse::Ok().json(json!({
        "message": message,
        "results": result,
        "summary": summary,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ClearDatabaseRequest {
    pub confirmation: String,
}

/// Wipes every collection except the calling admin's own account.
/// Requires the literal confirmation string; there is no undo.
pub async fn clear_database(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<ClearDatabaseRequest>,
) -> impl Responder {
    let current = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&current, Action::ClearDatabase) {
        return resp;
    }
    if payload.confirmation != "DELETE" {
        return HttpResponse::BadRequest()
            .json(json!({ "error": "Invalid confirmation. Type DELETE to confirm." }));
    }

    let db = &data.mongodb;
    let mut cleared = serde_json::Map::new();

    macro_rules! clear {
        ($name:literal, $coll:expr, $filter:expr) => {
            match $coll.delete_many($filter).await {
                Ok(result) => {
                    cleared.insert($name.to_string(), json!(result.deleted_count));
                }
                Err(e) => {
                    error!("Error clearing {}: {}", $name, e);
                    return internal_error();
                }
            }
        };
    }

    let self_filter = match current.id {
        Some(id) => doc! { "_id": { "$ne": id } },
        None => doc! {},
    };
    clear!("users", db.users(), self_filter);
    clear!("students", db.students(), doc! {});
    clear!("dashboards", db.dashboards(), doc! {});
    clear!("notifications", db.notifications(), doc! {});
    clear!("documents", db.documents(), doc! {});
    clear!("books", db.books(), doc! {});
    clear!("eventSignups", db.event_signups(), doc! {});

    info!("Database cleared by {}", current.username);
    HttpResponse::Ok().json(json!({
        "message": "Database cleared successfully",
        "clearedCounts": cleared,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "clearedBy": current.username,
    }))
}
