use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures_util::StreamExt;
use log::error;
use mongodb::bson::{doc, oid::ObjectId};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::{authorize, require_user};
use crate::models::{GaContentType, GaDocumentEntry, GaDocumentSection, Role, UserUpload};
use crate::policy::Action;

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
}

fn ga_member_only(user: &crate::models::User) -> Option<HttpResponse> {
    if user.role == Role::Admin || user.is_ga_member {
        None
    } else {
        Some(
            HttpResponse::Forbidden()
                .json(json!({ "error": "General Assembly membership required" })),
        )
    }
}

pub async fn list_sections(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Some(resp) = ga_member_only(&user) {
        return resp;
    }

    let mut cursor = match data
        .mongodb
        .ga_documents()
        .find(doc! {})
        .sort(doc! { "order": 1, "createdAt": -1 })
        .await
    {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error listing GA document sections: {}", e);
            return internal_error();
        }
    };
    let mut sections = vec![];
    while let Some(Ok(section)) = cursor.next().await {
        sections.push(section);
    }
    HttpResponse::Ok().json(sections)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGaSectionRequest {
    pub title: String,
    pub description: Option<String>,
    pub order: Option<i32>,
}

pub async fn create_section(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateGaSectionRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageGaDocuments) {
        return resp;
    }
    if payload.title.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "Title is required" }));
    }

    let section = GaDocumentSection {
        id: None,
        title: payload.title.clone(),
        description: payload.description.clone(),
        documents: vec![],
        created_by: user.id,
        order: payload.order.unwrap_or(0),
        created_at: Some(chrono::Utc::now()),
    };

    match data.mongodb.ga_documents().insert_one(&section).await {
        Ok(_) => HttpResponse::Created().json(&section),
        Err(e) => {
            error!("Error inserting GA section: {}", e);
            internal_error()
        }
    }
}

pub async fn delete_section(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageGaDocuments) {
        return resp;
    }
    let section_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    match data.mongodb.ga_documents().delete_one(doc! { "_id": section_id }).await {
        Ok(result) if result.deleted_count > 0 => HttpResponse::NoContent().finish(),
        Ok(_) => HttpResponse::NotFound().json(json!({ "error": "Section not found" })),
        Err(_) => internal_error(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddGaEntryRequest {
    pub name: String,
    #[serde(default)]
    pub content_type: GaContentType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub text_content: Option<String>,
    #[serde(default)]
    pub allow_user_uploads: bool,
}

/// Adds an entry to a GA section: a hosted/external file, an inline text
/// block, or an upload area collecting member submissions.
pub async fn add_entry(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<AddGaEntryRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageGaDocuments) {
        return resp;
    }
    let section_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    match payload.content_type {
        GaContentType::Text if payload.text_content.is_none() => {
            return HttpResponse::BadRequest()
                .json(json!({ "error": "Text entries need textContent" }));
        }
        GaContentType::File if payload.file_url.is_none() => {
            return HttpResponse::BadRequest().json(json!({ "error": "File entries need fileUrl" }));
        }
        _ => {}
    }

    let entry = GaDocumentEntry {
        name: payload.name.clone(),
        content_type: payload.content_type,
        file_name: payload.file_name.clone(),
        file_url: payload.file_url.clone(),
        file_type: payload.file_type.clone(),
        text_content: payload.text_content.clone(),
        allow_user_uploads: payload.allow_user_uploads
            || payload.content_type == GaContentType::UploadArea,
        user_uploads: vec![],
        upload_date: Some(chrono::Utc::now()),
        uploaded_by: user.id,
        media_public_id: None,
    };
    let entry = match mongodb::bson::to_bson(&entry) {
        Ok(entry) => entry,
        Err(_) => return internal_error(),
    };

    match data
        .mongodb
        .ga_documents()
        .update_one(doc! { "_id": section_id }, doc! { "$push": { "documents": entry } })
        .await
    {
        Ok(result) if result.matched_count > 0 => {
            HttpResponse::Created().json(json!({ "message": "Entry added" }))
        }
        Ok(_) => HttpResponse::NotFound().json(json!({ "error": "Section not found" })),
        Err(_) => internal_error(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberUploadRequest {
    pub file_url: String,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub user_description: Option<String>,
}

/// Registers a member-submitted file inside an upload-area entry.
pub async fn add_member_upload(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    payload: web::Json<MemberUploadRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Some(resp) = ga_member_only(&user) {
        return resp;
    }
    let (section_raw, entry_name) = path.into_inner();
    let section_id = match ObjectId::parse_str(&section_raw) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };
    let Some(user_id) = user.id else { return internal_error() };

    let sections = data.mongodb.ga_documents();
    let section = match sections.find_one(doc! { "_id": section_id }).await {
        Ok(Some(section)) => section,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Section not found" })),
        Err(_) => return internal_error(),
    };
    let Some(entry) = section.documents.iter().find(|d| d.name == entry_name) else {
        return HttpResponse::NotFound().json(json!({ "error": "Entry not found" }));
    };
    if !entry.allow_user_uploads {
        return HttpResponse::BadRequest()
            .json(json!({ "error": "This entry does not accept uploads" }));
    }

    let upload = UserUpload {
        file_name: payload.file_name.clone(),
        file_url: Some(payload.file_url.clone()),
        file_type: payload.file_type.clone(),
        media_public_id: None,
        uploaded_by: user_id,
        upload_date: Some(chrono::Utc::now()),
        user_description: payload.user_description.clone(),
    };
    let upload = match mongodb::bson::to_bson(&upload) {
        Ok(upload) => upload,
        Err(_) => return internal_error(),
    };

    match sections
        .update_one(
            doc! { "_id": section_id, "documents.name": &entry_name },
            doc! { "$push": { "documents.$.userUploads": upload } },
        )
        .await
    {
        Ok(result) if result.matched_count > 0 => {
            HttpResponse::Created().json(json!({ "message": "Upload registered" }))
        }
        Ok(_) => HttpResponse::NotFound().json(json!({ "error": "Entry not found" })),
        Err(_) => internal_error(),
    }
}
