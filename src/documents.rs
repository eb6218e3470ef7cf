use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures_util::StreamExt;
use log::{error, info};
use mongodb::bson::{doc, oid::ObjectId};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::auth::{authorize, require_user};
use crate::export::export_documents;
use crate::media::MediaHost;
use crate::models::{DocumentEntry, DocumentSection};
use crate::policy::Action;
use crate::store::Catalog;

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
}

pub async fn list_sections(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    if let Err(resp) = require_user(&req, &data).await {
        return resp;
    }

    let mut cursor = match data
        .mongodb
        .documents()
        .find(doc! {})
        .sort(doc! { "order": 1, "createdAt": -1 })
        .await
    {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error listing document sections: {}", e);
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
pub struct CreateSectionRequest {
    pub title: String,
    pub description: Option<String>,
    pub order: Option<i32>,
}

pub async fn create_section(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateSectionRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageDocuments) {
        return resp;
    }
    if payload.title.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "Title is required" }));
    }

    let section = DocumentSection {
        id: None,
        title: payload.title.clone(),
        description: payload.description.clone(),
        documents: vec![],
        created_by: user.id,
        order: payload.order.unwrap_or(0),
        created_at: Some(chrono::Utc::now()),
    };

    match data.mongodb.documents().insert_one(&section).await {
        Ok(_) => {
            info!("Document section created: {}", section.title);
            HttpResponse::Created().json(&section)
        }
        Err(e) => {
            error!("Error inserting document section: {}", e);
            internal_error()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSectionRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub order: Option<i32>,
}

pub async fn update_section(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateSectionRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageDocuments) {
        return resp;
    }
    let section_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let mut update = doc! {};
    if let Some(title) = &payload.title {
        update.insert("title", title);
    }
    if let Some(description) = &payload.description {
        update.insert("description", description);
    }
    if let Some(order) = payload.order {
        update.insert("order", order);
    }
    if update.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "No fields to update" }));
    }

    match data
        .mongodb
        .documents()
        .find_one_and_update(doc! { "_id": section_id }, doc! { "$set": update })
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Ok().json(updated),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Section not found" })),
        Err(_) => internal_error(),
    }
}

/// Deletes the section and every hosted file it references.
pub async fn delete_section(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageDocuments) {
        return resp;
    }
    let section_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let documents = data.mongodb.documents();
    let section = match documents.find_one(doc! { "_id": section_id }).await {
        Ok(Some(section)) => section,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Section not found" })),
        Err(_) => return internal_error(),
    };

    for entry in &section.documents {
        if let Some(url) = &entry.file_url {
            if let Err(e) = data.media.delete(url).await {
                error!("Media host deletion failed for {}: {}", entry.name, e);
            }
        }
    }

    match documents.delete_one(doc! { "_id": section_id }).await {
        Ok(_) => HttpResponse::NoContent().finish(),
        Err(_) => internal_error(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUrlEntryRequest {
    pub name: String,
    pub url: String,
    pub file_type: Option<String>,
}

/// Adds an external-URL entry to a section (hosted-file entries arrive
/// through the media upload flow and are registered the same way).
pub async fn add_url_entry(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<AddUrlEntryRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageDocuments) {
        return resp;
    }
    let section_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let entry = DocumentEntry {
        name: payload.name.clone(),
        file_name: None,
        file_url: Some(payload.url.clone()),
        file_type: payload.file_type.clone(),
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
        .documents()
        .update_one(doc! { "_id": section_id }, doc! { "$push": { "documents": entry } })
        .await
    {
        Ok(result) if result.matched_count > 0 => {
            HttpResponse::Created().json(json!({ "message": "Document added" }))
        }
        Ok(_) => HttpResponse::NotFound().json(json!({ "error": "Section not found" })),
        Err(_) => internal_error(),
    }
}

pub async fn delete_entry(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageDocuments) {
        return resp;
    }
    let (section_raw, name) = path.into_inner();
    let section_id = match ObjectId::parse_str(&section_raw) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let documents = data.mongodb.documents();
    let section = match documents.find_one(doc! { "_id": section_id }).await {
        Ok(Some(section)) => section,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Section not found" })),
        Err(_) => return internal_error(),
    };
    let Some(entry) = section.documents.iter().find(|d| d.name == name) else {
        return HttpResponse::NotFound().json(json!({ "error": "Document not found" }));
    };

    if let Some(url) = &entry.file_url {
        if let Err(e) = data.media.delete(url).await {
            error!("Media host deletion failed for {}: {}", entry.name, e);
        }
    }

    match documents
        .update_one(
            doc! { "_id": section_id },
            doc! { "$pull": { "documents": { "name": &name } } },
        )
        .await
    {
        Ok(_) => HttpResponse::Ok().json(json!({ "message": "Document removed" })),
        Err(_) => internal_error(),
    }
}

pub async fn export_documents_handler(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ExportData) {
        return resp;
    }

    let catalog = Catalog::mongo(&data.mongodb.db);
    match export_documents(&catalog.documents).await {
        Ok(export) => {
            let stamp = chrono::Utc::now().format("%Y-%m-%d");
            HttpResponse::Ok()
                .insert_header((
                    "Content-Disposition",
                    format!("attachment; filename=\"documents-export-{}.json\"", stamp),
                ))
                .json(export)
        }
        Err(e) => {
            error!("Export error: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to export documents" }))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSectionsRequest {
    pub documents: Value,
    #[serde(default)]
    pub duplicate_handling: crate::merge::DuplicateHandling,
}

pub async fn import_documents_handler(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<ImportSectionsRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ImportData) {
        return resp;
    }

    let records: Vec<Value> = match &payload.documents {
        Value::Array(records) => records.clone(),
        single => vec![single.clone()],
    };
    let catalog = Catalog::mongo(&data.mongodb.db);
    let report = crate::import::import_document_records(
        &catalog,
        data.media.as_ref(),
        &records,
        payload.duplicate_handling,
    )
    .await;

    let summary = json!({
        "total": records.len(),
        "created": report.success.len(),
        "merged": report.merged.len(),
        "skipped": report.duplicates.len(),
        "errors": report.errors.len(),
    });
    HttpResponse::Ok().json(json!({ "results": report, "summary": summary }))
}
