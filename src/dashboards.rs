use actix_web::{web, HttpRequest, HttpResponse, Responder};
use log::{error, info};
use mongodb::bson::{doc, oid::ObjectId, to_bson};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::require_user;
use crate::media::MediaHost;
use crate::models::{Dashboard, HistoryEvent, Role, Student, User};

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
}

async fn load_student_checked(
    data: &web::Data<AppState>,
    user: &User,
    student_raw: &str,
) -> Result<Student, HttpResponse> {
    let student_id = ObjectId::parse_str(student_raw)
        .map_err(|_| HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })))?;
    let student = data
        .mongodb
        .students()
        .find_one(doc! { "_id": student_id })
        .await
        .map_err(|_| internal_error())?
        .ok_or_else(|| HttpResponse::NotFound().json(json!({ "error": "Student not found" })))?;

    let allowed =
        user.role == Role::Admin || user.role == Role::Tutor || student.user_id == user.id;
    if !allowed {
        return Err(HttpResponse::Forbidden().json(json!({ "error": "Permission denied" })));
    }
    Ok(student)
}

/// Returns the student's dashboard; a student without one gets an empty
/// dashboard rather than a 404.
pub async fn get_dashboard(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let student = match load_student_checked(&data, &user, path.as_str()).await {
        Ok(student) => student,
        Err(resp) => return resp,
    };
    let student_id = match student.id {
        Some(id) => id,
        None => return internal_error(),
    };

    match data
        .mongodb
        .dashboards()
        .find_one(doc! { "studentId": student_id })
        .await
    {
        Ok(Some(dashboard)) => HttpResponse::Ok().json(dashboard),
        Ok(None) => HttpResponse::Ok().json(Dashboard {
            id: None,
            student_id,
            portfolios: vec![],
            documents: vec![],
            history: vec![],
            created_at: None,
            updated_at: None,
        }),
        Err(e) => {
            error!("Error loading dashboard: {}", e);
            internal_error()
        }
    }
}

async fn ensure_dashboard(
    data: &web::Data<AppState>,
    student_id: ObjectId,
) -> Result<Dashboard, HttpResponse> {
    let dashboards = data.mongodb.dashboards();
    if let Some(dashboard) = dashboards
        .find_one(doc! { "studentId": student_id })
        .await
        .map_err(|_| internal_error())?
    {
        return Ok(dashboard);
    }

    let fresh = Dashboard {
        id: None,
        student_id,
        portfolios: vec![],
        documents: vec![],
        history: vec![],
        created_at: Some(chrono::Utc::now()),
        updated_at: Some(chrono::Utc::now()),
    };
    let inserted = dashboards
        .insert_one(&fresh)
        .await
        .map_err(|_| internal_error())?;
    Ok(Dashboard {
        id: inserted.inserted_id.as_object_id(),
        ..fresh
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPortfolioRequest {
    pub pdf_url: String,
    pub file_name: String,
    pub media_public_id: Option<String>,
}

pub async fn add_portfolio(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<AddPortfolioRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let student = match load_student_checked(&data, &user, path.as_str()).await {
        Ok(student) => student,
        Err(resp) => return resp,
    };
    let Some(student_id) = student.id else { return internal_error() };
    let dashboard = match ensure_dashboard(&data, student_id).await {
        Ok(dashboard) => dashboard,
        Err(resp) => return resp,
    };

    let entry = doc! {
        "pdfUrl": &payload.pdf_url,
        "fileName": &payload.file_name,
        "mediaPublicId": payload.media_public_id.as_deref().unwrap_or_default(),
        "uploadDate": crate::export::stored_date(chrono::Utc::now()),
    };
    match data
        .mongodb
        .dashboards()
        .update_one(
            doc! { "_id": dashboard.id },
            doc! {
                "$push": { "portfolios": entry },
                "$set": { "updatedAt": crate::export::stored_date(chrono::Utc::now()) },
            },
        )
        .await
    {
        Ok(_) => {
            info!("Portfolio added for student {}", student_id);
            HttpResponse::Created().json(json!({ "message": "Portfolio added" }))
        }
        Err(e) => {
            error!("Error adding portfolio: {}", e);
            internal_error()
        }
    }
}

/// Removes a portfolio by file name and asks the media host to drop the
/// hosted file. Host failures only log; the entry is gone either way.
pub async fn delete_portfolio(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let (student_raw, file_name) = path.into_inner();
    let student = match load_student_checked(&data, &user, &student_raw).await {
        Ok(student) => student,
        Err(resp) => return resp,
    };
    let Some(student_id) = student.id else { return internal_error() };

    let dashboards = data.mongodb.dashboards();
    let dashboard = match dashboards.find_one(doc! { "studentId": student_id }).await {
        Ok(Some(dashboard)) => dashboard,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Dashboard not found" })),
        Err(_) => return internal_error(),
    };
    let Some(entry) = dashboard.portfolios.iter().find(|p| p.file_name == file_name) else {
        return HttpResponse::NotFound().json(json!({ "error": "Portfolio not found" }));
    };

    if let Err(e) = data.media.delete(&entry.pdf_url).await {
        error!("Media host deletion failed for {}: {}", entry.file_name, e);
    }

    match dashboards
        .update_one(
            doc! { "_id": dashboard.id },
            doc! { "$pull": { "portfolios": { "fileName": &file_name } } },
        )
        .await
    {
        Ok(_) => HttpResponse::Ok().json(json!({ "message": "Portfolio removed" })),
        Err(_) => internal_error(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDashboardDocumentRequest {
    pub name: String,
    pub url: String,
    pub file_name: Option<String>,
    pub media_public_id: Option<String>,
}

pub async fn add_dashboard_document(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<AddDashboardDocumentRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let student = match load_student_checked(&data, &user, path.as_str()).await {
        Ok(student) => student,
        Err(resp) => return resp,
    };
    let Some(student_id) = student.id else { return internal_error() };
    let dashboard = match ensure_dashboard(&data, student_id).await {
        Ok(dashboard) => dashboard,
        Err(resp) => return resp,
    };

    let mut entry = doc! {
        "name": &payload.name,
        "url": &payload.url,
        "uploadDate": crate::export::stored_date(chrono::Utc::now()),
    };
    if let Some(file_name) = &payload.file_name {
        entry.insert("fileName", file_name);
    }
    if let Some(public_id) = &payload.media_public_id {
        entry.insert("mediaPublicId", public_id);
    }

    match data
        .mongodb
        .dashboards()
        .update_one(
            doc! { "_id": dashboard.id },
            doc! { "$push": { "documents": entry } },
        )
        .await
    {
        Ok(_) => HttpResponse::Created().json(json!({ "message": "Document added" })),
        Err(_) => internal_error(),
    }
}

pub async fn delete_dashboard_document(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let (student_raw, name) = path.into_inner();
    let student = match load_student_checked(&data, &user, &student_raw).await {
        Ok(student) => student,
        Err(resp) => return resp,
    };
    let Some(student_id) = student.id else { return internal_error() };

    let dashboards = data.mongodb.dashboards();
    let dashboard = match dashboards.find_one(doc! { "studentId": student_id }).await {
        Ok(Some(dashboard)) => dashboard,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Dashboard not found" })),
        Err(_) => return internal_error(),
    };
    let Some(entry) = dashboard.documents.iter().find(|d| d.name == name) else {
        return HttpResponse::NotFound().json(json!({ "error": "Document not found" }));
    };

    if let Err(e) = data.media.delete(&entry.url).await {
        error!("Media host deletion failed for {}: {}", entry.name, e);
    }

    match dashboards
        .update_one(
            doc! { "_id": dashboard.id },
            doc! { "$pull": { "documents": { "name": &name } } },
        )
        .await
    {
        Ok(_) => HttpResponse::Ok().json(json!({ "message": "Document removed" })),
        Err(_) => internal_error(),
    }
}

/// Appends a history event (enrollment milestones, receipts, donations).
pub async fn add_history_event(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<HistoryEvent>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if user.role != Role::Admin {
        return HttpResponse::Forbidden().json(json!({ "error": "Permission denied" }));
    }
    let student = match load_student_checked(&data, &user, path.as_str()).await {
        Ok(student) => student,
        Err(resp) => return resp,
    };
    let Some(student_id) = student.id else { return internal_error() };
    let dashboard = match ensure_dashboard(&data, student_id).await {
        Ok(dashboard) => dashboard,
        Err(resp) => return resp,
    };

    let event = match to_bson(&payload.into_inner()) {
        Ok(event) => event,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Invalid event" })),
    };
    match data
        .mongodb
        .dashboards()
        .update_one(
            doc! { "_id": dashboard.id },
            doc! {
                "$push": { "history": event },
                "$set": { "updatedAt": crate::export::stored_date(chrono::Utc::now()) },
            },
        )
        .await
    {
        Ok(_) => HttpResponse::Created().json(json!({ "message": "History event added" })),
        Err(e) => {
            error!("Error adding history event: {}", e);
            internal_error()
        }
    }
}
