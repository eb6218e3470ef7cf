use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures_util::StreamExt;
use log::{error, info};
use mongodb::bson::{doc, oid::ObjectId};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::{authorize, require_user};
use crate::export::{export_event_signups, stored_date, EventSignupExportFilters};
use crate::models::{EventSignup, Role, Signup};
use crate::policy::Action;
use crate::store::Catalog;

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
}

pub async fn list_events(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    if let Err(resp) = require_user(&req, &data).await {
        return resp;
    }

    let mut cursor = match data
        .mongodb
        .event_signups()
        .find(doc! {})
        .sort(doc! { "eventDate": 1 })
        .await
    {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error listing events: {}", e);
            return internal_error();
        }
    };
    let mut events = vec![];
    while let Some(Ok(event)) = cursor.next().await {
        events.push(event);
    }
    HttpResponse::Ok().json(events)
}

pub async fn get_event(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    if let Err(resp) = require_user(&req, &data).await {
        return resp;
    }
    let event_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    match data.mongodb.event_signups().find_one(doc! { "_id": event_id }).await {
        Ok(Some(event)) => HttpResponse::Ok().json(event),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Event not found" })),
        Err(_) => internal_error(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    pub event_title: String,
    pub event_date: chrono::DateTime<chrono::Utc>,
    pub event_description: Option<String>,
    pub google_calendar_link: Option<String>,
    pub max_signups: Option<u32>,
    pub is_active: Option<bool>,
}

pub async fn create_event(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateEventRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageEvents) {
        return resp;
    }
    if payload.event_title.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "Event title is required" }));
    }

    let event = EventSignup {
        id: None,
        event_title: payload.event_title.clone(),
        event_date: payload.event_date,
        event_description: payload.event_description.clone(),
        google_calendar_link: payload.google_calendar_link.clone(),
        signups: vec![],
        max_signups: payload.max_signups,
        is_active: payload.is_active.unwrap_or(true),
        created_by: user.id,
        created_at: Some(chrono::Utc::now()),
        updated_at: Some(chrono::Utc::now()),
    };

    match data.mongodb.event_signups().insert_one(&event).await {
        Ok(_) => {
            info!("Event created: {}", event.event_title);
            HttpResponse::Created().json(&event)
        }
        Err(e) => {
            error!("Error inserting event: {}", e);
            internal_error()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEventRequest {
    pub event_title: Option<String>,
    pub event_date: Option<chrono::DateTime<chrono::Utc>>,
    pub event_description: Option<String>,
    pub google_calendar_link: Option<String>,
    pub max_signups: Option<u32>,
    pub is_active: Option<bool>,
}

pub async fn update_event(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateEventRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageEvents) {
        return resp;
    }
    let event_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let mut update = doc! {};
    if let Some(title) = &payload.event_title {
        update.insert("eventTitle", title);
    }
    if let Some(date) = payload.event_date {
        update.insert("eventDate", stored_date(date));
    }
    if let Some(description) = &payload.event_description {
        update.insert("eventDescription", description);
    }
    if let Some(link) = &payload.google_calendar_link {
        update.insert("googleCalendarLink", link);
    }
    if let Some(max) = payload.max_signups {
        update.insert("maxSignups", max);
    }
    if let Some(active) = payload.is_active {
        update.insert("isActive", active);
    }
    if update.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "No fields to update" }));
    }
    update.insert("updatedAt", stored_date(chrono::Utc::now()));

    match data
        .mongodb
        .event_signups()
        .find_one_and_update(doc! { "_id": event_id }, doc! { "$set": update })
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Ok().json(updated),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Event not found" })),
        Err(_) => internal_error(),
    }
}

pub async fn delete_event(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageEvents) {
        return resp;
    }
    let event_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    match data.mongodb.event_signups().delete_one(doc! { "_id": event_id }).await {
        Ok(result) if result.deleted_count > 0 => HttpResponse::NoContent().finish(),
        Ok(_) => HttpResponse::NotFound().json(json!({ "error": "Event not found" })),
        Err(_) => internal_error(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub responsibility: Option<String>,
    pub notes: Option<String>,
}

/// Signs the calling user up for the event. One signup per user; closed or
/// full events refuse.
pub async fn signup_for_event(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<SignupRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let event_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };
    let Some(user_id) = user.id else { return internal_error() };

    let events = data.mongodb.event_signups();
    let event = match events.find_one(doc! { "_id": event_id }).await {
        Ok(Some(event)) => event,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Event not found" })),
        Err(_) => return internal_error(),
    };

    if !event.is_active {
        return HttpResponse::BadRequest().json(json!({ "error": "Event is not active" }));
    }
    if event.signups.iter().any(|s| s.user_id == user_id) {
        return HttpResponse::BadRequest()
            .json(json!({ "error": "Already signed up for this event" }));
    }
    if let Some(max) = event.max_signups {
        if event.signups.len() as u32 >= max {
            return HttpResponse::BadRequest().json(json!({ "error": "Event is full" }));
        }
    }

    let signup = Signup {
        user_id,
        user_name: user.name.clone().unwrap_or_else(|| user.username.clone()),
        responsibility: payload.responsibility.clone(),
        notes: payload.notes.clone(),
        created_at: Some(chrono::Utc::now()),
        updated_at: Some(chrono::Utc::now()),
    };
    let entry = match mongodb::bson::to_bson(&signup) {
        Ok(entry) => entry,
        Err(_) => return internal_error(),
    };

    match events
        .find_one_and_update(
            doc! { "_id": event_id },
            doc! {
                "$push": { "signups": entry },
                "$set": { "updatedAt": stored_date(chrono::Utc::now()) },
            },
        )
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Created().json(updated),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Event not found" })),
        Err(_) => internal_error(),
    }
}

/// Withdraws a signup. Users withdraw themselves; admins can withdraw
/// anyone by user id.
pub async fn withdraw_signup(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let (event_raw, target_raw) = path.into_inner();
    let event_id = match ObjectId::parse_str(&event_raw) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };
    let target_id = match ObjectId::parse_str(&target_raw) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    if user.role != Role::Admin && user.id != Some(target_id) {
        return HttpResponse::Forbidden().json(json!({ "error": "Permission denied" }));
    }

    match data
        .mongodb
        .event_signups()
        .update_one(
            doc! { "_id": event_id },
            doc! { "$pull": { "signups": { "userId": target_id } } },
        )
        .await
    {
        Ok(result) if result.matched_count > 0 => {
            HttpResponse::Ok().json(json!({ "message": "Signup withdrawn" }))
        }
        Ok(_) => HttpResponse::NotFound().json(json!({ "error": "Event not found" })),
        Err(_) => internal_error(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventExportQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn export_event_signups_handler(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<EventExportQuery>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ExportData) {
        return resp;
    }

    let filters = EventSignupExportFilters {
        start_date: query.start_date.clone(),
        end_date: query.end_date.clone(),
        is_active: query.is_active,
    };
    let catalog = Catalog::mongo(&data.mongodb.db);
    match export_event_signups(&catalog, &filters).await {
        Ok(export) => {
            let stamp = chrono::Utc::now().format("%Y-%m-%d");
            HttpResponse::Ok()
                .insert_header((
                    "Content-Disposition",
                    format!("attachment; filename=\"event-signups-export-{}.json\"", stamp),
                ))
                .json(export)
        }
        Err(e) => {
            error!("Export error: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to export event signups" }))
        }
    }
}
