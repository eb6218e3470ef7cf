use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures_util::StreamExt;
use log::{error, info};
use mongodb::bson::{doc, oid::ObjectId, Bson};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::{authorize, require_user};
use crate::export::{export_notifications, NotificationExportFilters};
use crate::media::MediaHost;
use crate::models::{Notification, Role, TargetType};
use crate::policy::Action;
use crate::store::Catalog;

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
}

/// Visibility: admins see everything, tutors see public notices plus their
/// own, parents additionally see notices targeted at their students.
pub async fn list_notifications(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let filter = match user.role {
        Role::Admin => doc! {},
        Role::Tutor => doc! {
            "$or": [
                { "targetType": "public" },
                { "createdBy": user.id },
            ],
        },
        Role::User => {
            let mut student_ids: Vec<Bson> = vec![];
            if let Some(user_id) = user.id {
                if let Ok(mut cursor) = data
                    .mongodb
                    .students()
                    .find(doc! { "userId": user_id })
                    .await
                {
                    while let Some(Ok(student)) = cursor.next().await {
                        if let Some(id) = student.id {
                            student_ids.push(Bson::ObjectId(id));
                        }
                    }
                }
            }
            doc! {
                "$or": [
                    { "targetType": "public" },
                    { "createdBy": user.id },
                    { "targetType": "student-specific", "targetStudents": { "$in": student_ids } },
                ],
            }
        }
    };

    let mut cursor = match data
        .mongodb
        .notifications()
        .find(filter)
        .sort(doc! { "createdAt": -1 })
        .await
    {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error listing notifications: {}", e);
            return internal_error();
        }
    };
    let mut notifications = vec![];
    while let Some(Ok(notification)) = cursor.next().await {
        notifications.push(notification);
    }
    HttpResponse::Ok().json(notifications)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationRequest {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub target_type: TargetType,
    #[serde(default)]
    pub target_students: Vec<String>,
    pub attachment_url: Option<String>,
    pub attachment_file_name: Option<String>,
    pub attachment_file_type: Option<String>,
    pub attachment_media_public_id: Option<String>,
}

pub async fn create_notification(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateNotificationRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageNotifications) {
        return resp;
    }
    if payload.title.is_empty() || payload.message.is_empty() {
        return HttpResponse::BadRequest()
            .json(json!({ "error": "Title and message are required" }));
    }

    let mut target_students = vec![];
    for raw in &payload.target_students {
        match ObjectId::parse_str(raw) {
            Ok(id) => target_students.push(id),
            Err(_) => {
                return HttpResponse::BadRequest().json(json!({ "error": "Invalid student id" }))
            }
        }
    }
    if payload.target_type == TargetType::StudentSpecific && target_students.is_empty() {
        return HttpResponse::BadRequest()
            .json(json!({ "error": "Student-specific notifications need target students" }));
    }

    let notification = Notification {
        id: None,
        title: payload.title.clone(),
        message: payload.message.clone(),
        created_by: user.id,
        target_type: payload.target_type,
        target_students,
        attachment_url: payload.attachment_url.clone(),
        attachment_file_name: payload.attachment_file_name.clone(),
        attachment_file_type: payload.attachment_file_type.clone(),
        attachment_media_public_id: payload.attachment_media_public_id.clone(),
        created_at: Some(chrono::Utc::now()),
    };

    match data.mongodb.notifications().insert_one(&notification).await {
        Ok(_) => {
            info!("Notification created: {}", notification.title);
            HttpResponse::Created().json(&notification)
        }
        Err(e) => {
            error!("Error inserting notification: {}", e);
            internal_error()
        }
    }
}

/// Deletes the notice and its hosted attachment, if any. The creator or an
/// admin may delete.
pub async fn delete_notification(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let notification_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let notifications = data.mongodb.notifications();
    let notification = match notifications.find_one(doc! { "_id": notification_id }).await {
        Ok(Some(notification)) => notification,
        Ok(None) => {
            return HttpResponse::NotFound().json(json!({ "error": "Notification not found" }))
        }
        Err(_) => return internal_error(),
    };
    if user.role != Role::Admin && notification.created_by != user.id {
        return HttpResponse::Forbidden().json(json!({ "error": "Permission denied" }));
    }

    if let Some(url) = &notification.attachment_url {
        if let Err(e) = data.media.delete(url).await {
            error!("Media host deletion failed for notification attachment: {}", e);
        }
    }

    match notifications.delete_one(doc! { "_id": notification_id }).await {
        Ok(_) => HttpResponse::NoContent().finish(),
        Err(_) => internal_error(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationExportQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub target_type: Option<String>,
}

pub async fn export_notifications_handler(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<NotificationExportQuery>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ExportData) {
        return resp;
    }

    let filters = NotificationExportFilters {
        start_date: query.start_date.clone(),
        end_date: query.end_date.clone(),
        target_type: query.target_type.clone(),
    };
    let catalog = Catalog::mongo(&data.mongodb.db);
    match export_notifications(&catalog.notifications, &filters).await {
        Ok(export) => {
            let stamp = chrono::Utc::now().format("%Y-%m-%d");
            HttpResponse::Ok()
                .insert_header((
                    "Content-Disposition",
                    format!("attachment; filename=\"notifications-export-{}.json\"", stamp),
                ))
                .json(export)
        }
        Err(e) => {
            error!("Export error: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "error": "Failed to export notifications" }))
        }
    }
}
