use actix_web::{web, HttpRequest, HttpResponse, Responder};
use log::error;
use mongodb::bson::doc;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::{authorize, require_user};
use crate::policy::Action;

const DEFAULT_DESKTOP_URL: &str = "https://calendar.google.com/calendar/embed?height=600&wkst=2&showPrint=0&showTitle=0";
const DEFAULT_MOBILE_URL: &str = "https://calendar.google.com/calendar/embed?height=600&wkst=2&showPrint=0&showTitle=0&mode=AGENDA";

pub async fn get_settings(data: web::Data<AppState>) -> impl Responder {
    match data.mongodb.calendar_settings().find_one(doc! {}).await {
        Ok(Some(settings)) => HttpResponse::Ok().json(settings),
        Ok(None) => HttpResponse::Ok().json(json!({
            "desktopCalendarUrl": DEFAULT_DESKTOP_URL,
            "mobileCalendarUrl": DEFAULT_MOBILE_URL,
        })),
        Err(e) => {
            error!("Error loading calendar settings: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    pub desktop_calendar_url: Option<String>,
    pub mobile_calendar_url: Option<String>,
}

pub async fn update_settings(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<UpdateSettingsRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageCalendarSettings) {
        return resp;
    }

    let mut update = doc! {};
    if let Some(desktop) = &payload.desktop_calendar_url {
        update.insert("desktopCalendarUrl", desktop);
    }
    if let Some(mobile) = &payload.mobile_calendar_url {
        update.insert("mobileCalendarUrl", mobile);
    }
    if update.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "No fields to update" }));
    }

    match data
        .mongodb
        .calendar_settings()
        .update_one(doc! {}, doc! { "$set": update })
        .upsert(true)
        .await
    {
        Ok(_) => match data.mongodb.calendar_settings().find_one(doc! {}).await {
            Ok(Some(settings)) => HttpResponse::Ok().json(settings),
            _ => HttpResponse::Ok().json(json!({ "message": "Settings updated" })),
        },
        Err(e) => {
            error!("Error updating calendar settings: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}
