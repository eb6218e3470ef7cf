// src/main.rs

mod app_state;
mod auth;
mod books;
mod calendar_settings;
mod config;
mod dashboards;
mod db;
mod documents;
mod event_signups;
mod export;
mod ga_documents;
mod import;
mod media;
mod merge;
mod models;
mod notifications;
mod policy;
mod sanitize;
mod store;
mod students;
mod users;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_cors::Cors;
use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http,
    middleware::Logger,
    web, App, Error, HttpMessage, HttpResponse, HttpServer,
};
use env_logger::Env;
use futures::future::{ok, Ready};

use crate::app_state::AppState;
use crate::auth::{login, verify_token};
use crate::media::CloudinaryHost;

#[derive(Debug)]
pub struct Authentication {
    jwt_secret: String,
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddleware {
            service,
            jwt_secret: self.jwt_secret.clone(),
        })
    }
}

pub struct AuthMiddleware<S> {
    service: S,
    jwt_secret: String,
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        // Extract "Bearer <token>" from the Authorization header if present
        if let Some(auth_header) = req.headers().get(http::header::AUTHORIZATION) {
            if let Ok(auth_str) = auth_header.to_str() {
                if auth_str.starts_with("Bearer ") {
                    let token = auth_str.trim_start_matches("Bearer ").trim().to_string();
                    match verify_token(&token, &self.jwt_secret) {
                        Ok(user_id) => {
                            // Insert user_id as a string extension
                            req.extensions_mut().insert(user_id);
                        }
                        Err(e) => {
                            let (req_parts, _payload) = req.into_parts();
                            let resp = HttpResponse::Unauthorized()
                                .body(format!("Invalid token: {}", e))
                                .map_into_boxed_body();
                            let srv_resp = ServiceResponse::new(req_parts, resp);
                            return Box::pin(async move { Ok(srv_resp) });
                        }
                    }
                }
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_boxed_body())
        })
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = config::Config::from_env();
    let mongodb = Arc::new(db::MongoDB::init(&config.mongo_uri, &config.database_name).await);
    let media = Arc::new(CloudinaryHost::from_url(config.media_url.as_deref()));

    let frontend_origin = config.frontend_origin.clone();
    let jwt_secret = config.jwt_secret.clone();

    println!("Server running at http://0.0.0.0:8080");
    println!("Allowed CORS Origin: {}", frontend_origin);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend_origin)
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                http::header::CONTENT_TYPE,
                http::header::ACCEPT,
                http::header::AUTHORIZATION,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Authentication {
                jwt_secret: jwt_secret.clone(),
            })
            .app_data(web::Data::new(AppState {
                mongodb: mongodb.clone(),
                media: media.clone(),
                config: config.clone(),
            }))
            .service(
                web::scope("/api/login")
                    .route("", web::post().to(login))
            )
            // USERS + backup surface
            .service(
                web::scope("/api/users")
                    .route("", web::get().to(users::list_users))
                    .route("", web::post().to(users::create_user))
                    .route("/archived/all", web::get().to(users::list_archived_users))
                    .route("/template", web::get().to(users::user_template))
                    .route("/import", web::post().to(users::import_users))
                    .route("/import-all", web::post().to(users::import_all_handler))
                    .route("/export", web::get().to(users::export_users_handler))
                    .route("/export-with-students", web::get().to(users::export_users_with_students_handler))
                    .route("/export-all", web::get().to(users::export_all_handler))
                    .route("/clear-database", web::post().to(users::clear_database))
                    .route("/{id}", web::put().to(users::update_user))
                    .route("/{id}", web::delete().to(users::delete_user))
                    .route("/{id}/role", web::put().to(users::change_role))
                    .route("/{id}/ga-member", web::put().to(users::set_ga_member))
                    .route("/{id}/archive", web::put().to(users::archive_user))
                    .route("/{id}/unarchive", web::put().to(users::unarchive_user))
            )
            // STUDENTS
            .service(
                web::scope("/api/students")
                    .route("", web::get().to(students::list_students))
                    .route("", web::post().to(students::create_student))
                    .route("/archived/all", web::get().to(students::list_archived_students))
                    .route("/export", web::get().to(students::export_students_handler))
                    .route("/import", web::post().to(students::import_students))
                    .route("/{id}", web::get().to(students::get_student))
                    .route("/{id}", web::put().to(students::update_student))
                    .route("/{id}", web::delete().to(students::delete_student))
                    .route("/{id}/archive", web::put().to(students::archive_student))
                    .route("/{id}/unarchive", web::put().to(students::unarchive_student))
                    .route("/{id}/wishlist", web::post().to(students::add_wishlist_book))
                    .route("/{id}/wishlist/{book_id}", web::delete().to(students::remove_wishlist_book))
            )
            // DASHBOARDS
            .service(
                web::scope("/api/dashboards")
                    .route("/{student_id}", web::get().to(dashboards::get_dashboard))
                    .route("/{student_id}/portfolios", web::post().to(dashboards::add_portfolio))
                    .route("/{student_id}/portfolios/{file_name}", web::delete().to(dashboards::delete_portfolio))
                    .route("/{student_id}/documents", web::post().to(dashboards::add_dashboard_document))
                    .route("/{student_id}/documents/{name}", web::delete().to(dashboards::delete_dashboard_document))
                    .route("/{student_id}/history", web::post().to(dashboards::add_history_event))
            )
            // BOOKS
            .service(
                web::scope("/api/books")
                    .route("", web::get().to(books::list_books))
                    .route("", web::post().to(books::create_book))
                    .route("/languages", web::get().to(books::list_languages))
                    .route("/export", web::get().to(books::export_books_handler))
                    .route("/import", web::post().to(books::import_books))
                    .route("/{id}", web::put().to(books::update_book))
                    .route("/{id}", web::delete().to(books::delete_book))
                    .route("/{id}/lend", web::put().to(books::lend_book))
                    .route("/{id}/return", web::put().to(books::return_book))
                    .route("/{id}/return-request/{action}", web::put().to(books::return_request))
                    .route("/{id}/clear-history", web::put().to(books::clear_history))
            )
            // NOTIFICATIONS
            .service(
                web::scope("/api/notifications")
                    .route("", web::get().to(notifications::list_notifications))
                    .route("", web::post().to(notifications::create_notification))
                    .route("/export", web::get().to(notifications::export_notifications_handler))
                    .route("/{id}", web::delete().to(notifications::delete_notification))
            )
            // DOCUMENT SECTIONS
            .service(
                web::scope("/api/documents")
                    .route("", web::get().to(documents::list_sections))
                    .route("", web::post().to(documents::create_section))
                    .route("/export", web::get().to(documents::export_documents_handler))
                    .route("/import", web::post().to(documents::import_documents_handler))
                    .route("/{id}", web::put().to(documents::update_section))
                    .route("/{id}", web::delete().to(documents::delete_section))
                    .route("/{id}/urls", web::post().to(documents::add_url_entry))
                    .route("/{id}/files/{name}", web::delete().to(documents::delete_entry))
            )
            // GA DOCUMENT SECTIONS
            .service(
                web::scope("/api/ga-documents")
                    .route("", web::get().to(ga_documents::list_sections))
                    .route("", web::post().to(ga_documents::create_section))
                    .route("/{id}", web::delete().to(ga_documents::delete_section))
                    .route("/{id}/entries", web::post().to(ga_documents::add_entry))
                    .route("/{id}/entries/{name}/uploads", web::post().to(ga_documents::add_member_upload))
            )
            // EVENT SIGNUPS
            .service(
                web::scope("/api/event-signups")
                    .route("", web::get().to(event_signups::list_events))
                    .route("", web::post().to(event_signups::create_event))
                    .route("/export", web::get().to(event_signups::export_event_signups_handler))
                    .route("/{id}", web::get().to(event_signups::get_event))
                    .route("/{id}", web::put().to(event_signups::update_event))
                    .route("/{id}", web::delete().to(event_signups::delete_event))
                    .route("/{id}/signups", web::post().to(event_signups::signup_for_event))
                    .route("/{id}/signups/{user_id}", web::delete().to(event_signups::withdraw_signup))
            )
            // CALENDAR SETTINGS
            .service(
                web::scope("/api/calendar-settings")
                    .route("", web::get().to(calendar_settings::get_settings))
                    .route("", web::put().to(calendar_settings::update_settings))
            )
    })
        .bind("0.0.0.0:8080")?
        .run()
        .await
}
