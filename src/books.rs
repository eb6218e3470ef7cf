use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures_util::StreamExt;
use log::{error, info};
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::auth::{authorize, require_user};
use crate::export::{export_books, stored_date, BookExportFilters};
use crate::models::{Book, LendingEntry, LendingState, Role};
use crate::policy::Action;
use crate::store::Catalog;

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
}

const DIFFICULTY_ORDER: &[&str] =
    &["Learning to Read", "Beginner", "Intermediate", "Advanced", "Expert"];

fn difficulty_rank(book: &Book) -> usize {
    book.difficulty
        .as_deref()
        .and_then(|d| DIFFICULTY_ORDER.iter().position(|x| *x == d))
        .unwrap_or(DIFFICULTY_ORDER.len())
}

#[derive(Debug, Deserialize)]
pub struct BookListQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
    pub search: Option<String>,
    pub language: Option<String>,
    pub difficulty: Option<String>,
    pub sort: Option<String>,
}

pub async fn list_books(data: web::Data<AppState>, query: web::Query<BookListQuery>) -> impl Responder {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(18).clamp(1, 100);

    let mut filter = doc! {};
    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = regex::escape(search);
        filter.insert(
            "$or",
            vec![
                doc! { "title": { "$regex": &pattern, "$options": "i" } },
                doc! { "author": { "$regex": &pattern, "$options": "i" } },
            ],
        );
    }
    if let Some(language) = &query.language {
        filter.insert("language", language);
    }
    if let Some(difficulty) = &query.difficulty {
        filter.insert("difficulty", difficulty);
    }

    let sort = match query.sort.as_deref() {
        Some("title-desc") => doc! { "title": -1 },
        Some("author-asc") => doc! { "author": 1 },
        Some("author-desc") => doc! { "author": -1 },
        _ => doc! { "title": 1 },
    };

    let books_coll = data.mongodb.books();
    let total = match books_coll.count_documents(filter.clone()).await {
        Ok(count) => count,
        Err(e) => {
            error!("Error counting books: {}", e);
            return internal_error();
        }
    };

    let mut cursor = match books_coll.find(filter).sort(sort).await {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error fetching books: {}", e);
            return internal_error();
        }
    };
    let mut books = vec![];
    while let Some(result) = cursor.next().await {
        match result {
            Ok(book) => books.push(book),
            Err(e) => {
                error!("Error reading books: {}", e);
                return internal_error();
            }
        }
    }

    // Difficulty has a domain order the database cannot sort by.
    match query.sort.as_deref() {
        Some("difficulty-asc") => books.sort_by_key(difficulty_rank),
        Some("difficulty-desc") => {
            books.sort_by_key(difficulty_rank);
            books.reverse();
        }
        _ => {}
    }

    let paged: Vec<&Book> = books.iter().skip((page - 1) * limit).take(limit).collect();
    let total_pages = (total as usize).div_ceil(limit);

    HttpResponse::Ok().json(json!({
        "books": paged,
        "totalBooks": total,
        "page": page,
        "totalPages": total_pages,
    }))
}

pub async fn list_languages(data: web::Data<AppState>) -> impl Responder {
    match data.mongodb.books().distinct("language", doc! {}).await {
        Ok(values) => {
            let languages: Vec<String> = values
                .into_iter()
                .filter_map(|v| match v {
                    Bson::String(s) if !s.is_empty() => Some(s),
                    _ => None,
                })
                .collect();
            HttpResponse::Ok().json(languages)
        }
        Err(_) => internal_error(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookRequest {
    pub title: String,
    pub author: Option<String>,
    pub url: Option<String>,
    pub language: Option<String>,
    pub difficulty: Option<String>,
}

pub async fn create_book(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateBookRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageBooks) {
        return resp;
    }
    if payload.title.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "Title is required" }));
    }

    let book = Book {
        id: None,
        title: payload.title.clone(),
        author: payload
            .author
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "Unknown Author".to_string()),
        url: payload.url.clone(),
        language: payload.language.clone(),
        difficulty: payload.difficulty.clone(),
        user: user.id,
        lending: Some(LendingState::default()),
        lending_history: vec![],
        created_at: Some(chrono::Utc::now()),
    };

    match data.mongodb.books().insert_one(&book).await {
        Ok(result) => {
            if let (Some(owner), Some(book_id)) = (user.id, result.inserted_id.as_object_id()) {
                let _ = data
                    .mongodb
                    .users()
                    .update_one(
                        doc! { "_id": owner },
                        doc! { "$addToSet": { "books": book_id } },
                    )
                    .await;
            }
            info!("Book added: {}", book.title);
            HttpResponse::Created().json(&book)
        }
        Err(e) => {
            error!("Error inserting book: {}", e);
            internal_error()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBookRequest {
    pub title: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub language: Option<String>,
    pub difficulty: Option<String>,
}

pub async fn update_book(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateBookRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageBooks) {
        return resp;
    }
    let book_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let mut update = doc! {};
    for (key, value) in [
        ("title", &payload.title),
        ("author", &payload.author),
        ("url", &payload.url),
        ("language", &payload.language),
        ("difficulty", &payload.difficulty),
    ] {
        if let Some(value) = value {
            update.insert(key, value);
        }
    }
    if update.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "No fields to update" }));
    }

    match data
        .mongodb
        .books()
        .find_one_and_update(doc! { "_id": book_id }, doc! { "$set": update })
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Ok().json(updated),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Book not found" })),
        Err(_) => internal_error(),
    }
}

pub async fn delete_book(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ManageBooks) {
        return resp;
    }
    let book_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let books = data.mongodb.books();
    let book = match books.find_one(doc! { "_id": book_id }).await {
        Ok(Some(book)) => book,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Book not found" })),
        Err(_) => return internal_error(),
    };
    // Tutors can only remove books they added; admins can remove any.
    if user.role != Role::Admin && book.user != user.id {
        return HttpResponse::Forbidden()
            .json(json!({ "error": "Only the owner or an admin can delete this book" }));
    }

    if books.delete_one(doc! { "_id": book_id }).await.is_err() {
        return internal_error();
    }
    if let Some(owner) = book.user {
        let _ = data
            .mongodb
            .users()
            .update_one(doc! { "_id": owner }, doc! { "$pull": { "books": book_id } })
            .await;
    }
    HttpResponse::NoContent().finish()
}

// ---------------------------------------------------------------------------
// Lending
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LendRequest {
    pub due_date: Option<chrono::DateTime<chrono::Utc>>,
}

/// Borrows the book for the calling user.
pub async fn lend_book(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<LendRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let book_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };
    let Some(borrower) = user.id else { return internal_error() };

    let books = data.mongodb.books();
    let book = match books.find_one(doc! { "_id": book_id }).await {
        Ok(Some(book)) => book,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Book not found" })),
        Err(_) => return internal_error(),
    };
    if book.lending.as_ref().and_then(|l| l.borrower).is_some() {
        return HttpResponse::BadRequest().json(json!({ "error": "Book is already lent out" }));
    }

    let mut lending = doc! {
        "borrower": borrower,
        "lentDate": stored_date(chrono::Utc::now()),
        "returnRequested": false,
    };
    if let Some(due) = payload.due_date {
        lending.insert("dueDate", stored_date(due));
    }

    match books
        .find_one_and_update(doc! { "_id": book_id }, doc! { "$set": { "lending": lending } })
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => {
            info!("Book '{}' lent to {}", updated.title, user.username);
            HttpResponse::Ok().json(updated)
        }
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Book not found" })),
        Err(_) => internal_error(),
    }
}

/// Returns the book and appends the closed loan to the history log.
pub async fn return_book(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let book_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let books = data.mongodb.books();
    let book = match books.find_one(doc! { "_id": book_id }).await {
        Ok(Some(book)) => book,
        Ok(None) => return HttpResponse::NotFound().json(json!({ "error": "Book not found" })),
        Err(_) => return internal_error(),
    };
    let Some(lending) = book.lending.as_ref().filter(|l| l.borrower.is_some()) else {
        return HttpResponse::BadRequest().json(json!({ "error": "Book is not lent out" }));
    };
    let borrower = lending.borrower.unwrap();

    // The borrower returns their own loan; staff can return for anyone.
    if user.role == Role::User && user.id != Some(borrower) {
        return HttpResponse::Forbidden().json(json!({ "error": "Permission denied" }));
    }

    let history_entry = LendingEntry {
        user: borrower,
        lent_date: lending.lent_date,
        returned_date: Some(chrono::Utc::now()),
    };
    let entry = match mongodb::bson::to_bson(&history_entry) {
        Ok(entry) => entry,
        Err(_) => return internal_error(),
    };

    match books
        .find_one_and_update(
            doc! { "_id": book_id },
            doc! {
                "$push": { "lendingHistory": entry },
                "$set": { "lending": { "borrower": Bson::Null, "returnRequested": false } },
            },
        )
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Ok().json(updated),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Book not found" })),
        Err(_) => internal_error(),
    }
}

/// Flags or clears a return request on a lent book. `action` is `request`,
/// `approve` (staff) or `decline` (staff).
pub async fn return_request(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let (book_raw, action) = path.into_inner();
    let book_id = match ObjectId::parse_str(&book_raw) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    let staff = user.role == Role::Admin || user.role == Role::Tutor;
    let requested = match action.as_str() {
        "request" => true,
        "approve" | "decline" if staff => false,
        "approve" | "decline" => {
            return HttpResponse::Forbidden().json(json!({ "error": "Permission denied" }))
        }
        _ => return HttpResponse::BadRequest().json(json!({ "error": "Unknown action" })),
    };

    match data
        .mongodb
        .books()
        .find_one_and_update(
            doc! { "_id": book_id, "lending.borrower": { "$ne": Bson::Null } },
            doc! { "$set": { "lending.returnRequested": requested } },
        )
        .return_document(mongodb::options::ReturnDocument::After)
        .await
    {
        Ok(Some(updated)) => HttpResponse::Ok().json(updated),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "Book not found or not lent" })),
        Err(_) => internal_error(),
    }
}

pub async fn clear_history(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if user.role != Role::Admin {
        return HttpResponse::Forbidden().json(json!({ "error": "Permission denied" }));
    }
    let book_id = match ObjectId::parse_str(path.as_str()) {
        Ok(id) => id,
        Err(_) => return HttpResponse::BadRequest().json(json!({ "error": "Malformatted id" })),
    };

    match data
        .mongodb
        .books()
        .update_one(
            doc! { "_id": book_id },
            doc! { "$set": { "lendingHistory": Vec::<Document>::new() } },
        )
        .await
    {
        Ok(result) if result.matched_count > 0 => {
            HttpResponse::Ok().json(json!({ "message": "Lending history cleared" }))
        }
        Ok(_) => HttpResponse::NotFound().json(json!({ "error": "Book not found" })),
        Err(_) => internal_error(),
    }
}

// ---------------------------------------------------------------------------
// Export / import
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BookExportQuery {
    pub availability: Option<String>,
}

pub async fn export_books_handler(
    req: HttpRequest,
    data: web::Data<AppState>,
    query: web::Query<BookExportQuery>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ExportData) {
        return resp;
    }

    let filters = BookExportFilters { availability: query.availability.clone() };
    let catalog = Catalog::mongo(&data.mongodb.db);
    match export_books(&catalog, &filters).await {
        Ok(export) => {
            let stamp = chrono::Utc::now().format("%Y-%m-%d");
            HttpResponse::Ok()
                .insert_header((
                    "Content-Disposition",
                    format!("attachment; filename=\"books-export-{}.json\"", stamp),
                ))
                .json(export)
        }
        Err(e) => {
            error!("Export error: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Failed to export books" }))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBooksRequest {
    pub books: Value,
    #[serde(default)]
    pub duplicate_handling: crate::merge::DuplicateHandling,
}

/// Imports a list of books through the same record pipeline the full
/// restore uses (alias-based borrower resolution, skip/merge duplicates).
pub async fn import_books(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<ImportBooksRequest>,
) -> impl Responder {
    let user = match require_user(&req, &data).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&user, Action::ImportData) {
        return resp;
    }

    let records: Vec<Value> = match &payload.books {
        Value::Array(records) => records.clone(),
        single => vec![single.clone()],
    };
    let catalog = Catalog::mongo(&data.mongodb.db);

    let report = crate::import::import_book_records(&catalog, &records, payload.duplicate_handling)
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
