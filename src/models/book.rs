use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// A library book. `(title, author)` is the duplicate-detection key on
/// import; the catalogue itself allows repeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub title: String,
    #[serde(default = "unknown_author")]
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    /// Owning account (who added the book to the library).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lending: Option<LendingState>,
    #[serde(default)]
    pub lending_history: Vec<LendingEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Current loan, if any. `borrower: None` means the book is on the shelf.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LendingState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub borrower: Option<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lent_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub return_requested: bool,
}

/// Append-only log of past loans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LendingEntry {
    pub user: ObjectId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lent_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returned_date: Option<DateTime<Utc>>,
}

fn unknown_author() -> String {
    "Unknown Author".to_string()
}
