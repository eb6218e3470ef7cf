use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    #[serde(rename = "public")]
    Public,
    #[serde(rename = "student-specific")]
    StudentSpecific,
}

impl Default for TargetType {
    fn default() -> Self {
        TargetType::Public
    }
}

/// A notice shown to parents, either public or targeted at the parents of
/// specific students. May carry a single hosted attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<ObjectId>,
    #[serde(default)]
    pub target_type: TargetType,
    #[serde(default)]
    pub target_students: Vec<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_media_public_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}
