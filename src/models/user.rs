use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// Account role, checked through the permission table in `policy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Tutor,
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

/// A parent/staff account. Students and books hold back-references here;
/// those two lists are system-owned and never writable through a merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub username: String,
    pub email: String,
    /// Absent for accounts restored from a backup exported without passwords.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "isGAMember", default)]
    pub is_ga_member: bool,
    #[serde(default = "default_true")]
    pub email_notifications: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_street_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_nationality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_passport_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_passport_expiry_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_nif_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_contact_relationship: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_contact_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_contact_number: Option<String>,
    /// Failed-login counter; the account locks after five misses.
    #[serde(default)]
    pub login_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub students: Vec<ObjectId>,
    #[serde(default)]
    pub books: Vec<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}
