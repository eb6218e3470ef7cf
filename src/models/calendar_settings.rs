use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// Singleton document holding the embedded calendar URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarSettings {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub desktop_calendar_url: String,
    pub mobile_calendar_url: String,
}
