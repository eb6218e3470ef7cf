use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// An enrolled (or previously enrolled) child. Belongs to exactly one
/// parent account via `user_id`. The `(first_name, last_name,
/// date_of_birth)` triple is the natural key used when a backup is
/// imported; it is not enforced as a unique index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<ObjectId>,
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nationality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passport_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passport_expiry_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nif_number: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment_length: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekday_attendance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment_start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment_end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub siblings: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub english_proficiency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub english_reading_writing: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portuguese_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skills_hobbies: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub struggling_subjects: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approach: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub curriculum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub curriculum_supplier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub curriculum_notes: Option<String>,

    #[serde(default)]
    pub behavioral_challenges: bool,
    #[serde(default)]
    pub learning_differences: bool,
    #[serde(default)]
    pub physical_limitations: bool,
    #[serde(default)]
    pub health_conditions: bool,
    #[serde(default)]
    pub daily_medication: bool,
    #[serde(default)]
    pub medical_treatments: bool,
    #[serde(default)]
    pub allergies: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_needs_details: Option<String>,
    #[serde(default)]
    pub life_threatening: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medical_details: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default = "default_true")]
    pub billing_address_same_as_home: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_street_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_country: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_notes: Option<String>,
    #[serde(default)]
    pub signed_tuition_agreement: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referral_source: Option<String>,
    /// Free-form tag set; a merge replaces this list wholesale rather than
    /// unioning it, so deselected tags do not resurrect.
    #[serde(default)]
    pub motivation_for_joining: Vec<String>,

    #[serde(default)]
    pub photo_consent: bool,
    #[serde(default)]
    pub contact_list_consent: bool,
    #[serde(default)]
    pub terms_and_conditions: bool,
    #[serde(default)]
    pub personal_data_consent: bool,

    #[serde(default)]
    pub wishlist: Vec<ObjectId>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}
