//! Merge engine for the backup import path: a generic deep merge over BSON
//! documents, per-entity field policies, conflict detection and duplicate
//! lookup by natural key.

use chrono::Utc;
use mongodb::bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

use crate::store::{DocumentStore, StoreError};

/// Caller-selected policy for records whose natural key matches an
/// existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateHandling {
    Skip,
    Replace,
    Merge,
    Interactive,
}

impl Default for DuplicateHandling {
    fn default() -> Self {
        DuplicateHandling::Skip
    }
}

/// Entity-level merge strategy. `Merge` is the deep merge where empty
/// incoming values lose; `PreferIncoming` lets empty incoming values win;
/// `Replace` is a shallow overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Replace,
    Merge,
    PreferIncomingNonEmpty,
    PreferIncoming,
}

/// Strategy for the recursive pass itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeepStrategy {
    PreferIncoming,
    PreferIncomingNonEmpty,
    /// Union arrays instead of replacing them. Reserved for free-form tag
    /// sets; never applied to cumulative record arrays, which have their
    /// own append policy.
    MergeArrays,
}

/// Per-entity schema annotation consumed by the engine: which fields a
/// merge must never overwrite, and which arrays deviate from the default
/// replace-wholesale rule.
pub struct MergeProfile {
    /// Never overwritten by incoming data, whatever the strategy.
    pub protected: &'static [&'static str],
    /// Cumulative records: `Merge` appends incoming entries to existing.
    pub append_arrays: &'static [&'static str],
    /// Tag sets: `Merge` replaces wholesale even when the generic pass
    /// would have kept the existing list.
    pub replace_arrays: &'static [&'static str],
}

pub const USER_PROFILE: MergeProfile = MergeProfile {
    protected: &["_id", "passwordHash", "createdAt", "students", "books"],
    append_arrays: &[],
    replace_arrays: &[],
};

pub const STUDENT_PROFILE: MergeProfile = MergeProfile {
    protected: &["_id", "createdAt"],
    append_arrays: &[],
    replace_arrays: &["motivationForJoining"],
};

pub const DASHBOARD_PROFILE: MergeProfile = MergeProfile {
    protected: &["_id", "createdAt", "studentId"],
    append_arrays: &["portfolios", "documents", "history"],
    replace_arrays: &[],
};

/// Notifications, document sections, books and event signups share the
/// minimal policy.
pub const GENERIC_PROFILE: MergeProfile = MergeProfile {
    protected: &["_id", "createdAt"],
    append_arrays: &[],
    replace_arrays: &[],
};

/// Empty in the merge sense: absent values, null, and the empty string.
/// Empty arrays and documents are values, not blanks.
fn is_empty(value: &Bson) -> bool {
    match value {
        Bson::Null => true,
        Bson::String(s) => s.is_empty(),
        _ => false,
    }
}

fn deep_merge(existing: &Document, incoming: &Document, strategy: DeepStrategy) -> Document {
    let mut result = existing.clone();

    for (key, incoming_value) in incoming {
        if strategy != DeepStrategy::PreferIncoming && is_empty(incoming_value) {
            continue;
        }

        let merged = match (result.get(key), incoming_value) {
            (Some(Bson::Array(existing_arr)), Bson::Array(incoming_arr))
                if strategy == DeepStrategy::MergeArrays =>
            {
                let mut union = existing_arr.clone();
                for item in incoming_arr {
                    if !union.contains(item) {
                        union.push(item.clone());
                    }
                }
                Bson::Array(union)
            }
            (Some(Bson::Document(existing_doc)), Bson::Document(incoming_doc)) => {
                Bson::Document(deep_merge(existing_doc, incoming_doc, strategy))
            }
            _ => incoming_value.clone(),
        };
        result.insert(key.clone(), merged);
    }

    result
}

/// Merges `incoming` onto `existing` under the given strategy and profile.
/// Protected fields are re-stamped from `existing` last, so no strategy can
/// corrupt identity, credentials or ownership lists.
pub fn merge_entity(
    existing: &Document,
    incoming: &Document,
    strategy: MergeStrategy,
    profile: &MergeProfile,
) -> Document {
    let mut clean = incoming.clone();
    for field in profile.protected {
        clean.remove(*field);
    }

    let mut merged = match strategy {
        MergeStrategy::Replace => {
            let mut overlay = existing.clone();
            for (key, value) in &clean {
                overlay.insert(key.clone(), value.clone());
            }
            overlay
        }
        MergeStrategy::Merge | MergeStrategy::PreferIncomingNonEmpty => {
            deep_merge(existing, &clean, DeepStrategy::PreferIncomingNonEmpty)
        }
        MergeStrategy::PreferIncoming => {
            deep_merge(existing, &clean, DeepStrategy::PreferIncoming)
        }
    };

    if strategy == MergeStrategy::Merge {
        for field in profile.append_arrays {
            if let Some(Bson::Array(incoming_arr)) = clean.get(*field) {
                let mut combined = existing
                    .get_array(*field)
                    .cloned()
                    .unwrap_or_default();
                combined.extend(incoming_arr.iter().cloned());
                merged.insert(*field, combined);
            }
        }
        for field in profile.replace_arrays {
            if let Some(value @ Bson::Array(_)) = clean.get(*field) {
                merged.insert(*field, value.clone());
            }
        }
    }

    for field in profile.protected {
        if let Some(value) = existing.get(*field) {
            merged.insert(*field, value.clone());
        }
    }

    merged
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub field: String,
    pub existing_value: Bson,
    pub incoming_value: Bson,
}

/// A conflict is a field where both sides hold a real value and the values
/// differ. Empty incoming fields never conflict, consistent with the merge
/// default of keeping the existing value.
pub fn detect_conflicts(
    existing: &Document,
    incoming: &Document,
    profile: &MergeProfile,
) -> Vec<FieldConflict> {
    let mut conflicts = vec![];

    for (key, incoming_value) in incoming {
        if profile.protected.contains(&key.as_str()) {
            continue;
        }
        let existing_value = match existing.get(key) {
            Some(v) if !is_empty(v) => v,
            _ => continue,
        };
        if is_empty(incoming_value) || existing_value == incoming_value {
            continue;
        }
        conflicts.push(FieldConflict {
            field: key.clone(),
            existing_value: existing_value.clone(),
            incoming_value: incoming_value.clone(),
        });
    }

    conflicts
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: String,
    pub old_value: Bson,
    pub new_value: Bson,
    pub timestamp: String,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub merged: Document,
    pub changes: Vec<FieldChange>,
}

/// Computes the audit trail for a merge: one entry per top-level field
/// whose merged value differs from the original. Surfaced to the caller,
/// never persisted.
pub fn apply_merge(existing: &Document, merged: Document) -> MergeOutcome {
    let timestamp = Utc::now().to_rfc3339();
    let mut changes = vec![];

    for (key, new_value) in &merged {
        if existing.get(key) != Some(new_value) {
            changes.push(FieldChange {
                field: key.clone(),
                old_value: existing.get(key).cloned().unwrap_or(Bson::Null),
                new_value: new_value.clone(),
                timestamp: timestamp.clone(),
            });
        }
    }

    MergeOutcome { merged, changes }
}

// ---------------------------------------------------------------------------
// Duplicate detection
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DuplicateMatch {
    /// Which natural key matched ("username", "email", "name-dob", ...).
    pub match_type: &'static str,
    pub field: &'static str,
    pub value: String,
    pub existing: Document,
    pub conflicts: Vec<FieldConflict>,
}

fn non_empty_str<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    match doc.get_str(key) {
        Ok(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// Users match on username first, then on email when that resolves to a
/// different account. Returns at most two matches; callers act on the first.
pub async fn find_user_duplicates<S: DocumentStore>(
    store: &S,
    incoming: &Document,
) -> Result<Vec<DuplicateMatch>, StoreError> {
    let mut duplicates = vec![];

    if let Some(username) = non_empty_str(incoming, "username") {
        if let Some(existing) = store.find_one(doc! { "username": username }).await? {
            duplicates.push(DuplicateMatch {
                match_type: "username",
                field: "username",
                value: username.to_string(),
                conflicts: detect_conflicts(&existing, incoming, &USER_PROFILE),
                existing,
            });
        }
    }

    if let Some(email) = non_empty_str(incoming, "email") {
        let already_found = duplicates
            .first()
            .and_then(|d| d.existing.get_str("email").ok())
            .map(|e| e == email)
            .unwrap_or(false);
        if !already_found {
            if let Some(existing) = store.find_one(doc! { "email": email }).await? {
                let same_record = match (
                    duplicates.first().and_then(|d| d.existing.get_object_id("_id").ok()),
                    existing.get_object_id("_id").ok(),
                ) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                };
                if !same_record {
                    duplicates.push(DuplicateMatch {
                        match_type: "email",
                        field: "email",
                        value: email.to_string(),
                        conflicts: detect_conflicts(&existing, incoming, &USER_PROFILE),
                        existing,
                    });
                }
            }
        }
    }

    Ok(duplicates)
}

/// Students match on the full `(firstName, lastName, dateOfBirth)` triple;
/// an incomplete key is a pass, not an error.
pub async fn find_student_duplicates<S: DocumentStore>(
    store: &S,
    incoming: &Document,
) -> Result<Vec<DuplicateMatch>, StoreError> {
    let (first, last) = match (
        non_empty_str(incoming, "firstName"),
        non_empty_str(incoming, "lastName"),
    ) {
        (Some(f), Some(l)) => (f, l),
        _ => return Ok(vec![]),
    };
    let dob = match incoming.get("dateOfBirth") {
        Some(d) if !is_empty(d) => d.clone(),
        _ => return Ok(vec![]),
    };

    let filter = doc! { "firstName": first, "lastName": last, "dateOfBirth": dob.clone() };
    let Some(existing) = store.find_one(filter).await? else {
        return Ok(vec![]);
    };

    Ok(vec![DuplicateMatch {
        match_type: "name-dob",
        field: "firstName + lastName + dateOfBirth",
        value: format!("{} {} ({})", first, last, display_bson(&dob)),
        conflicts: detect_conflicts(&existing, incoming, &STUDENT_PROFILE),
        existing,
    }])
}

pub async fn find_book_duplicates<S: DocumentStore>(
    store: &S,
    incoming: &Document,
) -> Result<Vec<DuplicateMatch>, StoreError> {
    let Some(title) = non_empty_str(incoming, "title") else {
        return Ok(vec![]);
    };
    let author = incoming.get_str("author").unwrap_or("");

    let Some(existing) = store.find_one(doc! { "title": title, "author": author }).await? else {
        return Ok(vec![]);
    };

    Ok(vec![DuplicateMatch {
        match_type: "title-author",
        field: "title + author",
        value: format!("{} ({})", title, author),
        conflicts: detect_conflicts(&existing, incoming, &GENERIC_PROFILE),
        existing,
    }])
}

pub async fn find_notification_duplicates<S: DocumentStore>(
    store: &S,
    incoming: &Document,
) -> Result<Vec<DuplicateMatch>, StoreError> {
    let (title, message) = match (
        non_empty_str(incoming, "title"),
        non_empty_str(incoming, "message"),
    ) {
        (Some(t), Some(m)) => (t, m),
        _ => return Ok(vec![]),
    };

    let Some(existing) = store.find_one(doc! { "title": title, "message": message }).await? else {
        return Ok(vec![]);
    };

    Ok(vec![DuplicateMatch {
        match_type: "title-message",
        field: "title + message",
        value: title.to_string(),
        conflicts: detect_conflicts(&existing, incoming, &GENERIC_PROFILE),
        existing,
    }])
}

pub async fn find_document_duplicates<S: DocumentStore>(
    store: &S,
    incoming: &Document,
) -> Result<Vec<DuplicateMatch>, StoreError> {
    let Some(title) = non_empty_str(incoming, "title") else {
        return Ok(vec![]);
    };

    let Some(existing) = store.find_one(doc! { "title": title }).await? else {
        return Ok(vec![]);
    };

    Ok(vec![DuplicateMatch {
        match_type: "title",
        field: "title",
        value: title.to_string(),
        conflicts: detect_conflicts(&existing, incoming, &GENERIC_PROFILE),
        existing,
    }])
}

pub async fn find_event_signup_duplicates<S: DocumentStore>(
    store: &S,
    incoming: &Document,
) -> Result<Vec<DuplicateMatch>, StoreError> {
    let Some(title) = non_empty_str(incoming, "eventTitle") else {
        return Ok(vec![]);
    };
    let date = match incoming.get("eventDate") {
        Some(d) if !is_empty(d) => d.clone(),
        _ => return Ok(vec![]),
    };

    let filter = doc! { "eventTitle": title, "eventDate": date.clone() };
    let Some(existing) = store.find_one(filter).await? else {
        return Ok(vec![]);
    };

    Ok(vec![DuplicateMatch {
        match_type: "title-date",
        field: "eventTitle + eventDate",
        value: format!("{} ({})", title, display_bson(&date)),
        conflicts: detect_conflicts(&existing, incoming, &GENERIC_PROFILE),
        existing,
    }])
}

fn display_bson(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;

    fn existing_user() -> Document {
        doc! {
            "_id": ObjectId::new(),
            "username": "parent1",
            "email": "parent1@example.com",
            "passwordHash": "$2b$10$abcdef",
            "name": "First Parent",
            "createdAt": "2023-01-01T00:00:00Z",
            "students": [ObjectId::new()],
        }
    }

    #[test]
    fn merge_prefers_non_empty_incoming() {
        let existing = existing_user();
        let incoming = doc! {
            "email": "parent1@new.example",
            "name": "",
            "contactNumber": "+351 123 456 789",
        };

        let merged = merge_entity(&existing, &incoming, MergeStrategy::Merge, &USER_PROFILE);

        assert_eq!(merged.get_str("email").unwrap(), "parent1@new.example");
        // Empty incoming name loses against the existing value.
        assert_eq!(merged.get_str("name").unwrap(), "First Parent");
        assert_eq!(merged.get_str("contactNumber").unwrap(), "+351 123 456 789");
    }

    #[test]
    fn prefer_incoming_lets_empty_values_win() {
        let existing = existing_user();
        let incoming = doc! { "name": "" };

        let merged = merge_entity(
            &existing,
            &incoming,
            MergeStrategy::PreferIncoming,
            &USER_PROFILE,
        );
        assert_eq!(merged.get_str("name").unwrap(), "");
    }

    #[test]
    fn protected_fields_survive_every_strategy() {
        let existing = existing_user();
        let incoming = doc! {
            "_id": ObjectId::new(),
            "passwordHash": "evil",
            "createdAt": "2099-01-01T00:00:00Z",
            "students": [],
            "username": "parent1",
            "email": "changed@example.com",
        };

        for strategy in [
            MergeStrategy::Replace,
            MergeStrategy::Merge,
            MergeStrategy::PreferIncomingNonEmpty,
            MergeStrategy::PreferIncoming,
        ] {
            let merged = merge_entity(&existing, &incoming, strategy, &USER_PROFILE);
            assert_eq!(
                merged.get_object_id("_id").unwrap(),
                existing.get_object_id("_id").unwrap()
            );
            assert_eq!(merged.get_str("passwordHash").unwrap(), "$2b$10$abcdef");
            assert_eq!(merged.get_str("createdAt").unwrap(), "2023-01-01T00:00:00Z");
            assert_eq!(merged.get_array("students").unwrap().len(), 1);
        }
    }

    #[test]
    fn replace_lets_empty_incoming_overwrite() {
        let existing = existing_user();
        let incoming = doc! { "name": "" };

        let merged = merge_entity(&existing, &incoming, MergeStrategy::Replace, &USER_PROFILE);
        assert_eq!(merged.get_str("name").unwrap(), "");
    }

    #[test]
    fn merge_is_associative_for_disjoint_scalar_fields() {
        let existing = existing_user();
        let step_a = doc! { "contactNumber": "+351 111" };
        let step_b = doc! { "parentCity": "Funchal" };
        let combined = doc! { "contactNumber": "+351 111", "parentCity": "Funchal" };

        let sequential = merge_entity(
            &merge_entity(&existing, &step_a, MergeStrategy::Merge, &USER_PROFILE),
            &step_b,
            MergeStrategy::Merge,
            &USER_PROFILE,
        );
        let at_once = merge_entity(&existing, &combined, MergeStrategy::Merge, &USER_PROFILE);
        assert_eq!(sequential, at_once);
    }

    #[test]
    fn dashboard_merge_appends_cumulative_arrays() {
        let existing = doc! {
            "_id": ObjectId::new(),
            "studentId": ObjectId::new(),
            "history": [
                { "type": "enrollment_start", "date": "2023-09-01T00:00:00Z" },
            ],
            "portfolios": [],
        };
        let incoming = doc! {
            "history": [
                { "type": "receipt", "date": "2023-10-01T00:00:00Z", "paymentStatus": "paid" },
            ],
            "portfolios": [
                { "pdfUrl": "https://files.example/p.pdf", "fileName": "p.pdf" },
            ],
        };

        let merged = merge_entity(&existing, &incoming, MergeStrategy::Merge, &DASHBOARD_PROFILE);
        assert_eq!(merged.get_array("history").unwrap().len(), 2);
        assert_eq!(merged.get_array("portfolios").unwrap().len(), 1);
    }

    #[test]
    fn student_tag_list_replaces_instead_of_appending() {
        let existing = doc! {
            "_id": ObjectId::new(),
            "firstName": "Ana",
            "motivationForJoining": ["Other", "To be part of a community"],
        };
        let incoming = doc! { "motivationForJoining": ["Quality of teachers"] };

        let merged = merge_entity(&existing, &incoming, MergeStrategy::Merge, &STUDENT_PROFILE);
        let tags = merged.get_array("motivationForJoining").unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0], Bson::String("Quality of teachers".into()));
    }

    #[test]
    fn conflicts_require_both_sides_non_empty() {
        let existing = doc! {
            "_id": ObjectId::new(),
            "name": "First Parent",
            "contactNumber": "",
            "parentCity": "Funchal",
        };
        let incoming = doc! {
            "name": "Renamed Parent",
            "contactNumber": "+351 999",
            "parentCity": "",
            "parentCountry": "Portugal",
        };

        let conflicts = detect_conflicts(&existing, &incoming, &USER_PROFILE);
        let fields: Vec<_> = conflicts.iter().map(|c| c.field.as_str()).collect();
        // Only `name` has a real value on both sides that differs.
        assert_eq!(fields, vec!["name"]);
    }

    #[test]
    fn apply_merge_reports_changed_fields_only() {
        let existing = existing_user();
        let incoming = doc! { "email": "parent1@new.example" };
        let merged = merge_entity(&existing, &incoming, MergeStrategy::Merge, &USER_PROFILE);

        let outcome = apply_merge(&existing, merged);
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].field, "email");
        assert_eq!(
            outcome.changes[0].new_value,
            Bson::String("parent1@new.example".into())
        );
    }

    #[tokio::test]
    async fn user_duplicates_try_username_then_email() {
        use crate::store::MemStore;

        let store = MemStore::new();
        store
            .insert(doc! { "username": "parent1", "email": "p1@example.com" })
            .await
            .unwrap();
        store
            .insert(doc! { "username": "parent2", "email": "p2@example.com" })
            .await
            .unwrap();

        // Same username, different email owned by another account: both match.
        let incoming = doc! { "username": "parent1", "email": "p2@example.com" };
        let duplicates = find_user_duplicates(&store, &incoming).await.unwrap();
        assert_eq!(duplicates.len(), 2);
        assert_eq!(duplicates[0].match_type, "username");
        assert_eq!(duplicates[1].match_type, "email");
    }

    #[tokio::test]
    async fn incomplete_natural_key_is_a_pass() {
        use crate::store::MemStore;

        let store = MemStore::new();
        store
            .insert(doc! { "firstName": "Ana", "lastName": "Silva", "dateOfBirth": "2010-05-15T00:00:00Z" })
            .await
            .unwrap();

        let incoming = doc! { "firstName": "Ana" };
        let duplicates = find_student_duplicates(&store, &incoming).await.unwrap();
        assert!(duplicates.is_empty());
    }
}
