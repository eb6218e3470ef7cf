use actix_web::{web, HttpMessage, HttpRequest, HttpResponse, Responder};
use bcrypt::verify;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{info, warn};
use mongodb::bson::{doc, oid::ObjectId};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app_state::AppState;
use crate::models::User;
use crate::policy::{self, Action};

const MAX_LOGIN_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 30;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

// JWT Creation
pub fn create_jwt(user_id: &str, secret: &str, remember_me: bool) -> String {
    let lifetime = if remember_me {
        Duration::days(7)
    } else {
        Duration::hours(1)
    };
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now() + lifetime).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref())).unwrap()
}

// JWT Validation
pub fn verify_token(token: &str, secret: &str) -> Result<String, String> {
    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    ) {
        Ok(token_data) => Ok(token_data.claims.sub),
        Err(e) => Err(format!("Token decode error: {}", e)),
    }
}

/// Fetches the authenticated user for this request. The middleware put the
/// verified token subject into request extensions; everything past this
/// point receives the user as an explicit value.
pub async fn require_user(
    req: &HttpRequest,
    data: &web::Data<AppState>,
) -> Result<User, HttpResponse> {
    let user_id = req
        .extensions()
        .get::<String>()
        .cloned()
        .ok_or_else(|| HttpResponse::Unauthorized().json(json!({ "error": "Unauthorized" })))?;
    let oid = ObjectId::parse_str(&user_id)
        .map_err(|_| HttpResponse::Unauthorized().json(json!({ "error": "Unauthorized" })))?;

    match data.mongodb.users().find_one(doc! { "_id": oid }).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(HttpResponse::Unauthorized().json(json!({ "error": "User not found" }))),
        Err(e) => {
            warn!("Error loading authenticated user: {}", e);
            Err(HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" })))
        }
    }
}

pub fn authorize(user: &User, action: Action) -> Result<(), HttpResponse> {
    if policy::allows(user.role, action) {
        Ok(())
    } else {
        Err(HttpResponse::Forbidden().json(json!({ "error": "Permission denied" })))
    }
}

/// Password policy shared by signup and the user import endpoints.
pub fn validate_password(password: &str) -> Option<&'static str> {
    if password.len() < 8 {
        return Some("Password must be at least 8 characters long");
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Some("Password must contain at least one lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Some("Password must contain at least one uppercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Some("Password must contain at least one number");
    }
    if !password.chars().any(|c| "!@#$%^&*(),.?\":{}|<>".contains(c)) {
        return Some("Password must contain at least one special character (!@#$%^&*(),.?\":{}|<>)");
    }
    None
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

// Login Endpoint
pub async fn login(
    data: web::Data<AppState>,
    login_info: web::Json<LoginRequest>,
) -> impl Responder {
    let users = data.mongodb.users();

    let user = match users.find_one(doc! { "username": &login_info.username }).await {
        Ok(found) => found,
        Err(_) => {
            return HttpResponse::InternalServerError().json(json!({ "error": "Error logging in" }))
        }
    };

    if let Some(user) = &user {
        if let Some(lock_until) = user.lock_until {
            if lock_until > Utc::now() {
                let minutes_left = (lock_until - Utc::now()).num_minutes() + 1;
                info!("Login attempt for locked account: {}", user.username);
                return HttpResponse::build(actix_web::http::StatusCode::LOCKED).json(json!({
                    "error": format!(
                        "Account is locked due to too many failed login attempts. Please try again in {} minute(s).",
                        minutes_left
                    ),
                }));
            }
        }
    }

    let password_correct = user
        .as_ref()
        .and_then(|u| u.password_hash.as_deref())
        .map(|hash| verify(&login_info.password, hash).unwrap_or(false))
        .unwrap_or(false);

    let Some(user) = user else {
        info!("Failed login attempt for unknown username: {}", login_info.username);
        return HttpResponse::Unauthorized().json(json!({ "error": "Invalid username or password" }));
    };

    if !password_correct {
        info!("Failed login attempt for username: {}", user.username);
        let attempts = user.login_attempts + 1;
        let mut update = doc! { "$set": { "loginAttempts": attempts } };
        if attempts >= MAX_LOGIN_ATTEMPTS {
            warn!("Account locked for username: {} after {} failed attempts", user.username, attempts);
            let lock_until = Utc::now() + Duration::minutes(LOCKOUT_MINUTES);
            update = doc! { "$set": {
                "loginAttempts": attempts,
                "lockUntil": crate::export::stored_date(lock_until),
            } };
        }
        if let Some(id) = user.id {
            let _ = users.update_one(doc! { "_id": id }, update).await;
        }
        return HttpResponse::Unauthorized().json(json!({ "error": "Invalid username or password" }));
    }

    if user.is_archived {
        info!("Archived account login attempt: {}", user.username);
        return HttpResponse::Forbidden().json(json!({
            "error": "This account has been archived. Please contact an administrator.",
        }));
    }

    if user.login_attempts > 0 || user.lock_until.is_some() {
        if let Some(id) = user.id {
            let _ = users
                .update_one(
                    doc! { "_id": id },
                    doc! { "$set": { "loginAttempts": 0 }, "$unset": { "lockUntil": "" } },
                )
                .await;
        }
    }

    let user_id = user.id.map(|id| id.to_hex()).unwrap_or_default();
    let token = create_jwt(&user_id, &data.config.jwt_secret, login_info.remember_me);

    HttpResponse::Ok().json(json!({
        "token": token,
        "id": user_id,
        "username": user.username,
        "name": user.name,
        "email": user.email,
        "role": user.role,
        "isGAMember": user.is_ga_member,
        "contactNumber": user.contact_number,
        "parentStreetAddress": user.parent_street_address,
        "parentCity": user.parent_city,
        "parentPostalCode": user.parent_postal_code,
        "parentCountry": user.parent_country,
        "parentNationality": user.parent_nationality,
        "parentPassportNumber": user.parent_passport_number,
        "parentPassportExpiryDate": user.parent_passport_expiry_date,
        "parentNifNumber": user.parent_nif_number,
        "emergencyContactRelationship": user.emergency_contact_relationship,
        "emergencyContactName": user.emergency_contact_name,
        "emergencyContactNumber": user.emergency_contact_number,
        "rememberMe": login_info.remember_me,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_policy_flags_each_missing_class() {
        assert!(validate_password("Short1!").is_some());
        assert!(validate_password("alllowercase1!").unwrap().contains("uppercase"));
        assert!(validate_password("ALLUPPERCASE1!").unwrap().contains("lowercase"));
        assert!(validate_password("NoNumbers!!").unwrap().contains("number"));
        assert!(validate_password("NoSpecial123A").unwrap().contains("special"));
        assert!(validate_password("GoodPass1!").is_none());
    }

    #[test]
    fn token_round_trips_subject() {
        let token = create_jwt("abc123", "test-secret", false);
        assert_eq!(verify_token(&token, "test-secret").unwrap(), "abc123");
        assert!(verify_token(&token, "wrong-secret").is_err());
    }
}
