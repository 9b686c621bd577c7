use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{error, info};
use uuid::Uuid;

use courier_gateway::Gateway;
use courier_types::api::{Claims, LoginRequest, RegisterRequest, TokenResponse};
use courier_types::models::UserOut;

use crate::blocking;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub gateway: Gateway,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let phone = req.phone.trim().to_string();
    if phone.len() < 7 || phone.len() > 20 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.password.len() < 6 {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .to_string();

    let display_name = req
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| phone.clone());
    let user_id = Uuid::new_v4();

    let created = blocking(&state, move |db| {
        if db.get_user_by_phone(&phone)?.is_some() {
            return Ok(None);
        }
        db.create_user(user_id, &phone, Some(&display_name), &password_hash)
            .map(Some)
    })
    .await?;
    let user = created.ok_or(StatusCode::CONFLICT)?;

    info!("Registered {} ({})", user.phone, user.id);
    let token = issue_token(&state, user.id)?;
    Ok((StatusCode::CREATED, Json(TokenResponse::bearer(token))))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let phone = req.phone.trim().to_string();
    let (user_id, stored_hash) = blocking(&state, move |db| db.get_credentials(&phone))
        .await?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let parsed_hash =
        PasswordHash::new(&stored_hash).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let token = issue_token(&state, user_id)?;
    Ok(Json(TokenResponse::bearer(token)))
}

pub async fn me(Extension(user): Extension<UserOut>) -> Json<UserOut> {
    Json(user)
}

fn issue_token(state: &AppStateInner, user_id: Uuid) -> Result<String, StatusCode> {
    let claims = Claims {
        sub: user_id,
        exp: (chrono::Utc::now() + state.token_ttl).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(state.jwt_secret.as_bytes()),
    )
    .map_err(|e| {
        error!("Failed to sign token for {}: {}", user_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
